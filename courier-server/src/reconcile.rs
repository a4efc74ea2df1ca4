//! Server side of reconciliation: sync snapshots and conversation opens.
//!
//! Live events are best effort, so every join (and every explicit `sync`)
//! rebuilds the picture from the store. Opening a conversation is where
//! read state is settled: anything still unread for the viewer when the
//! view becomes live is marked read in one pass.

use std::collections::HashMap;

use courier_proto::event::ServerEvent;
use courier_proto::message::{MessageId, ReadStatus, Recipient, Timestamp, UserId};
use courier_proto::presence::PresenceState;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::sessions::ConnectionId;
use crate::store::Backend;

impl<B: Backend> Engine<B> {
    /// Builds the `synced` snapshot for `user`.
    ///
    /// Unread counts are recomputed from the store and replace the cached
    /// counters. Presence covers every contact.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the store cannot be queried.
    pub async fn sync_snapshot(&self, user: &UserId) -> Result<ServerEvent, EngineError> {
        let counts = self.backend.unread_counts(user).await?;
        let unread = self.unread.reconcile(user, counts);
        let contacts = self.backend.contacts(user).await?;
        let presence: Vec<PresenceState> = contacts.iter().map(|c| self.presence.state(c)).collect();
        tracing::debug!(user_id = %user, total = unread.total(), contacts = presence.len(), "sync snapshot");
        Ok(ServerEvent::Synced { unread, presence })
    }

    /// Opens a conversation view on `connection`.
    ///
    /// The view is `Opening` while history loads and becomes `Open` once it
    /// has been read; then every message still unread for the viewer is
    /// marked read, each sender gets a receipt, and the viewer's counter is
    /// cleared across all their sessions. With `with_history` the connection
    /// also receives `receive_messages`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] or [`EngineError::Authorization`] for a group
    /// the viewer cannot see, and [`EngineError::Persistence`] for store
    /// failures. A failed open leaves the view closed, unless it was already
    /// open before the call.
    pub async fn open_conversation(
        &self,
        connection: ConnectionId,
        viewer: &UserId,
        target: &Recipient,
        with_history: bool,
    ) -> Result<(), EngineError> {
        if let Recipient::Group(group_id) = target {
            let group = self
                .backend
                .group(group_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;
            if !group.is_member(viewer) {
                return Err(EngineError::Authorization(format!(
                    "{viewer} is not a member of {group_id}"
                )));
            }
        }

        let conversation = target.conversation_with(viewer);
        let was_open = self.views.begin_open(connection, &conversation);

        let history = if with_history {
            match self
                .backend
                .history(&conversation, viewer, self.config.history_limit)
                .await
            {
                Ok(messages) => Some(messages),
                Err(e) => {
                    if !was_open {
                        self.views.close(connection, &conversation);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let live = self.views.finish_open(connection, &conversation);
        let read = if live {
            let read = match self
                .backend
                .mark_read(&conversation, viewer, Timestamp::now())
                .await
            {
                Ok(read) => read,
                Err(e) => {
                    if !was_open {
                        self.views.close(connection, &conversation);
                    }
                    return Err(e.into());
                }
            };
            self.send_receipts(viewer, &conversation, &read);
            let (removed, counter) = self.unread.clear(viewer, &conversation);
            tracing::debug!(
                user_id = %viewer,
                connection = %connection,
                conversation = %conversation,
                marked = read.len(),
                removed,
                "conversation opened"
            );
            self.sessions
                .emit(viewer, &ServerEvent::UnreadCounts(counter));
            read
        } else {
            tracing::debug!(user_id = %viewer, connection = %connection, conversation = %conversation, "view closed while opening");
            Vec::new()
        };

        if let Some(mut messages) = history {
            let statuses: HashMap<&MessageId, ReadStatus> =
                read.iter().map(|m| (&m.id, m.read_status())).collect();
            for message in &mut messages {
                if let Some(status) = statuses.get(&message.id) {
                    message.merge_read_status(status);
                }
            }
            self.sessions.emit_to(
                connection,
                &ServerEvent::ReceiveMessages {
                    conversation_id: conversation,
                    messages,
                },
            );
        }
        Ok(())
    }
}
