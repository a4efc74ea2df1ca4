//! Message send, per-recipient delivery, and deletion.
//!
//! A send is validated, authorized, uploaded, and persisted before anything
//! is emitted. Emission is best effort: an offline recipient simply has
//! nothing to receive, and reconciliation catches them up on their next
//! join.

use std::collections::BTreeMap;

use courier_proto::event::ServerEvent;
use courier_proto::message::{
    Attachment, AttachmentUpload, ConversationId, Message, MessageId, Recipient, Timestamp,
    UserId, ValidationError, validate_content,
};
use tokio_util::sync::CancellationToken;

use crate::dedup::Fingerprint;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::{Backend, MessageDraft, Tombstone};

struct UploadedAttachment {
    upload_id: String,
    token: CancellationToken,
    attachment: Attachment,
}

impl<B: Backend> Engine<B> {
    /// Sends a message from `sender` to a user or a group.
    ///
    /// Returns the persisted message. Fan-out is skipped for a message whose
    /// fingerprint was seen within the dedup window, but it is still stored.
    ///
    /// # Errors
    ///
    /// Validation, authorization, and persistence failures abort the send
    /// before anything is emitted. A cancelled upload returns
    /// [`EngineError::Cancelled`] and stores nothing.
    pub async fn send(
        &self,
        sender: &UserId,
        recipient: Recipient,
        content: String,
        attachment: Option<AttachmentUpload>,
    ) -> Result<Message, EngineError> {
        match recipient {
            Recipient::User(peer) => self.send_direct(sender, peer, content, attachment).await,
            Recipient::Group(group_id) => {
                self.send_group(sender, &group_id, content, attachment)
                    .await
            }
        }
    }

    async fn send_direct(
        &self,
        sender: &UserId,
        peer: UserId,
        content: String,
        attachment: Option<AttachmentUpload>,
    ) -> Result<Message, EngineError> {
        self.validate(&content, attachment.as_ref())?;
        if !self.backend.can_message(sender, &peer).await? {
            return Err(EngineError::Authorization(format!(
                "{sender} may not message {peer}"
            )));
        }

        let (message, fresh) = self
            .persist(sender, Recipient::User(peer.clone()), content, attachment)
            .await?;
        if fresh {
            self.deliver_to(&peer, &message).await;
        }
        Ok(message)
    }

    pub(crate) fn validate(
        &self,
        content: &str,
        attachment: Option<&AttachmentUpload>,
    ) -> Result<(), EngineError> {
        validate_content(content, attachment.is_some(), self.config.max_content_len)?;
        if let Some(upload) = attachment
            && upload.data.len() > self.config.max_attachment_size
        {
            return Err(ValidationError::TooLarge {
                size: upload.data.len(),
                max: self.config.max_attachment_size,
            }
            .into());
        }
        Ok(())
    }

    /// Uploads, persists, and echoes a message to its sender.
    ///
    /// Returns the stored message and whether it is the first sighting of its
    /// fingerprint. Duplicates are stored but not echoed.
    pub(crate) async fn persist(
        &self,
        sender: &UserId,
        recipient: Recipient,
        content: String,
        attachment: Option<AttachmentUpload>,
    ) -> Result<(Message, bool), EngineError> {
        let conversation_id = recipient.conversation_with(sender);

        let uploaded = match attachment {
            Some(upload) => Some(self.upload(sender, upload).await?),
            None => None,
        };

        if let Some(up) = &uploaded
            && up.token.is_cancelled()
        {
            self.uploads.finish(sender, &up.upload_id);
            return Err(EngineError::Cancelled(up.upload_id.clone()));
        }

        let draft = MessageDraft {
            conversation_id: conversation_id.clone(),
            sender_id: sender.clone(),
            recipient: recipient.clone(),
            content,
            attachment: uploaded.as_ref().map(|up| up.attachment.clone()),
        };
        let stored = self.backend.insert_message(draft).await;
        if let Some(up) = &uploaded {
            self.uploads.finish(sender, &up.upload_id);
        }
        let message = stored?;
        tracing::debug!(
            sender = %sender,
            recipient = %recipient,
            message_id = %message.id,
            "message persisted"
        );

        self.presence.stop_typing(sender, &conversation_id);

        let fp = Fingerprint::message(
            "send",
            sender,
            &recipient,
            message.content(),
            message.created_at,
            self.config.bucket_ms(),
        );
        if !self.dedup.check_and_remember(fp) {
            tracing::debug!(sender = %sender, message_id = %message.id, "duplicate send, fan-out suppressed");
            return Ok((message, false));
        }

        self.sessions
            .emit(sender, &ServerEvent::SendMessageToSender(message.clone()));
        Ok((message, true))
    }

    async fn upload(
        &self,
        sender: &UserId,
        upload: AttachmentUpload,
    ) -> Result<UploadedAttachment, EngineError> {
        let upload_id = upload.upload_id.clone();
        let token = self.uploads.token_for(sender, &upload_id);

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(EngineError::Cancelled(upload_id.clone())),
            stored = self.backend.put(upload) => stored.map_err(EngineError::from),
        };

        match result {
            Ok(attachment) => Ok(UploadedAttachment {
                upload_id,
                token,
                attachment,
            }),
            Err(e) => {
                self.uploads.finish(sender, &upload_id);
                Err(e)
            }
        }
    }

    /// Delivers a stored message to every session of one recipient.
    ///
    /// If the recipient has the conversation open on any session the message
    /// is read on arrival and the sender gets a receipt. Otherwise the
    /// recipient's unread counter is bumped and, unless muted, a toast sent.
    pub(crate) async fn deliver_to(&self, recipient: &UserId, message: &Message) {
        let connections = self.sessions.route_to(recipient);
        if connections.is_empty() {
            tracing::debug!(user_id = %recipient, message_id = %message.id, "recipient offline, left for reconciliation");
        } else {
            self.sessions.emit(
                recipient,
                &ServerEvent::SendMessageToReceiver(message.clone()),
            );
        }

        if self
            .views
            .is_viewing(&connections, &message.conversation_id)
        {
            match self
                .backend
                .mark_read(&message.conversation_id, recipient, Timestamp::now())
                .await
            {
                Ok(read) => self.send_receipts(recipient, &message.conversation_id, &read),
                Err(e) => {
                    tracing::warn!(user_id = %recipient, message_id = %message.id, error = %e, "failed to mark message read on arrival");
                }
            }
            return;
        }

        if let Some(counter) = self.unread.on_message_received(recipient, message) {
            self.sessions
                .emit(recipient, &ServerEvent::UnreadCounts(counter));
            self.sessions.emit(
                recipient,
                &ServerEvent::NewMessage {
                    content: message.content().to_string(),
                    receiver_id: message.recipient.clone(),
                    sender_id: message.sender_id.clone(),
                    conversation_id: message.conversation_id.clone(),
                },
            );
        }
    }

    /// Sends one `messages_read` receipt per original sender.
    pub(crate) fn send_receipts(
        &self,
        reader: &UserId,
        conversation: &ConversationId,
        read: &[Message],
    ) {
        let mut per_sender: BTreeMap<&UserId, u32> = BTreeMap::new();
        for message in read.iter().filter(|m| m.sender_id != *reader) {
            *per_sender.entry(&message.sender_id).or_default() += 1;
        }
        for (sender, read_count) in per_sender {
            tracing::debug!(reader = %reader, sender = %sender, conversation = %conversation, read_count, "read receipt");
            self.sessions.emit(
                sender,
                &ServerEvent::MessagesRead {
                    receiver_id: reader.clone(),
                    conversation_id: conversation.clone(),
                    read_count,
                },
            );
        }
    }

    /// Tombstones one of `by_user`'s messages.
    ///
    /// The first delete notifies every participant; repeats succeed without
    /// emitting anything.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the message does not exist and
    /// [`EngineError::Authorization`] if `by_user` did not send it.
    pub async fn delete(&self, id: &MessageId, by_user: &UserId) -> Result<Message, EngineError> {
        let message = self
            .backend
            .message(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("message {id}")))?;
        if message.sender_id != *by_user {
            return Err(EngineError::Authorization(format!(
                "{by_user} did not send message {id}"
            )));
        }

        match self
            .backend
            .tombstone(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("message {id}")))?
        {
            Tombstone::Applied(message) => {
                let participants = self.participants(&message).await;
                let event = ServerEvent::MessageDeleted {
                    id: message.id.clone(),
                    receiver_id: message.recipient.clone(),
                    conversation_id: message.conversation_id.clone(),
                };
                let reached = self.sessions.emit_all(&participants, &event);
                tracing::info!(user_id = %by_user, message_id = %id, reached, "message deleted");
                Ok(message)
            }
            Tombstone::AlreadyDeleted(message) => {
                tracing::debug!(user_id = %by_user, message_id = %id, "message already deleted");
                Ok(message)
            }
        }
    }

    async fn participants(&self, message: &Message) -> Vec<UserId> {
        match &message.recipient {
            Recipient::User(peer) => vec![message.sender_id.clone(), peer.clone()],
            Recipient::Group(group_id) => {
                let mut members: Vec<UserId> = match self.backend.group(group_id).await {
                    Ok(Some(group)) => group.member_ids.into_iter().collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(group_id = %group_id, error = %e, "group lookup failed during delete");
                        Vec::new()
                    }
                };
                if !members.contains(&message.sender_id) {
                    members.push(message.sender_id.clone());
                }
                members
            }
        }
    }
}
