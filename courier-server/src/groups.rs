//! Group message fan-out and membership broadcasts.
//!
//! Membership is resolved from the directory at the moment it matters, never
//! cached: once when authorizing a send, and again after the message is
//! persisted to decide who receives it. A member who leaves in between does
//! not get the message.

use std::collections::BTreeSet;

use courier_proto::event::ServerEvent;
use courier_proto::group::{MembershipChange, MembershipUpdate};
use courier_proto::message::{AttachmentUpload, ConversationId, GroupId, Message, Recipient, UserId};

use crate::dedup::Fingerprint;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::Backend;

impl<B: Backend> Engine<B> {
    /// Sends a message to every current member of a group.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the group does not exist,
    /// [`EngineError::Authorization`] if `sender` is not a member, plus the
    /// validation and persistence errors of a direct send.
    pub async fn send_group(
        &self,
        sender: &UserId,
        group_id: &GroupId,
        content: String,
        attachment: Option<AttachmentUpload>,
    ) -> Result<Message, EngineError> {
        self.validate(&content, attachment.as_ref())?;
        let group = self
            .backend
            .group(group_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;
        if !group.is_member(sender) {
            return Err(EngineError::Authorization(format!(
                "{sender} is not a member of {group_id}"
            )));
        }

        let (message, fresh) = self
            .persist(sender, Recipient::Group(group_id.clone()), content, attachment)
            .await?;
        if fresh {
            self.fan_out(sender, group_id, &message).await;
        }
        Ok(message)
    }

    async fn fan_out(&self, sender: &UserId, group_id: &GroupId, message: &Message) {
        let members = match self.backend.group(group_id).await {
            Ok(Some(group)) => group.member_ids,
            Ok(None) => {
                tracing::info!(group_id = %group_id, message_id = %message.id, "group deleted before fan-out, message kept");
                return;
            }
            Err(e) => {
                tracing::warn!(group_id = %group_id, message_id = %message.id, error = %e, "membership lookup failed, message not fanned out");
                return;
            }
        };

        let recipients: Vec<&UserId> = members.iter().filter(|m| *m != sender).collect();
        tracing::debug!(group_id = %group_id, message_id = %message.id, recipients = recipients.len(), "group fan-out");
        for member in recipients {
            self.deliver_to(member, message).await;
        }
    }

    /// Broadcasts a membership change to the users it concerns.
    ///
    /// Returns the number of sessions reached. An update already broadcast
    /// within the dedup window (same revision) is dropped and reaches nobody.
    pub async fn membership_changed(&self, update: MembershipUpdate) -> usize {
        let fp = Fingerprint::of(&("membership", &update));
        if !self.dedup.check_and_remember(fp) {
            tracing::debug!(group_id = %update.change.group_id(), revision = update.revision, "duplicate membership change suppressed");
            return 0;
        }
        let MembershipUpdate { revision, change } = update;

        let group_id = change.group_id().clone();
        let mut audience: BTreeSet<UserId> = match &change {
            MembershipChange::Created(group) => group.member_ids.clone(),
            MembershipChange::Deleted { member_ids, .. } => member_ids.clone(),
            MembershipChange::Joined { .. }
            | MembershipChange::Added { .. }
            | MembershipChange::MemberLeft { .. } => self.current_members(&group_id).await,
        };
        match &change {
            MembershipChange::Joined { user_id, .. }
            | MembershipChange::Added { user_id, .. }
            | MembershipChange::MemberLeft { user_id, .. } => {
                audience.insert(user_id.clone());
            }
            MembershipChange::Created(_) | MembershipChange::Deleted { .. } => {}
        }

        let conversation = ConversationId::group(&group_id);
        match &change {
            MembershipChange::MemberLeft { user_id, .. } => {
                self.leave_conversation(user_id, &conversation);
            }
            MembershipChange::Deleted { member_ids, .. } => {
                for member in member_ids {
                    self.leave_conversation(member, &conversation);
                }
            }
            _ => {}
        }

        let event = ServerEvent::from(change);
        let reached = self.sessions.emit_all(&audience, &event);
        tracing::info!(group_id = %group_id, revision, event = event.name(), audience = audience.len(), reached, "membership change broadcast");
        reached
    }

    async fn current_members(&self, group_id: &GroupId) -> BTreeSet<UserId> {
        match self.backend.group(group_id).await {
            Ok(Some(group)) => group.member_ids,
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(group_id = %group_id, error = %e, "membership lookup failed");
                BTreeSet::new()
            }
        }
    }

    /// Closes a user's views of a conversation and zeroes its counter.
    fn leave_conversation(&self, user: &UserId, conversation: &ConversationId) {
        let connections = self.sessions.route_to(user);
        self.views.close_for(&connections, conversation);
        let (removed, counter) = self.unread.clear(user, conversation);
        if removed > 0 {
            self.sessions
                .emit(user, &ServerEvent::UnreadCounts(counter));
        }
    }
}
