//! Unread badge counters and mute state.
//!
//! The aggregator keeps a per-user cache of [`UnreadCounter`]s that is
//! rebuilt from the store on every join and sync, and adjusted live in
//! between. It decides what to count; emitting the results is left to the
//! caller so the counter update and the event stay on the same path.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use courier_proto::message::{ConversationId, Message, UserId};
use courier_proto::unread::UnreadCounter;
use dashmap::DashMap;

use crate::dedup::{DedupCache, Fingerprint};

/// Per-user unread counters and muted conversations.
pub struct NotificationAggregator {
    counters: DashMap<UserId, UnreadCounter>,
    muted: DashMap<UserId, HashSet<ConversationId>>,
    dedup: Arc<DedupCache>,
    bucket_ms: u64,
}

impl NotificationAggregator {
    /// Creates an aggregator that deduplicates increments through `dedup`,
    /// treating sends within the same `bucket_ms` window as one.
    #[must_use]
    pub fn new(dedup: Arc<DedupCache>, bucket_ms: u64) -> Self {
        Self {
            counters: DashMap::new(),
            muted: DashMap::new(),
            dedup,
            bucket_ms,
        }
    }

    /// Counts a message that `recipient` received while not viewing it.
    ///
    /// Returns the updated counter, or `None` if nothing changed because the
    /// conversation is muted or the same message was already counted.
    pub fn on_message_received(
        &self,
        recipient: &UserId,
        message: &Message,
    ) -> Option<UnreadCounter> {
        if self.is_muted(recipient, &message.conversation_id) {
            return None;
        }
        // Scoped to the conversation: the same text sent into a DM and a
        // shared group is two messages, not a retry.
        let fp = Fingerprint::of(&(
            "unread",
            &message.sender_id,
            recipient,
            &message.conversation_id,
            message.content(),
            message.created_at.bucket(self.bucket_ms),
        ));
        if !self.dedup.check_and_remember(fp) {
            tracing::debug!(user_id = %recipient, message_id = %message.id, "duplicate unread increment suppressed");
            return None;
        }

        let mut counter = self
            .counters
            .entry(recipient.clone())
            .or_insert_with(|| UnreadCounter::new(recipient.clone()));
        counter.increment(&message.conversation_id);
        Some(counter.clone())
    }

    /// Zeroes one conversation's count.
    ///
    /// Returns the number removed and the counter after the change.
    pub fn clear(&self, user: &UserId, conversation: &ConversationId) -> (u32, UnreadCounter) {
        let mut counter = self
            .counters
            .entry(user.clone())
            .or_insert_with(|| UnreadCounter::new(user.clone()));
        let removed = counter.clear(conversation);
        (removed, counter.clone())
    }

    /// Replaces the cached counters with store-computed counts, leaving muted
    /// conversations at zero.
    pub fn reconcile(
        &self,
        user: &UserId,
        mut counts: BTreeMap<ConversationId, u32>,
    ) -> UnreadCounter {
        if let Some(muted) = self.muted.get(user) {
            counts.retain(|conversation, _| !muted.contains(conversation));
        }
        let mut counter = self
            .counters
            .entry(user.clone())
            .or_insert_with(|| UnreadCounter::new(user.clone()));
        counter.replace(counts);
        counter.clone()
    }

    /// Mutes or unmutes a conversation for a user.
    ///
    /// Muting clears the conversation's count; the returned counter reflects
    /// that. Unmuting does not restore earlier counts.
    pub fn set_muted(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        muted: bool,
    ) -> UnreadCounter {
        if muted {
            self.muted
                .entry(user.clone())
                .or_default()
                .insert(conversation.clone());
            self.clear(user, conversation).1
        } else {
            if let Some(mut set) = self.muted.get_mut(user) {
                set.remove(conversation);
            }
            self.snapshot(user)
        }
    }

    /// Whether a user muted a conversation.
    #[must_use]
    pub fn is_muted(&self, user: &UserId, conversation: &ConversationId) -> bool {
        self.muted
            .get(user)
            .is_some_and(|set| set.contains(conversation))
    }

    /// Current cached counter of a user.
    #[must_use]
    pub fn snapshot(&self, user: &UserId) -> UnreadCounter {
        self.counters
            .get(user)
            .map_or_else(|| UnreadCounter::new(user.clone()), |c| c.clone())
    }
}
