//! Per-user unread counters.
//!
//! [`UnreadCounter`] keeps a count per conversation plus a cached total.
//! The total is always derived from the per-conversation map, including
//! when a counter is deserialized, so `total == sum(per_conversation)`
//! holds for every value of the type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, UserId};

/// Unread message counts for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CounterRepr", into = "CounterRepr")]
pub struct UnreadCounter {
    user_id: UserId,
    per_conversation: BTreeMap<ConversationId, u32>,
    total: u32,
}

/// Serialized form. `total` is written for readers but ignored on input.
#[derive(Serialize, Deserialize)]
struct CounterRepr {
    user_id: UserId,
    per_conversation: BTreeMap<ConversationId, u32>,
    #[serde(default)]
    total: u32,
}

impl From<CounterRepr> for UnreadCounter {
    fn from(repr: CounterRepr) -> Self {
        Self::from_counts(repr.user_id, repr.per_conversation)
    }
}

impl From<UnreadCounter> for CounterRepr {
    fn from(counter: UnreadCounter) -> Self {
        Self {
            user_id: counter.user_id,
            per_conversation: counter.per_conversation,
            total: counter.total,
        }
    }
}

impl UnreadCounter {
    /// An empty counter.
    #[must_use]
    pub const fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            per_conversation: BTreeMap::new(),
            total: 0,
        }
    }

    /// Builds a counter from explicit counts. Zero entries are dropped.
    #[must_use]
    pub fn from_counts(user_id: UserId, counts: BTreeMap<ConversationId, u32>) -> Self {
        let mut counter = Self::new(user_id);
        counter.replace(counts);
        counter
    }

    /// Owner of this counter.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Sum of all per-conversation counts.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    /// Unread count for one conversation.
    #[must_use]
    pub fn count(&self, conversation: &ConversationId) -> u32 {
        self.per_conversation.get(conversation).copied().unwrap_or(0)
    }

    /// All non-zero per-conversation counts.
    #[must_use]
    pub const fn per_conversation(&self) -> &BTreeMap<ConversationId, u32> {
        &self.per_conversation
    }

    /// Adds one unread message to `conversation`, returning its new count.
    pub fn increment(&mut self, conversation: &ConversationId) -> u32 {
        let count = self.per_conversation.entry(conversation.clone()).or_insert(0);
        *count = count.saturating_add(1);
        let new_count = *count;
        self.recompute();
        new_count
    }

    /// Zeroes `conversation`, returning how many unread messages it had.
    pub fn clear(&mut self, conversation: &ConversationId) -> u32 {
        let removed = self.per_conversation.remove(conversation).unwrap_or(0);
        self.recompute();
        removed
    }

    /// Replaces every count with `counts`.
    pub fn replace(&mut self, counts: BTreeMap<ConversationId, u32>) {
        self.per_conversation = counts.into_iter().filter(|(_, n)| *n > 0).collect();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.total = self
            .per_conversation
            .values()
            .fold(0u32, |acc, n| acc.saturating_add(*n));
    }
}
