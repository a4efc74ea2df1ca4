//! Presence and typing indicators.
//!
//! Presence is derived entirely from the session registry's transitions;
//! this module only fans them out and remembers when each user was last
//! seen. Typing state is ephemeral, keyed by (typist, conversation), and
//! expires on its own if the client stops refreshing it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_proto::event::ServerEvent;
use courier_proto::message::{ConversationId, Timestamp, UserId};
use courier_proto::presence::PresenceState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::sessions::SessionRegistry;

/// Default typing window before an unrefreshed indicator expires.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

type TypingKey = (UserId, ConversationId);

#[derive(Debug)]
struct TypingEntry {
    generation: u64,
    audience: Vec<UserId>,
}

/// Tracks last-seen times and typing indicators, and broadcasts both.
pub struct PresenceTracker {
    sessions: Arc<SessionRegistry>,
    typing: DashMap<TypingKey, TypingEntry>,
    last_seen: DashMap<UserId, Timestamp>,
    timeout: Duration,
    generation: AtomicU64,
}

impl PresenceTracker {
    /// Creates a tracker that emits through `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>, timeout: Duration) -> Self {
        Self {
            sessions,
            typing: DashMap::new(),
            last_seen: DashMap::new(),
            timeout,
            generation: AtomicU64::new(0),
        }
    }

    /// Broadcasts `online` for `user` to `contacts`.
    pub fn went_online(&self, user: &UserId, contacts: &[UserId]) {
        let event = ServerEvent::Online {
            user_id: user.clone(),
        };
        let reached = self.sessions.emit_all(contacts, &event);
        tracing::info!(user_id = %user, contacts = contacts.len(), reached, "user online");
    }

    /// Records the last-seen time, clears typing state, and broadcasts
    /// `offline` for `user` to `contacts`.
    pub fn went_offline(&self, user: &UserId, contacts: &[UserId]) -> Timestamp {
        let last_seen_at = Timestamp::now();
        self.last_seen.insert(user.clone(), last_seen_at);
        let cleared = self.clear_user(user);

        let event = ServerEvent::Offline {
            user_id: user.clone(),
            last_seen_at: Some(last_seen_at),
        };
        let reached = self.sessions.emit_all(contacts, &event);
        tracing::info!(user_id = %user, contacts = contacts.len(), reached, cleared, "user offline");
        last_seen_at
    }

    /// Current presence of a user.
    #[must_use]
    pub fn state(&self, user: &UserId) -> PresenceState {
        if self.sessions.is_online(user) {
            PresenceState::online(user.clone())
        } else {
            PresenceState::offline(user.clone(), self.last_seen.get(user).map(|t| *t))
        }
    }

    /// Registers a typing signal from `user` in `conversation`.
    ///
    /// `is_typing` is emitted to `audience` only on the not-typing to typing
    /// edge. Every call restarts the expiry window. Returns `true` on the edge.
    pub fn typing(
        self: &Arc<Self>,
        user: &UserId,
        conversation: &ConversationId,
        audience: Vec<UserId>,
    ) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (user.clone(), conversation.clone());

        let started = match self.typing.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.generation = generation;
                entry.audience = audience;
                None
            }
            Entry::Vacant(entry) => {
                let targets = audience.clone();
                entry.insert(TypingEntry {
                    generation,
                    audience,
                });
                Some(targets)
            }
        };

        let edge = started.is_some();
        if let Some(audience) = started {
            let event = ServerEvent::IsTyping {
                user_id: user.clone(),
                conversation_id: conversation.clone(),
            };
            self.sessions.emit_all(&audience, &event);
            tracing::debug!(user_id = %user, conversation = %conversation, "typing started");
        }

        self.schedule_expiry(key, generation);
        edge
    }

    fn schedule_expiry(self: &Arc<Self>, key: TypingKey, generation: u64) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(&key, generation);
            }
        });
    }

    fn expire(&self, key: &TypingKey, generation: u64) {
        if let Some(((user, conversation), entry)) = self
            .typing
            .remove_if(key, |_, entry| entry.generation == generation)
        {
            tracing::debug!(user_id = %user, conversation = %conversation, "typing expired");
            self.emit_not_typing(&user, &conversation, &entry.audience);
        }
    }

    /// Ends a typing indicator. Returns `false` if the user was not typing.
    pub fn stop_typing(&self, user: &UserId, conversation: &ConversationId) -> bool {
        let key = (user.clone(), conversation.clone());
        match self.typing.remove(&key) {
            Some((_, entry)) => {
                self.emit_not_typing(user, conversation, &entry.audience);
                true
            }
            None => false,
        }
    }

    /// Ends every typing indicator of a user; returns how many were active.
    pub fn clear_user(&self, user: &UserId) -> usize {
        let keys: Vec<TypingKey> = self
            .typing
            .iter()
            .filter(|entry| entry.key().0 == *user)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = 0;
        for key in keys {
            if let Some(((user, conversation), entry)) = self.typing.remove(&key) {
                self.emit_not_typing(&user, &conversation, &entry.audience);
                cleared += 1;
            }
        }
        cleared
    }

    /// Whether `user` is currently typing in `conversation`.
    #[must_use]
    pub fn is_typing(&self, user: &UserId, conversation: &ConversationId) -> bool {
        self.typing
            .contains_key(&(user.clone(), conversation.clone()))
    }

    fn emit_not_typing(&self, user: &UserId, conversation: &ConversationId, audience: &[UserId]) {
        let event = ServerEvent::NotTyping {
            user_id: user.clone(),
            conversation_id: conversation.clone(),
        };
        self.sessions.emit_all(audience, &event);
    }
}
