//! Session registry: maps user ids to their live connections.
//!
//! A user may hold several sessions at once (multi-device). The registry is
//! the only component that observes sessions being created and destroyed,
//! so it is also the sole source of presence transitions: the first session
//! of a user publishes [`PresenceTransition::Online`], the last one to close
//! publishes [`PresenceTransition::Offline`].
//!
//! Transitions are published while the user's shard lock is held, which
//! totally orders them per user even when connects and disconnects race.
//! Nothing here is persisted; clients re-register after a restart.

use std::sync::atomic::{AtomicU64, Ordering};

use courier_proto::event::ServerEvent;
use courier_proto::message::{Timestamp, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

/// Server-assigned identifier of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Returns the numeric value of this id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection owned by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Owner of the session.
    pub user_id: UserId,
    /// The connection backing the session.
    pub connection_id: ConnectionId,
    /// When the session registered.
    pub connected_at: Timestamp,
}

/// A change in whether a user has any live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    /// The user's first session registered.
    Online(UserId),
    /// The user's last session closed.
    Offline(UserId),
}

/// Sending half of a session's outbound event channel.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct SessionHandle {
    session: Session,
    tx: EventSender,
}

/// Concurrent registry of live sessions, sharded by user id.
pub struct SessionRegistry {
    by_user: DashMap<UserId, Vec<SessionHandle>>,
    owners: DashMap<ConnectionId, UserId>,
    next_id: AtomicU64,
    transitions: mpsc::UnboundedSender<PresenceTransition>,
}

impl SessionRegistry {
    /// Creates an empty registry and the receiver for its presence transitions.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenceTransition>) {
        let (transitions, rx) = mpsc::unbounded_channel();
        let registry = Self {
            by_user: DashMap::new(),
            owners: DashMap::new(),
            next_id: AtomicU64::new(0),
            transitions,
        };
        (registry, rx)
    }

    /// Adds a session for `user_id`.
    ///
    /// Returns the new connection id and whether this is the user's first
    /// active session (offline to online).
    pub fn register(&self, user_id: &UserId, tx: EventSender) -> (ConnectionId, bool) {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.owners.insert(connection_id, user_id.clone());

        let mut sessions = self.by_user.entry(user_id.clone()).or_default();
        sessions.push(SessionHandle {
            session: Session {
                user_id: user_id.clone(),
                connection_id,
                connected_at: Timestamp::now(),
            },
            tx,
        });
        let first = sessions.len() == 1;
        if first {
            let _ = self
                .transitions
                .send(PresenceTransition::Online(user_id.clone()));
        }
        drop(sessions);

        tracing::debug!(user_id = %user_id, connection = %connection_id, first, "session registered");
        (connection_id, first)
    }

    /// Removes a session.
    ///
    /// Returns the owning user and whether this was their last session
    /// (online to offline), or `None` if the connection was not registered.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<(UserId, bool)> {
        let (_, user_id) = self.owners.remove(&connection_id)?;

        let last = match self.by_user.entry(user_id.clone()) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .retain(|h| h.session.connection_id != connection_id);
                if entry.get().is_empty() {
                    let _ = self
                        .transitions
                        .send(PresenceTransition::Offline(user_id.clone()));
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        };

        tracing::debug!(user_id = %user_id, connection = %connection_id, last, "session unregistered");
        Some((user_id, last))
    }

    /// Active connection ids of a user (possibly none).
    #[must_use]
    pub fn route_to(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(user_id)
            .map(|sessions| sessions.iter().map(|h| h.session.connection_id).collect())
            .unwrap_or_default()
    }

    /// Snapshot of a user's sessions.
    #[must_use]
    pub fn sessions(&self, user_id: &UserId) -> Vec<Session> {
        self.by_user
            .get(user_id)
            .map(|sessions| sessions.iter().map(|h| h.session.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live session.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.by_user
            .get(user_id)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// Owner of a connection.
    #[must_use]
    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.owners.get(&connection_id).map(|u| u.value().clone())
    }

    /// Total number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Sends an event to every session of a user, returning how many took it.
    ///
    /// A session whose channel is closed is treated as a dead transport and
    /// removed. Redelivery to that user happens through reconciliation.
    pub fn emit(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        let targets: Vec<(ConnectionId, EventSender)> = match self.by_user.get(user_id) {
            Some(sessions) => sessions
                .iter()
                .map(|h| (h.session.connection_id, h.tx.clone()))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (connection_id, tx) in targets {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(
                    user_id = %user_id,
                    connection = %connection_id,
                    event = event.name(),
                    "session unreachable, removing it"
                );
                self.unregister(connection_id);
            }
        }
        delivered
    }

    /// Sends an event to each listed user. Returns the number of sessions reached.
    pub fn emit_all<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
        event: &ServerEvent,
    ) -> usize {
        users.into_iter().map(|user| self.emit(user, event)).sum()
    }

    /// Sends an event to a single connection.
    ///
    /// Returns `false` if the connection is unknown or its channel is closed.
    pub fn emit_to(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        let Some(user_id) = self.user_of(connection_id) else {
            return false;
        };
        let tx = self.by_user.get(&user_id).and_then(|sessions| {
            sessions
                .iter()
                .find(|h| h.session.connection_id == connection_id)
                .map(|h| h.tx.clone())
        });
        match tx {
            Some(tx) if tx.send(event.clone()).is_ok() => true,
            Some(_) => {
                tracing::warn!(connection = %connection_id, event = event.name(), "session unreachable, removing it");
                self.unregister(connection_id);
                false
            }
            None => false,
        }
    }
}
