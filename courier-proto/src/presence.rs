//! Presence status types for online/offline tracking.

use serde::{Deserialize, Serialize};

use crate::message::{Timestamp, UserId};

/// Presence status of a user, derived from their live session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// At least one session is connected.
    Online,
    /// No session is connected.
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Derived presence of a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// The user this state describes.
    pub user_id: UserId,
    /// Current status.
    pub status: PresenceStatus,
    /// When the user's last session closed, if ever observed.
    pub last_seen_at: Option<Timestamp>,
}

impl PresenceState {
    /// An online state.
    #[must_use]
    pub const fn online(user_id: UserId) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Online,
            last_seen_at: None,
        }
    }

    /// An offline state with the last time the user was seen.
    #[must_use]
    pub const fn offline(user_id: UserId, last_seen_at: Option<Timestamp>) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_seen_at,
        }
    }

    /// Whether the user is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}
