//! In-flight attachment uploads and their cancellation tokens.
//!
//! A token is registered when a send with an attachment starts and stays
//! registered until the message is persisted or the send fails. Cancelling
//! after that point finds nothing and is a no-op.

use courier_proto::message::UserId;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registry of cancellable uploads, keyed by (user, client upload id).
#[derive(Debug, Default)]
pub struct UploadTracker {
    inflight: DashMap<(UserId, String), CancellationToken>,
}

impl UploadTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an upload and returns its token.
    ///
    /// Reusing an upload id that is still in flight replaces the earlier
    /// registration; the earlier send can no longer be cancelled.
    pub fn begin(&self, user: &UserId, upload_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight
            .insert((user.clone(), upload_id.to_string()), token.clone());
        token
    }

    /// The token registered for an upload, registering one if none is.
    ///
    /// A send queued behind others registers early so a cancel issued
    /// while it waits is seen once its upload starts.
    pub fn token_for(&self, user: &UserId, upload_id: &str) -> CancellationToken {
        self.inflight
            .entry((user.clone(), upload_id.to_string()))
            .or_default()
            .clone()
    }

    /// Unregisters an upload once its send has completed either way.
    pub fn finish(&self, user: &UserId, upload_id: &str) {
        self.inflight.remove(&(user.clone(), upload_id.to_string()));
    }

    /// Cancels an in-flight upload. Returns `false` if none was registered.
    pub fn cancel(&self, user: &UserId, upload_id: &str) -> bool {
        match self.inflight.get(&(user.clone(), upload_id.to_string())) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of uploads currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether no upload is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
