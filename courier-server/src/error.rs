//! Engine error type and its mapping onto client-visible error events.

use courier_proto::event::{ErrorKind, ServerEvent};
use courier_proto::message::ValidationError;

use crate::store::StoreError;

/// Errors produced while handling a client event.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The user may not perform the action.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// A conversation, group, or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content was rejected before anything was stored.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The authoritative write failed; the operation was aborted.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// An attachment upload was cancelled before the message was stored.
    #[error("upload {0} cancelled")]
    Cancelled(String),

    /// The client sent something the engine cannot act on.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    /// Client-visible error class.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// The event reported to the connection that caused the error.
    ///
    /// A cancelled upload is a confirmation rather than a failure, so it is
    /// reported as [`ServerEvent::UploadCancelled`].
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        match self {
            Self::Cancelled(upload_id) => ServerEvent::UploadCancelled {
                upload_id: upload_id.clone(),
            },
            other => ServerEvent::error(other.kind(), other.to_string()),
        }
    }
}
