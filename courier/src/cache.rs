//! On-disk cache of the user's unread counters.
//!
//! The cache only drives the badge shown before the first `synced`
//! arrives. Every snapshot from the server replaces it wholesale.

use std::path::{Path, PathBuf};

use courier_proto::message::UserId;
use courier_proto::unread::UnreadCounter;

/// Errors from reading or writing the cache file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error("cache file {path}: {source}")]
    Io {
        /// The cache file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file exists but is not a valid counter.
    #[error("corrupt cache file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Unread counters persisted as JSON.
#[derive(Debug, Clone)]
pub struct UnreadCache {
    path: PathBuf,
    counter: UnreadCounter,
}

impl UnreadCache {
    /// An empty cache that will be written to `path`.
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>, user: &UserId) -> Self {
        Self {
            path: path.into(),
            counter: UnreadCounter::new(user.clone()),
        }
    }

    /// Loads the cache for `user` from `path`.
    ///
    /// A missing file yields an empty counter. A file written for another
    /// user is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the file cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>, user: &UserId) -> Result<Self, CacheError> {
        let path = path.into();
        let counter = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let counter: UnreadCounter = serde_json::from_str(&contents)?;
                if counter.user_id() == user {
                    counter
                } else {
                    tracing::warn!(path = %path.display(), cached = %counter.user_id(), user_id = %user, "cache belongs to another user, ignoring");
                    UnreadCounter::new(user.clone())
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UnreadCounter::new(user.clone()),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        Ok(Self { path, counter })
    }

    /// Writes the counter to disk, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the file cannot be written.
    pub fn save(&self) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(&self.counter)?;
        std::fs::write(&self.path, json).map_err(|e| self.io_error(e))
    }

    /// Replaces the cached counter with the server's.
    ///
    /// Returns `true` if anything changed.
    pub fn replace_with(&mut self, counter: UnreadCounter) -> bool {
        if self.counter == counter {
            return false;
        }
        self.counter = counter;
        true
    }

    /// The cached counter.
    #[must_use]
    pub const fn counter(&self) -> &UnreadCounter {
        &self.counter
    }

    /// Location of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
