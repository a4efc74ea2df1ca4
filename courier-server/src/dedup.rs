//! Short-lived fingerprint cache used to suppress duplicate fan-out.
//!
//! Entries expire after a TTL. Lookups treat expired entries as absent,
//! and a background sweeper removes them so the map stays bounded by the
//! number of distinct events seen within one TTL window.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_proto::message::{Recipient, Timestamp, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

/// Hash key identifying an event for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint of any hashable value.
    #[must_use]
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Self(hasher.finish())
    }

    /// Fingerprint of a message send: who sent what to whom, and roughly when.
    ///
    /// `created_at` is reduced to a bucket of `bucket_ms` so a retried send
    /// that lands a few milliseconds later still collides.
    #[must_use]
    pub fn message(
        scope: &str,
        sender: &UserId,
        recipient: &Recipient,
        content: &str,
        created_at: Timestamp,
        bucket_ms: u64,
    ) -> Self {
        Self::of(&(scope, sender, recipient, content, created_at.bucket(bucket_ms)))
    }
}

/// TTL-bounded set of fingerprints.
#[derive(Debug)]
pub struct DedupCache {
    entries: DashMap<Fingerprint, Instant>,
    ttl: Duration,
}

impl DedupCache {
    /// Creates an empty cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Default entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `fp` was remembered and has not expired.
    #[must_use]
    pub fn seen(&self, fp: Fingerprint) -> bool {
        self.entries
            .get(&fp)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Remembers `fp` for `ttl`, extending any existing entry.
    pub fn remember(&self, fp: Fingerprint, ttl: Duration) {
        self.entries.insert(fp, Instant::now() + ttl);
    }

    /// Atomically checks and records `fp`.
    ///
    /// Returns `true` the first time a fingerprint is seen within its TTL and
    /// `false` for every repeat. Concurrent callers with the same fingerprint
    /// see exactly one `true`.
    pub fn check_and_remember(&self, fp: Fingerprint) -> bool {
        let now = Instant::now();
        match self.entries.entry(fp) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(now + self.ttl);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.ttl);
                true
            }
        }
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodically purges `cache` until it is dropped.
pub fn spawn_sweeper(cache: &Arc<DedupCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    let cache: Weak<DedupCache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let removed = cache.purge_expired();
            if removed > 0 {
                tracing::trace!(removed, remaining = cache.len(), "dedup cache swept");
            }
        }
    })
}
