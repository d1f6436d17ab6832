//! TTL cache for hot metadata lookups.
//!
//! Bucket records are read on almost every request; [`TtlCache`] keeps them
//! close without letting stale entries live past their TTL. Entries are
//! evicted lazily on read and by the optional background sweeper.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

/// A cached value with its expiry.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent cache mapping string keys to values with a fixed TTL.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up `key`, returning a clone of the value if present and fresh.
    ///
    /// Expired entries are removed on the way out.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert or replace `key` with a fresh TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop `key` immediately (used after mutations).
    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            trace!(key, "invalidated cache entry");
        }
    }

    /// Remove every expired entry. Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Spawn a background task sweeping expired entries every `interval`.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }

    /// Number of entries currently stored (including not-yet-swept expired
    /// ones).
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
