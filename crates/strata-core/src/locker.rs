//! Keyed advisory locking with TTLs.
//!
//! Services serialize conflicting work (same-key PUTs, multipart
//! completion, GC runs) through a [`Locker`]. Locks are advisory, keyed by
//! string, and expire automatically so a crashed holder cannot wedge the
//! system. `acquire` never blocks beyond a single attempt; callers that
//! want to wait use [`Locker::acquire_with_retry`].
//!
//! Two implementations are provided: [`MemoryLocker`] for single-process
//! deployments, and [`KvLocker`] which drives any external expiring
//! key-value store through the [`ExpiringKv`] trait.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

/// Lock key guarding blob garbage collection.
pub const GC_BLOB_LOCK: &str = "gc:blob";

/// Lock key guarding the expired-multipart sweep.
pub const GC_MULTIPART_LOCK: &str = "gc:multipart";

/// Lock key guarding lifecycle rule evaluation.
pub const LIFECYCLE_LOCK: &str = "lifecycle:evaluation";

/// Build the lock key serializing writes to a single object.
///
/// The bucket id is rendered in its canonical decimal form so distinct
/// buckets can never collide on a key.
#[must_use]
pub fn object_upload_lock_key(bucket_id: i64, key: &str) -> String {
    format!("object:upload:{bucket_id}:{key}")
}

/// Build the lock key serializing completion/abort of a multipart upload.
#[must_use]
pub fn multipart_lock_key(upload_id: &str) -> String {
    format!("multipart:{upload_id}")
}

/// Errors produced by lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The lock is currently held by someone else.
    #[error("lock not acquired: {key}")]
    NotAcquired {
        /// The contended lock key.
        key: String,
    },
}

/// Keyed advisory lock with automatic TTL expiry.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to acquire `key` for `ttl`. Fails immediately if held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<(), LockError>;

    /// Acquire with bounded retries, sleeping `retry_delay` between attempts.
    async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), LockError>;

    /// Release `key`. Releasing an unheld key is a no-op.
    async fn release(&self, key: &str);

    /// Push the expiry of a held `key` out by `ttl`. Returns `false` if the
    /// key is not currently held.
    async fn extend(&self, key: &str, ttl: Duration) -> bool;

    /// Whether `key` is held and unexpired.
    async fn is_held(&self, key: &str) -> bool;
}

// ---------------------------------------------------------------------------
// MemoryLocker
// ---------------------------------------------------------------------------

/// Single-process lock table backed by a [`DashMap`] of expiry instants.
///
/// Expired entries are reclaimed opportunistically on acquire and by the
/// optional background sweeper ([`MemoryLocker::spawn_sweeper`]).
#[derive(Debug, Default)]
pub struct MemoryLocker {
    entries: DashMap<String, Instant>,
}

impl MemoryLocker {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry. Returns the number of entries evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, deadline| *deadline > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(evicted, "swept expired locks");
        }
        evicted
    }

    /// Spawn a background task sweeping expired entries every `interval`.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let locker = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                locker.sweep_expired();
            }
        })
    }

    /// Number of live (possibly expired, not yet swept) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        // The entry API holds the shard lock, making check-then-set atomic.
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return Err(LockError::NotAcquired {
                        key: key.to_owned(),
                    });
                }
                occupied.insert(now + ttl);
                debug!(key, "reacquired expired lock");
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                trace!(key, "acquired lock");
                Ok(())
            }
        }
    }

    async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), LockError> {
        let mut attempt = 0;
        loop {
            match self.acquire(key, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_retries => return Err(e),
                Err(_) => {
                    attempt += 1;
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn release(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            trace!(key, "released lock");
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    return false;
                }
                occupied.insert(now + ttl);
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    async fn is_held(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|deadline| *deadline > Instant::now())
    }
}

// ---------------------------------------------------------------------------
// KvLocker
// ---------------------------------------------------------------------------

/// An external key-value store with per-key expiry, the substrate for
/// distributed locking (a redis-style client implements this).
#[async_trait]
pub trait ExpiringKv: Send + Sync {
    /// Store `key` with `ttl` only if absent. Returns whether it was stored.
    async fn put_if_absent(&self, key: &str, ttl: Duration) -> bool;

    /// Reset the TTL of an existing `key`. Returns `false` if absent.
    async fn refresh(&self, key: &str, ttl: Duration) -> bool;

    /// Remove `key`. Removing an absent key is a no-op.
    async fn remove(&self, key: &str);

    /// Whether `key` exists and is unexpired.
    async fn contains(&self, key: &str) -> bool;
}

/// Distributed locker over any [`ExpiringKv`] backend.
#[derive(Debug)]
pub struct KvLocker<K> {
    kv: K,
}

impl<K: ExpiringKv> KvLocker<K> {
    /// Wrap an expiring key-value store as a [`Locker`].
    pub fn new(kv: K) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl<K: ExpiringKv> Locker for KvLocker<K> {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<(), LockError> {
        if self.kv.put_if_absent(key, ttl).await {
            Ok(())
        } else {
            Err(LockError::NotAcquired {
                key: key.to_owned(),
            })
        }
    }

    async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), LockError> {
        let mut attempt = 0;
        loop {
            match self.acquire(key, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_retries => return Err(e),
                Err(_) => {
                    attempt += 1;
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn release(&self, key: &str) {
        self.kv.remove(key).await;
    }

    async fn extend(&self, key: &str, ttl: Duration) -> bool {
        self.kv.refresh(key, ttl).await
    }

    async fn is_held(&self, key: &str) -> bool {
        self.kv.contains(key).await
    }
}
