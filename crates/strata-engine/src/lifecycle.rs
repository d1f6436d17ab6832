//! Lifecycle rule evaluation.
//!
//! Each enabled rule expires current object versions older than its age
//! threshold under its key prefix. Versioned buckets get delete markers
//! (history is retained for the version listing); non-versioned buckets
//! hard-delete the row and release the blob reference, leaving the orphan
//! for the garbage collector.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::locker::{LIFECYCLE_LOCK, Locker};
use strata_meta::entities::{Bucket, UserMetadata};
use strata_meta::store::{BlobIndex, BucketStore, LifecycleStore, NewObject, ObjectStore};

use crate::error::ServiceResult;
use crate::object::{DEFAULT_CONTENT_TYPE, DEFAULT_STORAGE_CLASS};

/// TTL on the evaluation lock.
const EVALUATION_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// What one evaluation pass did.
#[derive(Debug, Clone, Default)]
pub struct LifecycleReport {
    /// The pass was skipped because another holder owns the lock.
    pub skipped: bool,
    /// Enabled rules evaluated.
    pub rules_evaluated: usize,
    /// Delete markers inserted (versioned buckets).
    pub delete_markers_created: usize,
    /// Rows hard-deleted (non-versioned buckets).
    pub hard_deleted: usize,
    /// Expirations that failed and will be retried next pass.
    pub failed: usize,
}

/// Periodic evaluator of bucket lifecycle rules.
pub struct LifecycleEngine {
    rules: Arc<dyn LifecycleStore>,
    buckets: Arc<dyn BucketStore>,
    objects: Arc<dyn ObjectStore>,
    blob_index: Arc<dyn BlobIndex>,
    locker: Arc<dyn Locker>,
    batch_size: i64,
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl LifecycleEngine {
    /// Wire the engine together.
    pub fn new(
        rules: Arc<dyn LifecycleStore>,
        buckets: Arc<dyn BucketStore>,
        objects: Arc<dyn ObjectStore>,
        blob_index: Arc<dyn BlobIndex>,
        locker: Arc<dyn Locker>,
        batch_size: i64,
    ) -> Self {
        Self {
            rules,
            buckets,
            objects,
            blob_index,
            locker,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one evaluation pass over every enabled rule.
    pub async fn evaluate_once(&self) -> ServiceResult<LifecycleReport> {
        let mut report = LifecycleReport::default();

        if self
            .locker
            .acquire(LIFECYCLE_LOCK, EVALUATION_LOCK_TTL)
            .await
            .is_err()
        {
            debug!("lifecycle lock is held elsewhere, skipping pass");
            report.skipped = true;
            return Ok(report);
        }
        let result = self.evaluate_rules(&mut report).await;
        self.locker.release(LIFECYCLE_LOCK).await;
        result?;

        info!(
            rules = report.rules_evaluated,
            delete_markers = report.delete_markers_created,
            hard_deleted = report.hard_deleted,
            failed = report.failed,
            "lifecycle pass finished"
        );
        Ok(report)
    }

    async fn evaluate_rules(&self, report: &mut LifecycleReport) -> ServiceResult<()> {
        let now = Utc::now();
        for rule in self.rules.list_enabled_rules().await? {
            let bucket = match self.buckets.get_bucket_by_id(rule.bucket_id).await {
                Ok(bucket) => bucket,
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "skipping rule for missing bucket");
                    continue;
                }
            };
            report.rules_evaluated += 1;

            let cutoff = now - chrono::Duration::days(i64::from(rule.expiration_days));
            let expired = self
                .objects
                .list_expired_current(bucket.id, &rule.prefix, cutoff, self.batch_size)
                .await?;

            debug!(
                bucket = %bucket.name,
                prefix = %rule.prefix,
                expiration_days = rule.expiration_days,
                matches = expired.len(),
                "evaluating lifecycle rule"
            );

            for record in expired {
                let outcome = if bucket.is_versioned() {
                    self.tombstone(&bucket, &record.key).await
                } else {
                    self.expire_hard(&record.content_hash, record.id).await
                };
                match outcome {
                    Ok(true) => report.delete_markers_created += 1,
                    Ok(false) => report.hard_deleted += 1,
                    Err(e) => {
                        warn!(
                            bucket = %bucket.name,
                            key = %record.key,
                            error = %e,
                            "failed to expire object"
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Shadow the key with a delete marker. Returns `true` (marker).
    async fn tombstone(&self, bucket: &Bucket, key: &str) -> ServiceResult<bool> {
        self.objects
            .insert_as_latest(NewObject {
                bucket_id: bucket.id,
                key: key.to_owned(),
                version_id: Uuid::new_v4().to_string(),
                is_delete_marker: true,
                content_hash: None,
                size: 0,
                content_type: DEFAULT_CONTENT_TYPE.to_owned(),
                etag: String::new(),
                storage_class: DEFAULT_STORAGE_CLASS.to_owned(),
                metadata: UserMetadata::new(),
            })
            .await?;
        Ok(true)
    }

    /// Hard-delete the row and release its blob reference. Returns `false`
    /// (no marker).
    async fn expire_hard(
        &self,
        content_hash: &Option<String>,
        record_id: i64,
    ) -> ServiceResult<bool> {
        if let Some(hash) = content_hash {
            self.blob_index.decrement_blob_ref(hash).await?;
        }
        self.objects.delete_version(record_id).await?;
        Ok(false)
    }

    /// Spawn the periodic loop.
    pub fn spawn_periodic(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.evaluate_once().await {
                    warn!(error = %e, "lifecycle pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use strata_meta::SqliteMetaStore;
    use strata_meta::entities::VersioningState;
    use strata_meta::store::{NewBucket, NewLifecycleRule, NewUser, UserStore};

    use strata_core::locker::MemoryLocker;

    use super::*;

    struct Harness {
        meta: Arc<SqliteMetaStore>,
        locker: Arc<MemoryLocker>,
        bucket: Bucket,
    }

    async fn harness() -> Harness {
        let meta = Arc::new(SqliteMetaStore::in_memory().await.expect("test store"));
        let user = meta
            .create_user(NewUser {
                username: "alice".to_owned(),
                email: "alice@example.com".to_owned(),
                password_hash: "h".to_owned(),
                is_admin: false,
            })
            .await
            .expect("test user");
        let bucket = meta
            .create_bucket(NewBucket {
                owner_id: user.id,
                name: "b".to_owned(),
                region: "us-east-1".to_owned(),
                object_lock: false,
            })
            .await
            .expect("test bucket");
        Harness {
            meta,
            locker: Arc::new(MemoryLocker::new()),
            bucket,
        }
    }

    impl Harness {
        fn engine(&self) -> LifecycleEngine {
            LifecycleEngine::new(
                self.meta.clone(),
                self.meta.clone(),
                self.meta.clone(),
                self.meta.clone(),
                self.locker.clone(),
                100,
            )
        }

        async fn seed_object(&self, key: &str, hash: &str) {
            self.meta
                .upsert_blob_ref(hash, 4, "p")
                .await
                .expect("test blob");
            self.meta
                .insert_as_latest(NewObject {
                    bucket_id: self.bucket.id,
                    key: key.to_owned(),
                    version_id: Uuid::new_v4().to_string(),
                    is_delete_marker: false,
                    content_hash: Some(hash.to_owned()),
                    size: 4,
                    content_type: DEFAULT_CONTENT_TYPE.to_owned(),
                    etag: "\"e\"".to_owned(),
                    storage_class: DEFAULT_STORAGE_CLASS.to_owned(),
                    metadata: UserMetadata::new(),
                })
                .await
                .expect("test object");
        }

        async fn put_rule(&self, prefix: &str, days: i32, enabled: bool) {
            self.meta
                .put_rule(NewLifecycleRule {
                    bucket_id: self.bucket.id,
                    prefix: prefix.to_owned(),
                    expiration_days: days,
                    enabled,
                })
                .await
                .expect("test rule");
        }
    }

    #[tokio::test]
    async fn test_should_hard_delete_expired_objects_in_plain_bucket() {
        let h = harness().await;
        h.seed_object("logs/old", "h1").await;
        // Zero-day expiry: anything created before "now" is expired.
        h.put_rule("logs/", 0, true).await;

        let report = h.engine().evaluate_once().await.expect("test pass");
        assert_eq!(report.rules_evaluated, 1);
        assert_eq!(report.hard_deleted, 1);
        assert_eq!(report.delete_markers_created, 0);

        // The row is gone and the blob became an orphan.
        assert!(
            h.meta
                .get_current(h.bucket.id, "logs/old")
                .await
                .expect("test current")
                .is_none()
        );
        let blob = h
            .meta
            .get_blob("h1")
            .await
            .expect("test blob")
            .expect("blob row exists");
        assert_eq!(blob.ref_count, 0);
    }

    #[tokio::test]
    async fn test_should_tombstone_expired_objects_in_versioned_bucket() {
        let h = harness().await;
        h.meta
            .set_versioning(h.bucket.id, VersioningState::Enabled)
            .await
            .expect("test versioning");
        h.seed_object("doc", "h1").await;
        h.put_rule("", 0, true).await;

        let report = h.engine().evaluate_once().await.expect("test pass");
        assert_eq!(report.delete_markers_created, 1);
        assert_eq!(report.hard_deleted, 0);

        // The current pointer is now a marker; the old version and its
        // blob reference survive.
        let current = h
            .meta
            .get_current(h.bucket.id, "doc")
            .await
            .expect("test current")
            .expect("current exists");
        assert!(current.is_delete_marker);
        let blob = h
            .meta
            .get_blob("h1")
            .await
            .expect("test blob")
            .expect("blob row exists");
        assert_eq!(blob.ref_count, 1);
    }

    #[tokio::test]
    async fn test_should_respect_prefix_and_age() {
        let h = harness().await;
        h.seed_object("logs/old", "h1").await;
        h.seed_object("data/keep", "h2").await;
        // Prefix restricts the sweep; a one-day threshold spares both.
        h.put_rule("logs/", 1, true).await;

        let report = h.engine().evaluate_once().await.expect("test pass");
        assert_eq!(report.hard_deleted, 0);

        // Zero-day rule under the prefix only expires the match.
        h.put_rule("logs/", 0, true).await;
        let report = h.engine().evaluate_once().await.expect("test pass 2");
        assert_eq!(report.hard_deleted, 1);
        assert!(
            h.meta
                .get_current(h.bucket.id, "data/keep")
                .await
                .expect("test current")
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_should_ignore_disabled_rules() {
        let h = harness().await;
        h.seed_object("k", "h1").await;
        h.put_rule("", 0, false).await;

        let report = h.engine().evaluate_once().await.expect("test pass");
        assert_eq!(report.rules_evaluated, 0);
        assert_eq!(report.hard_deleted, 0);
    }

    #[tokio::test]
    async fn test_should_skip_pass_when_lock_is_held() {
        let h = harness().await;
        h.locker
            .acquire(LIFECYCLE_LOCK, Duration::from_secs(60))
            .await
            .expect("test lock");

        let report = h.engine().evaluate_once().await.expect("test pass");
        assert!(report.skipped);
    }
}
