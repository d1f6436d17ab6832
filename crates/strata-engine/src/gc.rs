//! Orphan blob garbage collection.
//!
//! A blob becomes an orphan when its reference count reaches zero; it is
//! reclaimed only after a grace period so in-flight uploads and crash
//! recovery can still re-reference it. Each run deletes storage before
//! metadata: a crash between the two leaves a refcount-zero row that the
//! next run finishes off, never a row pointing at a missing file being
//! resurrected.
//!
//! Runs are gated by the `gc:blob` named lock so only one instance
//! collects at a time; a contended run is skipped, not queued. The same
//! pass sweeps expired multipart uploads under `gc:multipart`, releasing
//! their part references.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use strata_blob::BlobStore;
use strata_core::config::GcConfig;
use strata_core::locker::{GC_BLOB_LOCK, GC_MULTIPART_LOCK, Locker};
use strata_meta::MetaError;
use strata_meta::store::{BlobIndex, MultipartStore};

use crate::error::ServiceResult;

/// What one collection run did.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// The run was skipped because another holder owns the lock.
    pub skipped: bool,
    /// The run only counted; nothing was mutated.
    pub dry_run: bool,
    /// Orphans considered this run.
    pub scanned: usize,
    /// Blobs removed from storage and metadata.
    pub deleted: usize,
    /// Orphans that failed to delete (retried next run).
    pub failed: usize,
    /// Whether a full batch was processed, implying more may remain.
    pub more_remaining: bool,
    /// Expired multipart uploads aborted by the sweep.
    pub expired_uploads_aborted: usize,
}

/// Periodic reclaimer of unreferenced blobs and expired uploads.
pub struct GarbageCollector {
    blob_index: Arc<dyn BlobIndex>,
    uploads: Arc<dyn MultipartStore>,
    blobs: Arc<dyn BlobStore>,
    locker: Arc<dyn Locker>,
    config: GcConfig,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    /// Wire the collector together.
    pub fn new(
        blob_index: Arc<dyn BlobIndex>,
        uploads: Arc<dyn MultipartStore>,
        blobs: Arc<dyn BlobStore>,
        locker: Arc<dyn Locker>,
        config: GcConfig,
    ) -> Self {
        Self {
            blob_index,
            uploads,
            blobs,
            locker,
            config,
        }
    }

    /// Run one collection pass. Safe to call on demand (the CLI does).
    pub async fn run_once(&self) -> ServiceResult<GcReport> {
        let mut report = GcReport {
            dry_run: self.config.dry_run,
            ..GcReport::default()
        };

        let ttl = self.config.lock_ttl();
        if self.locker.acquire(GC_BLOB_LOCK, ttl).await.is_err() {
            debug!("blob GC lock is held elsewhere, skipping run");
            report.skipped = true;
            return Ok(report);
        }
        let result = self.collect_orphans(&mut report).await;
        self.locker.release(GC_BLOB_LOCK).await;
        result?;

        if self.locker.acquire(GC_MULTIPART_LOCK, ttl).await.is_ok() {
            let result = self.sweep_expired_uploads(&mut report).await;
            self.locker.release(GC_MULTIPART_LOCK).await;
            result?;
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            failed = report.failed,
            more_remaining = report.more_remaining,
            expired_uploads = report.expired_uploads_aborted,
            dry_run = report.dry_run,
            "garbage collection pass finished"
        );
        Ok(report)
    }

    async fn collect_orphans(&self, report: &mut GcReport) -> ServiceResult<()> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(
                i64::try_from(self.config.grace_period_secs).unwrap_or(i64::MAX),
            );
        let batch = i64::from(self.config.batch_size.max(1));

        let orphans = self.blob_index.list_orphans(cutoff, batch).await?;
        report.scanned = orphans.len();
        report.more_remaining = i64::try_from(orphans.len()).unwrap_or(i64::MAX) == batch;

        for blob in &orphans {
            if self.config.dry_run {
                info!(
                    content_hash = %blob.content_hash,
                    size = blob.size,
                    "dry run: would delete orphan blob"
                );
                continue;
            }

            // Storage first; a missing file counts as already collected.
            match self.blobs.delete(&blob.content_hash).await {
                Ok(found) => {
                    if !found {
                        debug!(content_hash = %blob.content_hash, "orphan file already gone");
                    }
                    match self.blob_index.delete_blob_record(&blob.content_hash).await {
                        Ok(()) | Err(MetaError::NotFound { .. }) => report.deleted += 1,
                        Err(e) => {
                            warn!(content_hash = %blob.content_hash, error = %e, "failed to delete blob row");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(content_hash = %blob.content_hash, error = %e, "failed to delete blob file");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn sweep_expired_uploads(&self, report: &mut GcReport) -> ServiceResult<()> {
        let batch = i64::from(self.config.batch_size.max(1));
        let expired = self.uploads.list_expired_uploads(Utc::now(), batch).await?;

        for upload in expired {
            if self.config.dry_run {
                info!(upload_id = %upload.id, "dry run: would abort expired upload");
                continue;
            }
            match self.uploads.abort_upload(&upload.id).await {
                Ok(parts) => {
                    debug!(upload_id = %upload.id, parts, "aborted expired upload");
                    report.expired_uploads_aborted += 1;
                }
                Err(e) => {
                    warn!(upload_id = %upload.id, error = %e, "failed to abort expired upload");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Spawn the periodic loop. The returned handle is aborted on
    /// shutdown; each pass is short and crash-safe.
    pub fn spawn_periodic(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = gc.run_once().await {
                    warn!(error = %e, "garbage collection pass failed");
                }
            }
        })
    }
}
