//! Multipart upload orchestration.
//!
//! Parts are stored as ordinary content-addressed blobs with their own
//! references. Completion validates the caller's part list, streams a
//! chained reader over every part through the blob store (so the combined
//! object is itself content-addressed and deduplicated), applies the same
//! current-pointer transition as PUT, and marks the upload `Completed`.
//! Per-part references are NOT released on completion; they fall with the
//! upload when it is aborted or swept after expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use uuid::Uuid;

use strata_blob::{BlobReader, BlobStore};
use strata_core::config::MultipartConfig;
use strata_core::locker::{self, Locker};
use strata_meta::MetaError;
use strata_meta::entities::{
    Bucket, MultipartUpload, UploadPart, UploadStatus, UserMetadata, VersioningState,
};
use strata_meta::store::{
    BlobIndex, BucketStore, MultipartStore, NewObject, NewPart, NewUpload, ObjectStore,
};

use crate::error::{ServiceError, ServiceResult};
use crate::etag;
use crate::object::{DEFAULT_CONTENT_TYPE, DEFAULT_STORAGE_CLASS, NULL_VERSION_ID};
use crate::principal::Principal;
use crate::validation::validate_object_key;

/// Smallest allowed part number.
pub const MIN_PART_NUMBER: i32 = 1;

/// Largest allowed part number.
pub const MAX_PART_NUMBER: i32 = 10_000;

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Inputs for UploadPart.
pub struct UploadPartInput {
    /// Bucket name.
    pub bucket: String,
    /// Upload id.
    pub upload_id: String,
    /// Part number in `[1, 10000]`.
    pub part_number: i32,
    /// Declared part size in bytes.
    pub size: u64,
    /// The part body stream.
    pub body: BlobReader,
}

impl std::fmt::Debug for UploadPartInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPartInput")
            .field("bucket", &self.bucket)
            .field("upload_id", &self.upload_id)
            .field("part_number", &self.part_number)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A `(part_number, etag)` pair supplied to CompleteMultipartUpload.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    /// The part number.
    pub part_number: i32,
    /// The ETag returned when the part was uploaded.
    pub etag: String,
}

/// Result of CompleteMultipartUpload.
#[derive(Debug, Clone)]
pub struct CompleteUploadOutput {
    /// The composite ETag of the assembled object.
    pub etag: String,
    /// The created version id (versioned buckets only).
    pub version_id: Option<String>,
    /// Total size of the assembled object.
    pub size: u64,
}

/// One page of ListParts.
#[derive(Debug)]
pub struct ListPartsOutput {
    /// Parts, ascending by part number.
    pub parts: Vec<UploadPart>,
    /// Whether more parts remain.
    pub is_truncated: bool,
    /// Marker for the next page.
    pub next_part_number_marker: Option<i32>,
}

/// One page of ListMultipartUploads.
#[derive(Debug)]
pub struct ListUploadsOutput {
    /// In-progress uploads, ordered by `(key, upload_id)`.
    pub uploads: Vec<MultipartUpload>,
    /// Whether more uploads remain.
    pub is_truncated: bool,
    /// Key marker for the next page.
    pub next_key_marker: Option<String>,
    /// Upload-id marker for the next page.
    pub next_upload_id_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// MultipartService
// ---------------------------------------------------------------------------

/// Multipart upload lifecycle.
pub struct MultipartService {
    buckets: Arc<dyn BucketStore>,
    objects: Arc<dyn ObjectStore>,
    uploads: Arc<dyn MultipartStore>,
    blob_index: Arc<dyn BlobIndex>,
    blobs: Arc<dyn BlobStore>,
    locker: Arc<dyn Locker>,
    config: MultipartConfig,
    lock_ttl: Duration,
}

impl std::fmt::Debug for MultipartService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MultipartService {
    /// Wire the service together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buckets: Arc<dyn BucketStore>,
        objects: Arc<dyn ObjectStore>,
        uploads: Arc<dyn MultipartStore>,
        blob_index: Arc<dyn BlobIndex>,
        blobs: Arc<dyn BlobStore>,
        locker: Arc<dyn Locker>,
        config: MultipartConfig,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            buckets,
            objects,
            uploads,
            blob_index,
            blobs,
            locker,
            config,
            lock_ttl,
        }
    }

    async fn bucket(&self, name: &str) -> ServiceResult<Bucket> {
        self.buckets.get_bucket(name).await.map_err(|e| match e {
            MetaError::NotFound { .. } => ServiceError::NoSuchBucket {
                bucket: name.to_owned(),
            },
            other => other.into(),
        })
    }

    /// Fetch the upload and verify it can still accept work.
    async fn active_upload(&self, upload_id: &str) -> ServiceResult<MultipartUpload> {
        let upload = self
            .uploads
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| ServiceError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            })?;
        match upload.status {
            UploadStatus::Completed => return Err(ServiceError::UploadCompleted),
            UploadStatus::Aborted => return Err(ServiceError::UploadAborted),
            UploadStatus::InProgress => {}
        }
        if upload.expires_at <= Utc::now() {
            return Err(ServiceError::UploadExpired);
        }
        Ok(upload)
    }

    fn relative_storage_path(content_hash: &str) -> String {
        format!(
            "{}/{}/{content_hash}",
            &content_hash[0..2],
            &content_hash[2..4]
        )
    }

    // -----------------------------------------------------------------------
    // Initiate
    // -----------------------------------------------------------------------

    /// Start a multipart upload and return its id.
    pub async fn initiate(
        &self,
        principal: &Principal,
        bucket_name: &str,
        key: &str,
        storage_class: Option<String>,
        metadata: UserMetadata,
    ) -> ServiceResult<MultipartUpload> {
        validate_object_key(key)?;
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let expiration = chrono::Duration::seconds(
            i64::try_from(self.config.upload_expiration_secs).unwrap_or(7 * 24 * 3600),
        );
        let upload = self
            .uploads
            .create_upload(NewUpload {
                id: Uuid::new_v4().to_string(),
                bucket_id: bucket.id,
                key: key.to_owned(),
                initiator_id: principal.user_id,
                storage_class: storage_class.unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_owned()),
                metadata,
                expires_at: Utc::now() + expiration,
            })
            .await?;

        info!(bucket = %bucket_name, key, upload_id = %upload.id, "initiated multipart upload");
        Ok(upload)
    }

    // -----------------------------------------------------------------------
    // UploadPart
    // -----------------------------------------------------------------------

    /// Store one part. Re-uploading a part number replaces it and releases
    /// the replaced content's reference.
    pub async fn upload_part(
        &self,
        principal: &Principal,
        mut input: UploadPartInput,
    ) -> ServiceResult<String> {
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&input.part_number) {
            return Err(ServiceError::InvalidPart);
        }
        if input.size > self.config.max_part_size {
            return Err(ServiceError::EntityTooLarge);
        }

        let bucket = self.bucket(&input.bucket).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }
        let upload = self.active_upload(&input.upload_id).await?;
        if upload.bucket_id != bucket.id {
            return Err(ServiceError::NoSuchUpload {
                upload_id: input.upload_id.clone(),
            });
        }

        let size = i64::try_from(input.size).map_err(|_| ServiceError::InvalidArgument {
            message: "part size out of range".to_owned(),
        })?;

        // Blob first, then the reference, then the part row.
        let content_hash = self.blobs.store(&mut input.body, input.size).await?;
        self.blob_index
            .upsert_blob_ref(
                &content_hash,
                size,
                &Self::relative_storage_path(&content_hash),
            )
            .await?;

        let part_etag = etag::simple_etag(&content_hash);
        let replaced = self
            .uploads
            .upsert_part(NewPart {
                upload_id: input.upload_id.clone(),
                part_number: input.part_number,
                content_hash,
                size,
                etag: part_etag.clone(),
            })
            .await?;

        // The replaced content's reference is released only after the new
        // row is in place.
        if let Some(old_hash) = replaced {
            self.blob_index.decrement_blob_ref(&old_hash).await?;
        }

        debug!(
            upload_id = %input.upload_id,
            part_number = input.part_number,
            size,
            "uploaded part"
        );
        Ok(part_etag)
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    /// Assemble the named parts into the final object.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidPartOrder`] for non-ascending numbers,
    /// [`ServiceError::InvalidPart`] for unknown parts or ETag mismatches,
    /// [`ServiceError::EntityTooSmall`] when a non-final part is under the
    /// minimum size.
    pub async fn complete(
        &self,
        principal: &Principal,
        bucket_name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ServiceResult<CompleteUploadOutput> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let lock_key = locker::multipart_lock_key(upload_id);
        self.locker.acquire(&lock_key, self.lock_ttl).await?;
        let result = self.complete_locked(&bucket, upload_id, parts).await;
        self.locker.release(&lock_key).await;
        result
    }

    async fn complete_locked(
        &self,
        bucket: &Bucket,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ServiceResult<CompleteUploadOutput> {
        let upload = self.active_upload(upload_id).await?;
        if upload.bucket_id != bucket.id {
            return Err(ServiceError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            });
        }

        if parts.is_empty() {
            return Err(ServiceError::InvalidPart);
        }
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(ServiceError::InvalidPartOrder);
        }

        // Resolve and validate every named part.
        let mut records: Vec<UploadPart> = Vec::with_capacity(parts.len());
        for requested in parts {
            let record = self
                .uploads
                .get_part(upload_id, requested.part_number)
                .await?
                .ok_or(ServiceError::InvalidPart)?;
            if !etag::etags_equal(&record.etag, &requested.etag) {
                return Err(ServiceError::InvalidPart);
            }
            records.push(record);
        }

        // All but the last part must meet the minimum size.
        let min = i64::try_from(self.config.min_part_size).unwrap_or(i64::MAX);
        if records[..records.len() - 1].iter().any(|p| p.size < min) {
            return Err(ServiceError::EntityTooSmall);
        }

        let total: i64 = records.iter().map(|p| p.size).sum();
        let total_u64 = u64::try_from(total).map_err(|_| {
            ServiceError::Internal(anyhow::anyhow!("combined upload size overflow"))
        })?;

        // Chain the part payloads into one sequential stream and run it
        // through the content-addressed store.
        let mut chained: BlobReader = Box::new(tokio::io::empty());
        for record in &records {
            let reader = self.blobs.retrieve(&record.content_hash).await?;
            chained = Box::new(chained.chain(reader));
        }
        let final_hash = self.blobs.store(&mut chained, total_u64).await?;
        self.blob_index
            .upsert_blob_ref(&final_hash, total, &Self::relative_storage_path(&final_hash))
            .await?;

        let part_etags: Vec<String> = records.iter().map(|p| p.etag.clone()).collect();
        let combined_etag = etag::composite_etag(&part_etags)?;

        // The same current-pointer transition as PUT.
        let new = NewObject {
            bucket_id: bucket.id,
            key: upload.key.clone(),
            version_id: String::new(),
            is_delete_marker: false,
            content_hash: Some(final_hash),
            size: total,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            etag: combined_etag.clone(),
            storage_class: upload.storage_class.clone(),
            metadata: upload.metadata.clone(),
        };
        let version_id = match bucket.versioning {
            VersioningState::Enabled => {
                let version_id = Uuid::new_v4().to_string();
                let mut new = new;
                new.version_id = version_id.clone();
                self.objects.insert_as_latest(new).await?;
                Some(version_id)
            }
            VersioningState::Disabled => {
                if let Some(current) = self.objects.get_current(bucket.id, &upload.key).await? {
                    if let Some(old_hash) = &current.content_hash {
                        self.blob_index.decrement_blob_ref(old_hash).await?;
                    }
                }
                let mut new = new;
                new.version_id = NULL_VERSION_ID.to_owned();
                self.objects.insert_replacing(new).await?;
                None
            }
            VersioningState::Suspended => {
                // Only the null version is replaced; enabled-era versions
                // stay retained.
                if let Some(null_row) = self
                    .objects
                    .get_version(bucket.id, &upload.key, NULL_VERSION_ID)
                    .await?
                {
                    if !null_row.is_delete_marker {
                        if let Some(old_hash) = &null_row.content_hash {
                            self.blob_index.decrement_blob_ref(old_hash).await?;
                        }
                    }
                    self.objects.delete_version(null_row.id).await?;
                }
                let mut new = new;
                new.version_id = NULL_VERSION_ID.to_owned();
                self.objects.insert_as_latest(new).await?;
                None
            }
        };

        self.uploads
            .set_upload_status(upload_id, UploadStatus::Completed, Some(Utc::now()))
            .await?;

        info!(
            bucket = %bucket.name,
            key = %upload.key,
            upload_id,
            parts = records.len(),
            size = total,
            "completed multipart upload"
        );

        Ok(CompleteUploadOutput {
            etag: combined_etag,
            version_id,
            size: total_u64,
        })
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    /// Abort an upload, releasing every part's blob reference.
    pub async fn abort(
        &self,
        principal: &Principal,
        bucket_name: &str,
        upload_id: &str,
    ) -> ServiceResult<()> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let lock_key = locker::multipart_lock_key(upload_id);
        self.locker.acquire(&lock_key, self.lock_ttl).await?;
        let result = self.abort_locked(&bucket, upload_id).await;
        self.locker.release(&lock_key).await;
        result
    }

    async fn abort_locked(&self, bucket: &Bucket, upload_id: &str) -> ServiceResult<()> {
        let upload = self.active_upload(upload_id).await?;
        if upload.bucket_id != bucket.id {
            return Err(ServiceError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            });
        }

        let released = self.uploads.abort_upload(upload_id).await?;
        info!(upload_id, parts_released = released, "aborted multipart upload");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    /// List parts of an upload, paginated by part number.
    pub async fn list_parts(
        &self,
        principal: &Principal,
        bucket_name: &str,
        upload_id: &str,
        part_number_marker: Option<i32>,
        max_parts: Option<i64>,
    ) -> ServiceResult<ListPartsOutput> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }
        // Parts of completed/aborted uploads are still listable until swept.
        let upload = self
            .uploads
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| ServiceError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            })?;
        if upload.bucket_id != bucket.id {
            return Err(ServiceError::NoSuchUpload {
                upload_id: upload_id.to_owned(),
            });
        }

        let limit = max_parts.unwrap_or(1000).clamp(1, 1000);
        let mut parts = self
            .uploads
            .list_parts(upload_id, part_number_marker.unwrap_or(0), limit + 1)
            .await?;

        let is_truncated = (i64::try_from(parts.len()).unwrap_or(i64::MAX)) > limit;
        if is_truncated {
            parts.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        let next_part_number_marker = is_truncated.then(|| parts.last().map(|p| p.part_number))
            .flatten();

        Ok(ListPartsOutput {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// List in-progress uploads of a bucket.
    pub async fn list_uploads(
        &self,
        principal: &Principal,
        bucket_name: &str,
        key_marker: Option<&str>,
        upload_id_marker: Option<&str>,
        max_uploads: Option<i64>,
    ) -> ServiceResult<ListUploadsOutput> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let limit = max_uploads.unwrap_or(1000).clamp(1, 1000);
        let mut uploads = self
            .uploads
            .list_uploads(
                bucket.id,
                key_marker.unwrap_or(""),
                upload_id_marker.unwrap_or(""),
                limit + 1,
            )
            .await?;

        let is_truncated = (i64::try_from(uploads.len()).unwrap_or(i64::MAX)) > limit;
        if is_truncated {
            uploads.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        let (next_key_marker, next_upload_id_marker) = if is_truncated {
            uploads
                .last()
                .map(|u| (Some(u.key.clone()), Some(u.id.clone())))
                .unwrap_or((None, None))
        } else {
            (None, None)
        };

        Ok(ListUploadsOutput {
            uploads,
            is_truncated,
            next_key_marker,
            next_upload_id_marker,
        })
    }
}

#[cfg(test)]
mod tests {
    use strata_blob::FsBlobStore;
    use strata_core::crypto::sha256_hex;
    use strata_core::locker::MemoryLocker;
    use strata_meta::SqliteMetaStore;
    use strata_meta::entities::VersioningState;
    use strata_meta::store::{NewBucket, NewUser, UserStore};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct Harness {
        _tmp: tempfile::TempDir,
        meta: Arc<SqliteMetaStore>,
        blobs: Arc<FsBlobStore>,
        svc: MultipartService,
        alice: Principal,
    }

    async fn harness() -> Harness {
        let tmp = tempfile::tempdir().expect("test tempdir");
        let meta = Arc::new(SqliteMetaStore::in_memory().await.expect("test store"));
        let blobs = Arc::new(
            FsBlobStore::new(tmp.path().join("blobs"), tmp.path().join("tmp"))
                .await
                .expect("test blob store"),
        );
        let locker = Arc::new(MemoryLocker::new());

        let user = meta
            .create_user(NewUser {
                username: "alice".to_owned(),
                email: "alice@example.com".to_owned(),
                password_hash: "h".to_owned(),
                is_admin: false,
            })
            .await
            .expect("test user");

        // Tiny minimum part size so tests stay fast.
        let config = MultipartConfig {
            min_part_size: 4,
            ..MultipartConfig::default()
        };

        let svc = MultipartService::new(
            meta.clone(),
            meta.clone(),
            meta.clone(),
            meta.clone(),
            blobs.clone(),
            locker,
            config,
            Duration::from_secs(30),
        );

        Harness {
            _tmp: tmp,
            meta,
            blobs,
            svc,
            alice: Principal::user(user.id),
        }
    }

    impl Harness {
        async fn make_bucket(&self, name: &str) -> Bucket {
            self.meta
                .create_bucket(NewBucket {
                    owner_id: self.alice.user_id,
                    name: name.to_owned(),
                    region: "us-east-1".to_owned(),
                    object_lock: false,
                })
                .await
                .expect("test bucket")
        }

        async fn upload_bytes(&self, upload_id: &str, part_number: i32, bytes: &[u8]) -> String {
            self.svc
                .upload_part(
                    &self.alice,
                    UploadPartInput {
                        bucket: "b".to_owned(),
                        upload_id: upload_id.to_owned(),
                        part_number,
                        size: bytes.len() as u64,
                        body: Box::new(std::io::Cursor::new(bytes.to_vec())),
                    },
                )
                .await
                .expect("test part upload")
        }

        async fn ref_count(&self, hash: &str) -> i32 {
            self.meta
                .get_blob(hash)
                .await
                .expect("test blob get")
                .expect("blob row exists")
                .ref_count
        }
    }

    // -----------------------------------------------------------------------
    // Initiate / upload part
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_initiate_upload_with_expiry() {
        let h = harness().await;
        h.make_bucket("b").await;

        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        assert_eq!(upload.status, UploadStatus::InProgress);
        assert!(upload.expires_at > Utc::now() + chrono::Duration::days(6));
    }

    #[tokio::test]
    async fn test_should_reject_out_of_range_part_numbers() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");

        for bad in [0, 10_001] {
            let result = h
                .svc
                .upload_part(
                    &h.alice,
                    UploadPartInput {
                        bucket: "b".to_owned(),
                        upload_id: upload.id.clone(),
                        part_number: bad,
                        size: 1,
                        body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                    },
                )
                .await;
            assert!(matches!(result, Err(ServiceError::InvalidPart)), "part {bad}");
        }
    }

    #[tokio::test]
    async fn test_should_reject_unknown_upload() {
        let h = harness().await;
        h.make_bucket("b").await;
        let result = h
            .svc
            .upload_part(
                &h.alice,
                UploadPartInput {
                    bucket: "b".to_owned(),
                    upload_id: "ghost".to_owned(),
                    part_number: 1,
                    size: 1,
                    body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::NoSuchUpload { .. })));
    }

    #[tokio::test]
    async fn test_should_release_replaced_part_content() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");

        h.upload_bytes(&upload.id, 1, b"first").await;
        h.upload_bytes(&upload.id, 1, b"second").await;

        assert_eq!(h.ref_count(&sha256_hex(b"first")).await, 0);
        assert_eq!(h.ref_count(&sha256_hex(b"second")).await, 1);
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_complete_and_stream_concatenation() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");

        let part1 = vec![0x41u8; 64];
        let part2 = vec![0x42u8; 16];
        let etag1 = h.upload_bytes(&upload.id, 1, &part1).await;
        let etag2 = h.upload_bytes(&upload.id, 2, &part2).await;

        let out = h
            .svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: etag1.clone(),
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: etag2.clone(),
                    },
                ],
            )
            .await
            .expect("test complete");

        assert_eq!(out.size, 80);
        assert!(out.etag.ends_with("-2\""));
        assert_eq!(
            out.etag,
            etag::composite_etag(&[etag1, etag2]).expect("test etag")
        );

        // The assembled blob is the byte concatenation of the parts.
        let mut combined = part1.clone();
        combined.extend_from_slice(&part2);
        let final_hash = sha256_hex(&combined);
        let mut reader = h.blobs.retrieve(&final_hash).await.expect("test retrieve");
        let mut streamed = Vec::new();
        reader
            .read_to_end(&mut streamed)
            .await
            .expect("test read");
        assert_eq!(streamed, combined);

        // Completion keeps the per-part references.
        assert_eq!(h.ref_count(&sha256_hex(&part1)).await, 1);
        assert_eq!(h.ref_count(&sha256_hex(&part2)).await, 1);
        assert_eq!(h.ref_count(&final_hash).await, 1);

        // The upload reached its terminal state.
        let stored = h
            .meta
            .get_upload(&upload.id)
            .await
            .expect("test get")
            .expect("upload exists");
        assert_eq!(stored.status, UploadStatus::Completed);
        assert!(stored.completed_at.is_some());

        // Completing again fails cleanly.
        let again = h.svc.complete(&h.alice, "b", &upload.id, &[]).await;
        assert!(matches!(again, Err(ServiceError::UploadCompleted)));
    }

    #[tokio::test]
    async fn test_should_reject_unordered_part_list() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        let etag1 = h.upload_bytes(&upload.id, 1, b"aaaa").await;
        let etag2 = h.upload_bytes(&upload.id, 2, b"bbbb").await;

        let result = h
            .svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[
                    CompletedPart {
                        part_number: 2,
                        etag: etag2,
                    },
                    CompletedPart {
                        part_number: 1,
                        etag: etag1,
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidPartOrder)));
    }

    #[tokio::test]
    async fn test_should_reject_etag_mismatch() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        h.upload_bytes(&upload.id, 1, b"aaaa").await;

        let result = h
            .svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[CompletedPart {
                    part_number: 1,
                    etag: "\"00000000000000000000000000000000\"".to_owned(),
                }],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidPart)));
    }

    #[tokio::test]
    async fn test_should_reject_empty_part_list() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");

        let result = h.svc.complete(&h.alice, "b", &upload.id, &[]).await;
        assert!(matches!(result, Err(ServiceError::InvalidPart)));
    }

    #[tokio::test]
    async fn test_should_reject_undersized_non_final_part() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");

        // Below the 4-byte test minimum.
        let etag1 = h.upload_bytes(&upload.id, 1, b"ab").await;
        let etag2 = h.upload_bytes(&upload.id, 2, b"cdef").await;

        let result = h
            .svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: etag1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: etag2,
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::EntityTooSmall)));
    }

    #[tokio::test]
    async fn test_should_replace_current_object_on_complete() {
        let h = harness().await;
        h.make_bucket("b").await;

        // Seed a plain object under the same key through the object path.
        let object_svc = {
            let locker = Arc::new(MemoryLocker::new());
            crate::object::ObjectService::new(
                h.meta.clone(),
                h.meta.clone(),
                h.meta.clone(),
                h.blobs.clone(),
                locker,
                Duration::from_secs(30),
            )
        };
        object_svc
            .put(
                &h.alice,
                crate::object::PutObjectInput {
                    bucket: "b".to_owned(),
                    key: "big".to_owned(),
                    size: 3,
                    content_type: None,
                    storage_class: None,
                    metadata: UserMetadata::new(),
                    body: Box::new(std::io::Cursor::new(b"old".to_vec())),
                },
            )
            .await
            .expect("seed put");

        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        let etag1 = h.upload_bytes(&upload.id, 1, b"fresh-content").await;
        h.svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[CompletedPart {
                    part_number: 1,
                    etag: etag1,
                }],
            )
            .await
            .expect("test complete");

        // The old content lost its reference.
        assert_eq!(h.ref_count(&sha256_hex(b"old")).await, 0);
        let record = object_svc
            .head(&h.alice, "b", "big", None)
            .await
            .expect("test head");
        assert_eq!(record.size, 13);
        assert!(record.etag.ends_with("-1\""));
    }

    #[tokio::test]
    async fn test_should_version_completed_upload_in_versioned_bucket() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.meta
            .set_versioning(bucket.id, VersioningState::Enabled)
            .await
            .expect("test versioning");

        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        let etag1 = h.upload_bytes(&upload.id, 1, b"versioned").await;
        let out = h
            .svc
            .complete(
                &h.alice,
                "b",
                &upload.id,
                &[CompletedPart {
                    part_number: 1,
                    etag: etag1,
                }],
            )
            .await
            .expect("test complete");
        assert!(out.version_id.is_some());
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_abort_and_release_parts() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        h.upload_bytes(&upload.id, 1, b"part-one").await;
        h.upload_bytes(&upload.id, 2, b"part-two").await;

        h.svc
            .abort(&h.alice, "b", &upload.id)
            .await
            .expect("test abort");

        assert_eq!(h.ref_count(&sha256_hex(b"part-one")).await, 0);
        assert_eq!(h.ref_count(&sha256_hex(b"part-two")).await, 0);

        // Uploading into an aborted upload fails.
        let result = h
            .svc
            .upload_part(
                &h.alice,
                UploadPartInput {
                    bucket: "b".to_owned(),
                    upload_id: upload.id.clone(),
                    part_number: 3,
                    size: 1,
                    body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::UploadAborted)));
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_paginate_parts() {
        let h = harness().await;
        h.make_bucket("b").await;
        let upload = h
            .svc
            .initiate(&h.alice, "b", "big", None, UserMetadata::new())
            .await
            .expect("test initiate");
        for n in 1..=4 {
            h.upload_bytes(&upload.id, n, format!("part-{n}").as_bytes())
                .await;
        }

        let first = h
            .svc
            .list_parts(&h.alice, "b", &upload.id, None, Some(3))
            .await
            .expect("page 1");
        assert_eq!(first.parts.len(), 3);
        assert!(first.is_truncated);
        assert_eq!(first.next_part_number_marker, Some(3));

        let second = h
            .svc
            .list_parts(&h.alice, "b", &upload.id, first.next_part_number_marker, Some(3))
            .await
            .expect("page 2");
        assert_eq!(second.parts.len(), 1);
        assert!(!second.is_truncated);
        assert_eq!(second.parts[0].part_number, 4);
    }

    #[tokio::test]
    async fn test_should_list_in_progress_uploads() {
        let h = harness().await;
        h.make_bucket("b").await;
        let u1 = h
            .svc
            .initiate(&h.alice, "b", "a-key", None, UserMetadata::new())
            .await
            .expect("initiate 1");
        let u2 = h
            .svc
            .initiate(&h.alice, "b", "z-key", None, UserMetadata::new())
            .await
            .expect("initiate 2");
        h.svc.abort(&h.alice, "b", &u2.id).await.expect("abort");

        let listed = h
            .svc
            .list_uploads(&h.alice, "b", None, None, None)
            .await
            .expect("test list");
        assert_eq!(listed.uploads.len(), 1);
        assert_eq!(listed.uploads[0].id, u1.id);
        assert!(!listed.is_truncated);
    }
}
