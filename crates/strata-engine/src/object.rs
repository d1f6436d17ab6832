//! Object operations: PUT, GET, HEAD, DELETE, COPY, and listings.
//!
//! Writes follow a strict order: blob bytes land in the content-addressed
//! backend first, then the blob index gains a reference, then the object
//! row becomes visible. A crash between the first two steps leaves an
//! orphan file the collector reclaims; the reverse order could leave
//! metadata pointing at nothing.
//!
//! PUT and DELETE for one `(bucket, key)` serialize through the
//! `object:upload:{bucket_id}:{key}` lock; concurrent writers see
//! [`ServiceError::LockNotAcquired`] and retry at the protocol layer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use strata_blob::{BlobReader, BlobStore};
use strata_core::locker::{self, Locker};
use strata_meta::MetaError;
use strata_meta::entities::{Bucket, ObjectRecord, UserMetadata, VersioningState};
use strata_meta::store::{BlobIndex, BucketStore, NewObject, ObjectStore};

use crate::error::{ServiceError, ServiceResult};
use crate::etag;
use crate::principal::Principal;
use crate::util::{
    common_prefix_of, decode_continuation_token, encode_continuation_token, parse_range_header,
};
use crate::validation::validate_object_key;

/// Content type recorded when the client does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Storage class recorded when the client does not supply one.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Version id recorded for rows in never-versioned buckets.
pub const NULL_VERSION_ID: &str = "null";

/// Upper bound on `MaxKeys` for every listing.
const MAX_KEYS_CEILING: i64 = 1000;

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Inputs for a PUT.
pub struct PutObjectInput {
    /// Target bucket name.
    pub bucket: String,
    /// Target key.
    pub key: String,
    /// Declared body size in bytes.
    pub size: u64,
    /// MIME type.
    pub content_type: Option<String>,
    /// Storage class label.
    pub storage_class: Option<String>,
    /// User metadata.
    pub metadata: UserMetadata,
    /// The body stream.
    pub body: BlobReader,
}

impl std::fmt::Debug for PutObjectInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutObjectInput")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Result of a PUT.
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    /// The object's ETag.
    pub etag: String,
    /// The created version id (versioned buckets only).
    pub version_id: Option<String>,
}

/// Inputs for a GET.
#[derive(Debug, Clone, Default)]
pub struct GetObjectInput {
    /// Bucket name.
    pub bucket: String,
    /// Key.
    pub key: String,
    /// Specific version to read.
    pub version_id: Option<String>,
    /// Raw `Range` header value.
    pub range: Option<String>,
}

/// The satisfied byte range of a ranged GET.
#[derive(Debug, Clone, Copy)]
pub struct ContentRange {
    /// First byte returned.
    pub start: u64,
    /// Last byte returned (inclusive).
    pub end: u64,
    /// Total object size.
    pub total: u64,
}

/// Result of a GET.
pub struct GetObjectOutput {
    /// The object's metadata row.
    pub record: ObjectRecord,
    /// The payload stream (the requested range when one was given).
    pub body: BlobReader,
    /// Set when a range was served.
    pub content_range: Option<ContentRange>,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("record", &self.record)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Result of a DELETE.
#[derive(Debug, Clone)]
pub struct DeleteObjectOutput {
    /// Whether a delete marker was created (or removed).
    pub delete_marker: bool,
    /// The affected version id.
    pub version_id: Option<String>,
}

/// Whether COPY carries source metadata or replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataDirective {
    /// Destination inherits the source's content type and metadata.
    Copy,
    /// Destination uses the metadata supplied in the request.
    Replace,
}

/// Inputs for a COPY.
#[derive(Debug, Clone)]
pub struct CopyObjectInput {
    /// Source bucket name.
    pub source_bucket: String,
    /// Source key.
    pub source_key: String,
    /// Specific source version.
    pub source_version_id: Option<String>,
    /// Destination bucket name.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// COPY or REPLACE.
    pub metadata_directive: MetadataDirective,
    /// Replacement content type (REPLACE only).
    pub content_type: Option<String>,
    /// Replacement metadata (REPLACE only).
    pub metadata: UserMetadata,
}

/// Result of a COPY.
#[derive(Debug, Clone)]
pub struct CopyObjectOutput {
    /// The destination ETag.
    pub etag: String,
    /// The destination version id (versioned buckets only).
    pub version_id: Option<String>,
    /// The resolved source version id.
    pub source_version_id: Option<String>,
}

/// Inputs for ListObjects / ListObjectsV2.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsInput {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix filter.
    pub prefix: String,
    /// Grouping delimiter.
    pub delimiter: Option<String>,
    /// Page size; clamped to `[1, 1000]`.
    pub max_keys: Option<i64>,
    /// V2 continuation token from a previous page.
    pub continuation_token: Option<String>,
    /// V2 start-after key / V1 marker.
    pub start_after: Option<String>,
}

/// Result of a listing.
#[derive(Debug)]
pub struct ListObjectsOutput {
    /// Matching current objects, ascending by key.
    pub contents: Vec<ObjectRecord>,
    /// Grouped prefixes when a delimiter was supplied.
    pub common_prefixes: Vec<String>,
    /// Whether more results remain.
    pub is_truncated: bool,
    /// Opaque token for the next page.
    pub next_continuation_token: Option<String>,
}

/// Inputs for ListObjectVersions.
#[derive(Debug, Clone, Default)]
pub struct ListVersionsInput {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix filter.
    pub prefix: String,
    /// Resume after this key.
    pub key_marker: Option<String>,
    /// Resume after this version within `key_marker`.
    pub version_id_marker: Option<String>,
    /// Page size; clamped to `[1, 1000]`.
    pub max_keys: Option<i64>,
}

/// Result of a version listing.
#[derive(Debug)]
pub struct ListVersionsOutput {
    /// Version rows (content versions and delete markers), ordered by key
    /// ascending then creation time descending.
    pub versions: Vec<ObjectRecord>,
    /// Whether more results remain.
    pub is_truncated: bool,
    /// Key to resume from.
    pub next_key_marker: Option<String>,
    /// Version to resume from within that key.
    pub next_version_id_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// ObjectService
// ---------------------------------------------------------------------------

/// Object CRUD over the blob backend and metadata store.
pub struct ObjectService {
    buckets: Arc<dyn BucketStore>,
    objects: Arc<dyn ObjectStore>,
    blob_index: Arc<dyn BlobIndex>,
    blobs: Arc<dyn BlobStore>,
    locker: Arc<dyn Locker>,
    lock_ttl: Duration,
}

impl std::fmt::Debug for ObjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectService")
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

impl ObjectService {
    /// Wire the service together. `lock_ttl` bounds how long a crashed
    /// writer can block a key; size it above the longest expected upload.
    pub fn new(
        buckets: Arc<dyn BucketStore>,
        objects: Arc<dyn ObjectStore>,
        blob_index: Arc<dyn BlobIndex>,
        blobs: Arc<dyn BlobStore>,
        locker: Arc<dyn Locker>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            buckets,
            objects,
            blob_index,
            blobs,
            locker,
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

    /// The sharded storage path recorded in the blob index, relative to the
    /// blob root.
    fn relative_storage_path(content_hash: &str) -> String {
        format!(
            "{}/{}/{content_hash}",
            &content_hash[0..2],
            &content_hash[2..4]
        )
    }

    // -----------------------------------------------------------------------
    // PUT
    // -----------------------------------------------------------------------

    /// Store an object.
    ///
    /// # Errors
    ///
    /// [`ServiceError::LockNotAcquired`] when another writer holds the key,
    /// plus the usual bucket/validation failures.
    pub async fn put(
        &self,
        principal: &Principal,
        input: PutObjectInput,
    ) -> ServiceResult<PutObjectOutput> {
        validate_object_key(&input.key)?;
        let bucket = self.bucket(&input.bucket).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let lock_key = locker::object_upload_lock_key(bucket.id, &input.key);
        self.locker.acquire(&lock_key, self.lock_ttl).await?;
        let result = self.put_locked(&bucket, input).await;
        self.locker.release(&lock_key).await;
        result
    }

    async fn put_locked(
        &self,
        bucket: &Bucket,
        mut input: PutObjectInput,
    ) -> ServiceResult<PutObjectOutput> {
        let size = i64::try_from(input.size).map_err(|_| ServiceError::InvalidArgument {
            message: "object size out of range".to_owned(),
        })?;

        // Blob bytes first, reference second, object row last.
        let content_hash = self.blobs.store(&mut input.body, input.size).await?;
        self.blob_index
            .upsert_blob_ref(
                &content_hash,
                size,
                &Self::relative_storage_path(&content_hash),
            )
            .await?;

        let object_etag = etag::simple_etag(&content_hash);
        let new = NewObject {
            bucket_id: bucket.id,
            key: input.key.clone(),
            version_id: String::new(),
            is_delete_marker: false,
            content_hash: Some(content_hash.clone()),
            size,
            content_type: input.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            etag: object_etag.clone(),
            storage_class: input
                .storage_class
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_owned()),
            metadata: input.metadata,
        };

        let version_id = self.transition_current(bucket, new).await?;
        debug!(bucket = %bucket.name, key = %input.key, content_hash, "put object");

        Ok(PutObjectOutput {
            etag: object_etag,
            version_id,
        })
    }

    /// Apply the current-pointer transition shared by PUT, COPY, and
    /// multipart completion. Returns the new version id for versioned
    /// buckets.
    async fn transition_current(
        &self,
        bucket: &Bucket,
        mut new: NewObject,
    ) -> ServiceResult<Option<String>> {
        match bucket.versioning {
            VersioningState::Enabled => {
                let version_id = Uuid::new_v4().to_string();
                new.version_id = version_id.clone();
                // Old versions keep their blob references.
                self.objects.insert_as_latest(new).await?;
                Ok(Some(version_id))
            }
            VersioningState::Disabled => {
                // Overwrites release the previous content's reference and
                // leave exactly one row per key.
                if let Some(current) = self.objects.get_current(bucket.id, &new.key).await? {
                    if let Some(old_hash) = &current.content_hash {
                        self.blob_index.decrement_blob_ref(old_hash).await?;
                    }
                }
                new.version_id = NULL_VERSION_ID.to_owned();
                self.objects.insert_replacing(new).await?;
                Ok(None)
            }
            VersioningState::Suspended => {
                // Suspended buckets overwrite only the null version; rows
                // created while versioning was enabled stay untouched.
                self.replace_null_version(bucket.id, &new.key).await?;
                new.version_id = NULL_VERSION_ID.to_owned();
                self.objects.insert_as_latest(new).await?;
                Ok(None)
            }
        }
    }

    /// Remove an existing null-version row for the key, releasing its blob
    /// reference unless it was a delete marker.
    async fn replace_null_version(&self, bucket_id: i64, key: &str) -> ServiceResult<()> {
        if let Some(null_row) = self
            .objects
            .get_version(bucket_id, key, NULL_VERSION_ID)
            .await?
        {
            if !null_row.is_delete_marker {
                if let Some(old_hash) = &null_row.content_hash {
                    self.blob_index.decrement_blob_ref(old_hash).await?;
                }
            }
            self.objects.delete_version(null_row.id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // GET / HEAD
    // -----------------------------------------------------------------------

    /// Fetch object metadata without the payload.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoSuchKey`] / [`ServiceError::NoSuchVersion`] when
    /// absent, [`ServiceError::ObjectDeleted`] when the target is a delete
    /// marker.
    pub async fn head(
        &self,
        principal: &Principal,
        bucket_name: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> ServiceResult<ObjectRecord> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let record = match version_id {
            Some(vid) => self
                .objects
                .get_version(bucket.id, key, vid)
                .await?
                .ok_or_else(|| ServiceError::NoSuchVersion {
                    key: key.to_owned(),
                    version_id: vid.to_owned(),
                })?,
            None => self
                .objects
                .get_current(bucket.id, key)
                .await?
                .ok_or_else(|| ServiceError::NoSuchKey {
                    key: key.to_owned(),
                })?,
        };

        if record.is_delete_marker {
            return Err(ServiceError::ObjectDeleted {
                key: key.to_owned(),
            });
        }
        Ok(record)
    }

    /// Fetch an object, streaming its payload (or a byte range of it).
    pub async fn get(
        &self,
        principal: &Principal,
        input: GetObjectInput,
    ) -> ServiceResult<GetObjectOutput> {
        let record = self
            .head(
                principal,
                &input.bucket,
                &input.key,
                input.version_id.as_deref(),
            )
            .await?;

        let content_hash = record.content_hash.clone().ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!("content row is missing its blob hash"))
        })?;
        let total = u64::try_from(record.size).unwrap_or(0);

        match &input.range {
            Some(spec) => {
                if !self.blobs.supports_range() {
                    return Err(ServiceError::InvalidRange);
                }
                let (start, end) = parse_range_header(spec, total)?;
                let body = self
                    .blobs
                    .retrieve_range(&content_hash, start, end - start + 1)
                    .await?;
                Ok(GetObjectOutput {
                    record,
                    body,
                    content_range: Some(ContentRange { start, end, total }),
                })
            }
            None => {
                let body = self.blobs.retrieve(&content_hash).await?;
                Ok(GetObjectOutput {
                    record,
                    body,
                    content_range: None,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // DELETE
    // -----------------------------------------------------------------------

    /// Delete an object or a specific version.
    ///
    /// Deleting a missing key succeeds (idempotent). In versioned buckets a
    /// delete without a version id inserts a delete marker; with a version
    /// id the row is removed for good.
    pub async fn delete(
        &self,
        principal: &Principal,
        bucket_name: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> ServiceResult<DeleteObjectOutput> {
        let bucket = self.bucket(bucket_name).await?;
        if !principal.may_write(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let lock_key = locker::object_upload_lock_key(bucket.id, key);
        self.locker.acquire(&lock_key, self.lock_ttl).await?;
        let result = self.delete_locked(&bucket, key, version_id).await;
        self.locker.release(&lock_key).await;
        result
    }

    async fn delete_locked(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: Option<&str>,
    ) -> ServiceResult<DeleteObjectOutput> {
        match version_id {
            // Hard-delete one version; release its blob reference unless it
            // was a marker.
            Some(vid) => {
                let Some(record) = self.objects.get_version(bucket.id, key, vid).await? else {
                    return Ok(DeleteObjectOutput {
                        delete_marker: false,
                        version_id: Some(vid.to_owned()),
                    });
                };
                if !record.is_delete_marker {
                    if let Some(hash) = &record.content_hash {
                        self.blob_index.decrement_blob_ref(hash).await?;
                    }
                }
                self.objects.delete_version(record.id).await?;
                debug!(bucket = %bucket.name, key, version_id = vid, "deleted version");
                Ok(DeleteObjectOutput {
                    delete_marker: record.is_delete_marker,
                    version_id: Some(vid.to_owned()),
                })
            }

            None => match bucket.versioning {
                // Tombstone the key with a marker; history survives.
                VersioningState::Enabled => {
                    let marker_version = Uuid::new_v4().to_string();
                    self.insert_delete_marker(bucket, key, &marker_version).await?;
                    debug!(bucket = %bucket.name, key, "inserted delete marker");
                    Ok(DeleteObjectOutput {
                        delete_marker: true,
                        version_id: Some(marker_version),
                    })
                }

                // Suspended buckets tombstone with a null-version marker,
                // replacing any existing null version.
                VersioningState::Suspended => {
                    self.replace_null_version(bucket.id, key).await?;
                    self.insert_delete_marker(bucket, key, NULL_VERSION_ID).await?;
                    debug!(bucket = %bucket.name, key, "inserted null delete marker");
                    Ok(DeleteObjectOutput {
                        delete_marker: true,
                        version_id: Some(NULL_VERSION_ID.to_owned()),
                    })
                }

                // Non-versioned bucket: hard-delete the current row.
                VersioningState::Disabled => {
                    let Some(current) = self.objects.get_current(bucket.id, key).await? else {
                        return Ok(DeleteObjectOutput {
                            delete_marker: false,
                            version_id: None,
                        });
                    };
                    if let Some(hash) = &current.content_hash {
                        self.blob_index.decrement_blob_ref(hash).await?;
                    }
                    self.objects.delete_version(current.id).await?;
                    debug!(bucket = %bucket.name, key, "deleted object");
                    Ok(DeleteObjectOutput {
                        delete_marker: false,
                        version_id: None,
                    })
                }
            },
        }
    }

    async fn insert_delete_marker(
        &self,
        bucket: &Bucket,
        key: &str,
        version_id: &str,
    ) -> ServiceResult<()> {
        self.objects
            .insert_as_latest(NewObject {
                bucket_id: bucket.id,
                key: key.to_owned(),
                version_id: version_id.to_owned(),
                is_delete_marker: true,
                content_hash: None,
                size: 0,
                content_type: DEFAULT_CONTENT_TYPE.to_owned(),
                etag: String::new(),
                storage_class: DEFAULT_STORAGE_CLASS.to_owned(),
                metadata: UserMetadata::new(),
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // COPY
    // -----------------------------------------------------------------------

    /// Server-side copy. No bytes move: the destination gains a reference
    /// to the source blob.
    pub async fn copy(
        &self,
        principal: &Principal,
        input: CopyObjectInput,
    ) -> ServiceResult<CopyObjectOutput> {
        validate_object_key(&input.key)?;

        let source_bucket = self.bucket(&input.source_bucket).await?;
        if !principal.may_read(&source_bucket) {
            return Err(ServiceError::AccessDenied);
        }
        let source = self
            .head(
                principal,
                &input.source_bucket,
                &input.source_key,
                input.source_version_id.as_deref(),
            )
            .await?;
        let content_hash = source.content_hash.clone().ok_or_else(|| {
            ServiceError::Internal(anyhow::anyhow!("source row is missing its blob hash"))
        })?;

        let dest_bucket = self.bucket(&input.bucket).await?;
        if !principal.may_write(&dest_bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let lock_key = locker::object_upload_lock_key(dest_bucket.id, &input.key);
        self.locker.acquire(&lock_key, self.lock_ttl).await?;
        let result = self
            .copy_locked(&dest_bucket, &source, content_hash, &input)
            .await;
        self.locker.release(&lock_key).await;
        result
    }

    async fn copy_locked(
        &self,
        dest_bucket: &Bucket,
        source: &ObjectRecord,
        content_hash: String,
        input: &CopyObjectInput,
    ) -> ServiceResult<CopyObjectOutput> {
        // The destination holds its own reference to the shared blob.
        self.blob_index
            .upsert_blob_ref(
                &content_hash,
                source.size,
                &Self::relative_storage_path(&content_hash),
            )
            .await?;

        let (content_type, metadata) = match input.metadata_directive {
            MetadataDirective::Copy => (source.content_type.clone(), source.metadata.clone()),
            MetadataDirective::Replace => (
                input
                    .content_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
                input.metadata.clone(),
            ),
        };

        let object_etag = etag::simple_etag(&content_hash);
        let new = NewObject {
            bucket_id: dest_bucket.id,
            key: input.key.clone(),
            version_id: String::new(),
            is_delete_marker: false,
            content_hash: Some(content_hash),
            size: source.size,
            content_type,
            etag: object_etag.clone(),
            storage_class: source.storage_class.clone(),
            metadata,
        };
        let version_id = self.transition_current(dest_bucket, new).await?;

        debug!(
            source_bucket = %input.source_bucket,
            source_key = %input.source_key,
            bucket = %input.bucket,
            key = %input.key,
            "copied object"
        );

        Ok(CopyObjectOutput {
            etag: object_etag,
            version_id,
            source_version_id: (source.version_id != NULL_VERSION_ID)
                .then(|| source.version_id.clone()),
        })
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    /// ListObjectsV2: token-paginated listing with optional delimiter
    /// grouping.
    pub async fn list_objects_v2(
        &self,
        principal: &Principal,
        input: ListObjectsInput,
    ) -> ServiceResult<ListObjectsOutput> {
        let bucket = self.bucket(&input.bucket).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let start_from = match &input.continuation_token {
            Some(token) => decode_continuation_token(token)?,
            None => input.start_after.clone().unwrap_or_default(),
        };

        self.list_page(&bucket, &input, &start_from).await
    }

    /// ListObjects (v1): marker-paginated listing. The marker is the plain
    /// last key, not an encoded token.
    pub async fn list_objects(
        &self,
        principal: &Principal,
        mut input: ListObjectsInput,
    ) -> ServiceResult<ListObjectsOutput> {
        // V1 markers arrive through `start_after`; tokens are a v2 concept.
        input.continuation_token = None;
        self.list_objects_v2(principal, input).await
    }

    async fn list_page(
        &self,
        bucket: &Bucket,
        input: &ListObjectsInput,
        start_from: &str,
    ) -> ServiceResult<ListObjectsOutput> {
        let max_keys = input
            .max_keys
            .unwrap_or(MAX_KEYS_CEILING)
            .clamp(1, MAX_KEYS_CEILING);
        let delimiter = input.delimiter.as_deref().filter(|d| !d.is_empty());

        let mut contents: Vec<ObjectRecord> = Vec::new();
        let mut prefixes: BTreeSet<String> = BTreeSet::new();
        let mut cursor = start_from.to_owned();
        let mut last_key = String::new();
        let mut truncated = false;

        'fill: loop {
            let batch = self
                .objects
                .list_current(bucket.id, &input.prefix, &cursor, max_keys + 1)
                .await?;
            let exhausted = (i64::try_from(batch.len()).unwrap_or(i64::MAX)) < max_keys + 1;

            for record in batch {
                let emitted = contents.len() + prefixes.len();
                match delimiter.and_then(|d| common_prefix_of(&record.key, &input.prefix, d)) {
                    Some(group) => {
                        if prefixes.contains(&group) {
                            // Same group; consumes no budget.
                            last_key = record.key;
                            continue;
                        }
                        if emitted >= usize::try_from(max_keys).unwrap_or(usize::MAX) {
                            truncated = true;
                            break 'fill;
                        }
                        last_key = record.key;
                        prefixes.insert(group);
                    }
                    None => {
                        if emitted >= usize::try_from(max_keys).unwrap_or(usize::MAX) {
                            truncated = true;
                            break 'fill;
                        }
                        last_key = record.key.clone();
                        contents.push(record);
                    }
                }
            }

            if exhausted {
                break;
            }
            cursor = last_key.clone();
        }

        let next_continuation_token = truncated.then(|| encode_continuation_token(&last_key));

        Ok(ListObjectsOutput {
            contents,
            common_prefixes: prefixes.into_iter().collect(),
            is_truncated: truncated,
            next_continuation_token,
        })
    }

    /// ListObjectVersions: every version row and delete marker, ordered by
    /// key ascending then newest first.
    pub async fn list_versions(
        &self,
        principal: &Principal,
        input: ListVersionsInput,
    ) -> ServiceResult<ListVersionsOutput> {
        let bucket = self.bucket(&input.bucket).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let max_keys = input
            .max_keys
            .unwrap_or(MAX_KEYS_CEILING)
            .clamp(1, MAX_KEYS_CEILING);
        let key_marker = input.key_marker.clone().filter(|k| !k.is_empty());
        let version_marker = input.version_id_marker.clone().filter(|v| !v.is_empty());

        let mut fetch_limit = max_keys + 1;
        let (versions, truncated) = loop {
            let batch = self
                .objects
                .list_versions(
                    bucket.id,
                    &input.prefix,
                    key_marker.as_deref().unwrap_or(""),
                    fetch_limit,
                )
                .await?;
            let exhausted = (i64::try_from(batch.len()).unwrap_or(i64::MAX)) < fetch_limit;

            let mut page: Vec<ObjectRecord> = Vec::new();
            let mut hit_cap = false;
            let mut skipping = key_marker.is_some();
            let mut passed_version_marker = false;

            for record in batch {
                if skipping {
                    if Some(record.key.as_str()) == key_marker.as_deref() {
                        match &version_marker {
                            // Skip rows through the marker version, then
                            // resume inside the same key.
                            Some(marker) => {
                                if passed_version_marker {
                                    skipping = false;
                                } else {
                                    if record.version_id == *marker {
                                        passed_version_marker = true;
                                    }
                                    continue;
                                }
                            }
                            // No version marker: the whole key was emitted.
                            None => continue,
                        }
                    } else {
                        skipping = false;
                    }
                }

                if i64::try_from(page.len()).unwrap_or(i64::MAX) >= max_keys {
                    hit_cap = true;
                    break;
                }
                page.push(record);
            }

            if hit_cap {
                break (page, true);
            }
            if exhausted {
                break (page, false);
            }
            if page.is_empty() {
                // Everything fetched was skipped by the markers; widen.
                fetch_limit = (fetch_limit * 2).min(100_000);
                continue;
            }
            // Partial page with more rows in the store.
            break (page, true);
        };

        let (next_key_marker, next_version_id_marker) = if truncated {
            versions
                .last()
                .map(|v| (Some(v.key.clone()), Some(v.version_id.clone())))
                .unwrap_or((None, None))
        } else {
            (None, None)
        };

        Ok(ListVersionsOutput {
            versions,
            is_truncated: truncated,
            next_key_marker,
            next_version_id_marker,
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
    use strata_meta::store::{NewUser, UserStore};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct Harness {
        _tmp: tempfile::TempDir,
        meta: Arc<SqliteMetaStore>,
        blobs: Arc<FsBlobStore>,
        locker: Arc<MemoryLocker>,
        svc: ObjectService,
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

        let svc = ObjectService::new(
            meta.clone(),
            meta.clone(),
            meta.clone(),
            blobs.clone(),
            locker.clone(),
            Duration::from_secs(30),
        );

        Harness {
            _tmp: tmp,
            meta,
            blobs,
            locker,
            svc,
            alice: Principal::user(user.id),
        }
    }

    impl Harness {
        async fn make_bucket(&self, name: &str) -> Bucket {
            use strata_meta::store::NewBucket;
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

        async fn enable_versioning(&self, bucket: &Bucket) {
            self.meta
                .set_versioning(bucket.id, VersioningState::Enabled)
                .await
                .expect("test versioning");
        }

        async fn put_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> PutObjectOutput {
            self.svc
                .put(
                    &self.alice,
                    PutObjectInput {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                        size: bytes.len() as u64,
                        content_type: Some("text/plain".to_owned()),
                        storage_class: None,
                        metadata: UserMetadata::new(),
                        body: Box::new(std::io::Cursor::new(bytes.to_vec())),
                    },
                )
                .await
                .expect("test put")
        }

        async fn get_bytes(&self, bucket: &str, key: &str, version_id: Option<&str>) -> Vec<u8> {
            let out = self
                .svc
                .get(
                    &self.alice,
                    GetObjectInput {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                        version_id: version_id.map(ToOwned::to_owned),
                        range: None,
                    },
                )
                .await
                .expect("test get");
            read_all(out.body).await
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

    async fn read_all(mut body: BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.expect("test read");
        out
    }

    // -----------------------------------------------------------------------
    // PUT / GET round trip
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_roundtrip_put_and_get() {
        let h = harness().await;
        h.make_bucket("b").await;

        let put = h.put_bytes("b", "k", b"hello world").await;
        assert_eq!(put.etag, etag::simple_etag(&sha256_hex(b"hello world")));
        assert!(put.version_id.is_none());

        let body = h.get_bytes("b", "k", None).await;
        assert_eq!(body, b"hello world");

        let record = h
            .svc
            .head(&h.alice, "b", "k", None)
            .await
            .expect("test head");
        assert_eq!(record.size, 11);
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.etag, put.etag);
        assert_eq!(record.version_id, NULL_VERSION_ID);
    }

    #[tokio::test]
    async fn test_should_reject_put_into_missing_bucket() {
        let h = harness().await;
        let result = h
            .svc
            .put(
                &h.alice,
                PutObjectInput {
                    bucket: "ghost".to_owned(),
                    key: "k".to_owned(),
                    size: 1,
                    content_type: None,
                    storage_class: None,
                    metadata: UserMetadata::new(),
                    body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::NoSuchBucket { .. })));
    }

    #[tokio::test]
    async fn test_should_reject_write_without_permission() {
        let h = harness().await;
        h.make_bucket("b").await;
        let stranger = Principal::user(h.alice.user_id + 100);
        let result = h
            .svc
            .put(
                &stranger,
                PutObjectInput {
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    size: 1,
                    content_type: None,
                    storage_class: None,
                    metadata: UserMetadata::new(),
                    body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::AccessDenied)));
    }

    // -----------------------------------------------------------------------
    // Deduplication
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_share_blob_between_keys() {
        let h = harness().await;
        h.make_bucket("b").await;

        h.put_bytes("b", "k1", b"ABC").await;
        h.put_bytes("b", "k2", b"ABC").await;

        let hash = sha256_hex(b"ABC");
        assert_eq!(h.ref_count(&hash).await, 2);
        // Exactly one file on disk serves both keys.
        assert!(h.blobs.path_for(&hash).exists());
    }

    #[tokio::test]
    async fn test_should_keep_refcount_on_identical_overwrite() {
        let h = harness().await;
        h.make_bucket("b").await;

        h.put_bytes("b", "k", b"ABC").await;
        h.put_bytes("b", "k", b"ABC").await;

        let hash = sha256_hex(b"ABC");
        // Upsert bumped to 2, replacing the old row released one.
        assert_eq!(h.ref_count(&hash).await, 1);

        // Exactly one object row remains.
        let versions = h
            .svc
            .list_versions(
                &h.alice,
                ListVersionsInput {
                    bucket: "b".to_owned(),
                    ..Default::default()
                },
            )
            .await
            .expect("test versions");
        assert_eq!(versions.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_should_orphan_old_content_on_overwrite() {
        let h = harness().await;
        h.make_bucket("b").await;

        h.put_bytes("b", "k", b"old").await;
        h.put_bytes("b", "k", b"new").await;

        assert_eq!(h.ref_count(&sha256_hex(b"old")).await, 0);
        assert_eq!(h.ref_count(&sha256_hex(b"new")).await, 1);
        assert_eq!(h.get_bytes("b", "k", None).await, b"new");
    }

    // -----------------------------------------------------------------------
    // Versioning
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_retain_versions_and_shadow_with_marker() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.enable_versioning(&bucket).await;

        let put1 = h.put_bytes("b", "k", b"v1").await;
        let put2 = h.put_bytes("b", "k", b"v2").await;
        let v1 = put1.version_id.expect("versioned put returns id");
        let v2 = put2.version_id.expect("versioned put returns id");
        assert_ne!(v1, v2);

        let deleted = h
            .svc
            .delete(&h.alice, "b", "k", None)
            .await
            .expect("test delete");
        assert!(deleted.delete_marker);

        // Three entries: marker (latest), then v2, then v1.
        let listing = h
            .svc
            .list_versions(
                &h.alice,
                ListVersionsInput {
                    bucket: "b".to_owned(),
                    ..Default::default()
                },
            )
            .await
            .expect("test versions");
        assert_eq!(listing.versions.len(), 3);
        assert!(listing.versions[0].is_delete_marker);
        assert!(listing.versions[0].is_latest);
        assert_eq!(listing.versions[1].version_id, v2);
        assert!(!listing.versions[1].is_latest);
        assert_eq!(listing.versions[2].version_id, v1);

        // Plain GET sees the tombstone; versioned GET still works.
        let result = h
            .svc
            .get(
                &h.alice,
                GetObjectInput {
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    version_id: None,
                    range: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::ObjectDeleted { .. })));
        assert_eq!(h.get_bytes("b", "k", Some(&v1)).await, b"v1");
    }

    #[tokio::test]
    async fn test_should_count_versioned_rewrites_per_version() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.enable_versioning(&bucket).await;

        let put1 = h.put_bytes("b", "k", b"ABC").await;
        let put2 = h.put_bytes("b", "k", b"ABC").await;
        let hash = sha256_hex(b"ABC");
        assert_eq!(h.ref_count(&hash).await, 2);

        // Deleting both versions returns the count to zero.
        h.svc
            .delete(&h.alice, "b", "k", put1.version_id.as_deref())
            .await
            .expect("delete v1");
        assert_eq!(h.ref_count(&hash).await, 1);
        h.svc
            .delete(&h.alice, "b", "k", put2.version_id.as_deref())
            .await
            .expect("delete v2");
        assert_eq!(h.ref_count(&hash).await, 0);
    }

    #[tokio::test]
    async fn test_should_hard_delete_specific_version_without_touching_markers() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.enable_versioning(&bucket).await;

        h.put_bytes("b", "k", b"v1").await;
        let marker = h
            .svc
            .delete(&h.alice, "b", "k", None)
            .await
            .expect("tombstone");
        let marker_vid = marker.version_id.expect("marker id");

        // Deleting the marker by version removes it without refcount work.
        let out = h
            .svc
            .delete(&h.alice, "b", "k", Some(&marker_vid))
            .await
            .expect("delete marker");
        assert!(out.delete_marker);
        assert_eq!(h.ref_count(&sha256_hex(b"v1")).await, 1);
    }

    // -----------------------------------------------------------------------
    // DELETE
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_succeed_deleting_missing_key() {
        let h = harness().await;
        h.make_bucket("b").await;
        let out = h
            .svc
            .delete(&h.alice, "b", "ghost", None)
            .await
            .expect("idempotent delete");
        assert!(!out.delete_marker);
        assert!(out.version_id.is_none());
    }

    #[tokio::test]
    async fn test_should_release_reference_on_delete() {
        let h = harness().await;
        h.make_bucket("b").await;
        h.put_bytes("b", "k", b"doomed").await;

        h.svc
            .delete(&h.alice, "b", "k", None)
            .await
            .expect("test delete");

        assert_eq!(h.ref_count(&sha256_hex(b"doomed")).await, 0);
        let result = h.svc.head(&h.alice, "b", "k", None).await;
        assert!(matches!(result, Err(ServiceError::NoSuchKey { .. })));
    }

    // -----------------------------------------------------------------------
    // Range reads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_serve_byte_range() {
        let h = harness().await;
        h.make_bucket("b").await;
        h.put_bytes("b", "k", b"hello world").await;

        let out = h
            .svc
            .get(
                &h.alice,
                GetObjectInput {
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    version_id: None,
                    range: Some("bytes=6-10".to_owned()),
                },
            )
            .await
            .expect("test range get");

        let range = out.content_range.expect("range populated");
        assert_eq!((range.start, range.end, range.total), (6, 10, 11));
        assert_eq!(read_all(out.body).await, b"world");
    }

    #[tokio::test]
    async fn test_should_reject_unsatisfiable_range() {
        let h = harness().await;
        h.make_bucket("b").await;
        h.put_bytes("b", "k", b"abc").await;

        let result = h
            .svc
            .get(
                &h.alice,
                GetObjectInput {
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    version_id: None,
                    range: Some("bytes=10-20".to_owned()),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidRange)));
    }

    // -----------------------------------------------------------------------
    // COPY
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_copy_by_reference() {
        let h = harness().await;
        h.make_bucket("src").await;
        h.make_bucket("dst").await;
        h.put_bytes("src", "k", b"shared").await;

        let out = h
            .svc
            .copy(
                &h.alice,
                CopyObjectInput {
                    source_bucket: "src".to_owned(),
                    source_key: "k".to_owned(),
                    source_version_id: None,
                    bucket: "dst".to_owned(),
                    key: "copied".to_owned(),
                    metadata_directive: MetadataDirective::Copy,
                    content_type: None,
                    metadata: UserMetadata::new(),
                },
            )
            .await
            .expect("test copy");

        let hash = sha256_hex(b"shared");
        assert_eq!(h.ref_count(&hash).await, 2);
        assert_eq!(out.etag, etag::simple_etag(&hash));
        assert_eq!(h.get_bytes("dst", "copied", None).await, b"shared");

        // COPY directive carries the source content type.
        let record = h
            .svc
            .head(&h.alice, "dst", "copied", None)
            .await
            .expect("test head");
        assert_eq!(record.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_should_replace_metadata_on_copy() {
        let h = harness().await;
        h.make_bucket("b").await;
        h.put_bytes("b", "k", b"data").await;

        let mut new_meta = UserMetadata::new();
        new_meta.insert("owner".to_owned(), "ops".to_owned());
        h.svc
            .copy(
                &h.alice,
                CopyObjectInput {
                    source_bucket: "b".to_owned(),
                    source_key: "k".to_owned(),
                    source_version_id: None,
                    bucket: "b".to_owned(),
                    key: "k2".to_owned(),
                    metadata_directive: MetadataDirective::Replace,
                    content_type: Some("application/json".to_owned()),
                    metadata: new_meta,
                },
            )
            .await
            .expect("test copy");

        let record = h
            .svc
            .head(&h.alice, "b", "k2", None)
            .await
            .expect("test head");
        assert_eq!(record.content_type, "application/json");
        assert_eq!(record.metadata.get("owner").map(String::as_str), Some("ops"));
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_list_with_prefix_and_delimiter() {
        let h = harness().await;
        h.make_bucket("b").await;
        for key in ["a/1.txt", "a/2.txt", "b/deep/3.txt", "top.txt"] {
            h.put_bytes("b", key, b"x").await;
        }

        let out = h
            .svc
            .list_objects_v2(
                &h.alice,
                ListObjectsInput {
                    bucket: "b".to_owned(),
                    delimiter: Some("/".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .expect("test list");

        assert_eq!(
            out.contents
                .iter()
                .map(|o| o.key.as_str())
                .collect::<Vec<_>>(),
            vec!["top.txt"]
        );
        assert_eq!(out.common_prefixes, vec!["a/", "b/"]);
        assert!(!out.is_truncated);
    }

    #[tokio::test]
    async fn test_should_paginate_with_continuation_token() {
        let h = harness().await;
        h.make_bucket("b").await;
        for i in 0..5 {
            h.put_bytes("b", &format!("k{i}"), b"x").await;
        }

        let first = h
            .svc
            .list_objects_v2(
                &h.alice,
                ListObjectsInput {
                    bucket: "b".to_owned(),
                    max_keys: Some(2),
                    ..Default::default()
                },
            )
            .await
            .expect("page 1");
        assert_eq!(first.contents.len(), 2);
        assert!(first.is_truncated);
        let token = first.next_continuation_token.expect("token");

        let second = h
            .svc
            .list_objects_v2(
                &h.alice,
                ListObjectsInput {
                    bucket: "b".to_owned(),
                    max_keys: Some(10),
                    continuation_token: Some(token),
                    ..Default::default()
                },
            )
            .await
            .expect("page 2");
        assert_eq!(
            second
                .contents
                .iter()
                .map(|o| o.key.as_str())
                .collect::<Vec<_>>(),
            vec!["k2", "k3", "k4"]
        );
        assert!(!second.is_truncated);
        assert!(second.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_should_paginate_version_listing() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.enable_versioning(&bucket).await;

        for _ in 0..3 {
            h.put_bytes("b", "k", b"data").await;
        }

        let first = h
            .svc
            .list_versions(
                &h.alice,
                ListVersionsInput {
                    bucket: "b".to_owned(),
                    max_keys: Some(2),
                    ..Default::default()
                },
            )
            .await
            .expect("page 1");
        assert_eq!(first.versions.len(), 2);
        assert!(first.is_truncated);

        let second = h
            .svc
            .list_versions(
                &h.alice,
                ListVersionsInput {
                    bucket: "b".to_owned(),
                    key_marker: first.next_key_marker.clone(),
                    version_id_marker: first.next_version_id_marker.clone(),
                    max_keys: Some(10),
                    ..Default::default()
                },
            )
            .await
            .expect("page 2");
        assert_eq!(second.versions.len(), 1);
        assert!(!second.is_truncated);

        // No overlap between pages.
        let mut seen: Vec<String> = first
            .versions
            .iter()
            .chain(second.versions.iter())
            .map(|v| v.version_id.clone())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_fail_fast_when_key_is_locked() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;

        let lock_key = locker::object_upload_lock_key(bucket.id, "k");
        h.locker
            .acquire(&lock_key, Duration::from_secs(30))
            .await
            .expect("test lock");

        let result = h
            .svc
            .put(
                &h.alice,
                PutObjectInput {
                    bucket: "b".to_owned(),
                    key: "k".to_owned(),
                    size: 1,
                    content_type: None,
                    storage_class: None,
                    metadata: UserMetadata::new(),
                    body: Box::new(std::io::Cursor::new(b"x".to_vec())),
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::LockNotAcquired { .. })));

        // A different key is unaffected.
        h.put_bytes("b", "other", b"x").await;
    }
    #[tokio::test]
    async fn test_should_overwrite_only_null_version_when_suspended() {
        let h = harness().await;
        let bucket = h.make_bucket("b").await;
        h.enable_versioning(&bucket).await;

        // One version written while versioning was enabled.
        let put1 = h.put_bytes("b", "k", b"enabled-era").await;
        let v1 = put1.version_id.expect("versioned put returns id");

        h.meta
            .set_versioning(bucket.id, VersioningState::Suspended)
            .await
            .expect("test suspend");

        // Two suspended-era writes overwrite the same null version.
        h.put_bytes("b", "k", b"null-one").await;
        h.put_bytes("b", "k", b"null-two").await;

        assert_eq!(h.ref_count(&sha256_hex(b"null-one")).await, 0);
        assert_eq!(h.get_bytes("b", "k", None).await, b"null-two");
        // The enabled-era version survives untouched.
        assert_eq!(h.get_bytes("b", "k", Some(&v1)).await, b"enabled-era");

        // DELETE shadows the key with a null marker, replacing the null
        // version, and still leaves history readable.
        let deleted = h
            .svc
            .delete(&h.alice, "b", "k", None)
            .await
            .expect("test delete");
        assert!(deleted.delete_marker);
        assert_eq!(deleted.version_id.as_deref(), Some(NULL_VERSION_ID));
        assert_eq!(h.ref_count(&sha256_hex(b"null-two")).await, 0);
        assert_eq!(h.get_bytes("b", "k", Some(&v1)).await, b"enabled-era");
    }
}
