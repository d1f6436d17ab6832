//! Capability traits over the metadata store.
//!
//! Each service depends only on the traits it needs, so tests can stub a
//! single capability and the SQL adapter stays swappable. One adapter type
//! ([`crate::SqliteMetaStore`]) implements all of them; an `Arc` of it
//! coerces to any individual trait object.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    AccessKey, BlobRecord, Bucket, BucketAcl, KeyStatus, LifecycleRule, MultipartUpload,
    ObjectRecord, UploadPart, UploadStatus, UserMetadata, VersioningState,
};
use crate::entities::User;
use crate::error::MetaResult;

// ---------------------------------------------------------------------------
// Insert payloads
// ---------------------------------------------------------------------------

/// Fields for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login name (globally unique).
    pub username: String,
    /// Email (globally unique).
    pub email: String,
    /// Pre-hashed password.
    pub password_hash: String,
    /// Whether the account has admin rights.
    pub is_admin: bool,
}

/// Fields for creating an access key.
#[derive(Debug, Clone)]
pub struct NewAccessKey {
    /// Owning user.
    pub user_id: i64,
    /// Generated key id.
    pub access_key_id: String,
    /// Sealed secret.
    pub encrypted_secret: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Fields for creating a bucket.
#[derive(Debug, Clone)]
pub struct NewBucket {
    /// Owning user.
    pub owner_id: i64,
    /// Bucket name (globally unique, pre-validated).
    pub name: String,
    /// Region label.
    pub region: String,
    /// Whether object lock is enabled at creation.
    pub object_lock: bool,
}

/// Fields for inserting an object version row.
#[derive(Debug, Clone)]
pub struct NewObject {
    /// Owning bucket.
    pub bucket_id: i64,
    /// Object key.
    pub key: String,
    /// Version id for the new row.
    pub version_id: String,
    /// Whether this row is a delete marker.
    pub is_delete_marker: bool,
    /// Blob reference; `None` only for delete markers.
    pub content_hash: Option<String>,
    /// Payload size.
    pub size: i64,
    /// MIME type.
    pub content_type: String,
    /// Quoted entity tag.
    pub etag: String,
    /// Storage class label.
    pub storage_class: String,
    /// User metadata.
    pub metadata: UserMetadata,
}

/// Fields for creating a multipart upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    /// Upload id (UUID, generated by the service).
    pub id: String,
    /// Target bucket.
    pub bucket_id: i64,
    /// Target key.
    pub key: String,
    /// Initiating user.
    pub initiator_id: i64,
    /// Storage class for the final object.
    pub storage_class: String,
    /// User metadata for the final object.
    pub metadata: UserMetadata,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Fields for recording an uploaded part.
#[derive(Debug, Clone)]
pub struct NewPart {
    /// Owning upload.
    pub upload_id: String,
    /// Part number in `[1, 10000]`.
    pub part_number: i32,
    /// Blob reference.
    pub content_hash: String,
    /// Part size.
    pub size: i64,
    /// Quoted part entity tag.
    pub etag: String,
}

/// Fields for creating a lifecycle rule.
#[derive(Debug, Clone)]
pub struct NewLifecycleRule {
    /// Bucket the rule applies to.
    pub bucket_id: i64,
    /// Key prefix filter.
    pub prefix: String,
    /// Expiration age in days.
    pub expiration_days: i32,
    /// Whether the rule is active.
    pub enabled: bool,
}

/// Result of the atomic blob upsert.
#[derive(Debug, Clone, Copy)]
pub struct BlobRefOutcome {
    /// Whether the row was created (first reference) rather than bumped.
    pub is_new: bool,
    /// The reference count after the operation.
    pub ref_count: i32,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// User accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user. Fails with a unique violation on duplicate
    /// username or email.
    async fn create_user(&self, new: NewUser) -> MetaResult<User>;

    /// Fetch a user by id.
    async fn get_user(&self, id: i64) -> MetaResult<User>;

    /// Fetch a user by username.
    async fn get_user_by_username(&self, username: &str) -> MetaResult<User>;

    /// All users, ordered by id.
    async fn list_users(&self) -> MetaResult<Vec<User>>;

    /// Delete a user (cascades to access keys).
    async fn delete_user(&self, id: i64) -> MetaResult<()>;

    /// Enable or disable authentication for a user.
    async fn set_user_active(&self, id: i64, active: bool) -> MetaResult<()>;
}

/// Access keys.
#[async_trait]
pub trait AccessKeyStore: Send + Sync {
    /// Insert a key. Fails with a unique violation on duplicate key id.
    async fn insert_access_key(&self, new: NewAccessKey) -> MetaResult<AccessKey>;

    /// Fetch a key by its access key id.
    async fn get_access_key(&self, access_key_id: &str) -> MetaResult<AccessKey>;

    /// All keys of a user, newest first.
    async fn list_access_keys(&self, user_id: i64) -> MetaResult<Vec<AccessKey>>;

    /// Count the user's `Active` keys (for the per-user cap).
    async fn count_active_keys(&self, user_id: i64) -> MetaResult<i64>;

    /// Flip a key's status.
    async fn set_key_status(&self, access_key_id: &str, status: KeyStatus) -> MetaResult<()>;

    /// Remove a key permanently.
    async fn delete_access_key(&self, access_key_id: &str) -> MetaResult<()>;

    /// Remove every key whose expiry is in the past. Returns how many.
    async fn delete_expired_keys(&self, now: DateTime<Utc>) -> MetaResult<u64>;

    /// Best-effort update of `last_used_at`.
    async fn touch_last_used(&self, access_key_id: &str, at: DateTime<Utc>) -> MetaResult<()>;
}

/// Buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Insert a bucket. Fails with a unique violation on duplicate name.
    async fn create_bucket(&self, new: NewBucket) -> MetaResult<Bucket>;

    /// Fetch a bucket by name.
    async fn get_bucket(&self, name: &str) -> MetaResult<Bucket>;

    /// Fetch a bucket by id.
    async fn get_bucket_by_id(&self, id: i64) -> MetaResult<Bucket>;

    /// Buckets, optionally restricted to one owner, ordered by name.
    async fn list_buckets(&self, owner_id: Option<i64>) -> MetaResult<Vec<Bucket>>;

    /// Delete a bucket row (objects cascade; callers enforce emptiness).
    async fn delete_bucket(&self, id: i64) -> MetaResult<()>;

    /// Set the versioning state.
    async fn set_versioning(&self, id: i64, state: VersioningState) -> MetaResult<()>;

    /// Set the canned ACL.
    async fn set_acl(&self, id: i64, acl: BucketAcl) -> MetaResult<()>;

    /// Count current, visible objects (excluding delete markers).
    async fn count_current_objects(&self, bucket_id: i64) -> MetaResult<i64>;
}

/// Versioned object rows.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Atomically clear `is_latest` on the key's current rows and insert
    /// `new` as the latest version. Used by versioned writes.
    async fn insert_as_latest(&self, new: NewObject) -> MetaResult<ObjectRecord>;

    /// Atomically delete every row for the key and insert `new` as the only
    /// row. Used by non-versioned overwrites, which keep exactly one row
    /// per key.
    async fn insert_replacing(&self, new: NewObject) -> MetaResult<ObjectRecord>;

    /// Clear `is_latest` on the key's current rows.
    async fn mark_not_latest(&self, bucket_id: i64, key: &str) -> MetaResult<u64>;

    /// The key's current row (may be a delete marker), if any.
    async fn get_current(&self, bucket_id: i64, key: &str) -> MetaResult<Option<ObjectRecord>>;

    /// A specific version row, if any.
    async fn get_version(
        &self,
        bucket_id: i64,
        key: &str,
        version_id: &str,
    ) -> MetaResult<Option<ObjectRecord>>;

    /// Hard-delete one version row by row id.
    async fn delete_version(&self, id: i64) -> MetaResult<()>;

    /// Current, visible, non-marker rows with `key > start_after` matching
    /// `prefix`, ordered by key, up to `limit`.
    async fn list_current(
        &self,
        bucket_id: i64,
        prefix: &str,
        start_after: &str,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>>;

    /// All version rows (including delete markers) with `key >= key_marker`
    /// matching `prefix`, ordered by key ascending then creation time
    /// descending, up to `limit`.
    async fn list_versions(
        &self,
        bucket_id: i64,
        prefix: &str,
        key_marker: &str,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>>;

    /// Current, visible, non-marker rows older than `cutoff` matching
    /// `prefix`, ordered by key, up to `limit` (lifecycle expiration).
    async fn list_expired_current(
        &self,
        bucket_id: i64,
        prefix: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> MetaResult<Vec<ObjectRecord>>;
}

/// The refcounted blob index.
#[async_trait]
pub trait BlobIndex: Send + Sync {
    /// Atomic upsert-with-ref-increment: insert the row with `ref_count=1`,
    /// or bump `ref_count` if the hash exists. Single statement, no
    /// check-then-act window.
    async fn upsert_blob_ref(
        &self,
        content_hash: &str,
        size: i64,
        storage_path: &str,
    ) -> MetaResult<BlobRefOutcome>;

    /// Atomically decrement `ref_count`, returning the new value. Callers
    /// never delete here; reclamation belongs to the garbage collector.
    async fn decrement_blob_ref(&self, content_hash: &str) -> MetaResult<i32>;

    /// Fetch a blob row.
    async fn get_blob(&self, content_hash: &str) -> MetaResult<Option<BlobRecord>>;

    /// Blobs with `ref_count <= 0` created before `cutoff`, oldest first.
    async fn list_orphans(&self, cutoff: DateTime<Utc>, limit: i64) -> MetaResult<Vec<BlobRecord>>;

    /// Remove a blob row (after its file is gone).
    async fn delete_blob_record(&self, content_hash: &str) -> MetaResult<()>;
}

/// Multipart uploads and their parts.
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Insert an upload in the `InProgress` state.
    async fn create_upload(&self, new: NewUpload) -> MetaResult<MultipartUpload>;

    /// Fetch an upload.
    async fn get_upload(&self, upload_id: &str) -> MetaResult<Option<MultipartUpload>>;

    /// Move an upload to a terminal status.
    async fn set_upload_status(
        &self,
        upload_id: &str,
        status: UploadStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> MetaResult<()>;

    /// Insert or replace a part row. Returns the content hash of the
    /// replaced part, if one existed, so the caller can release its blob
    /// reference.
    async fn upsert_part(&self, new: NewPart) -> MetaResult<Option<String>>;

    /// Fetch one part.
    async fn get_part(&self, upload_id: &str, part_number: i32) -> MetaResult<Option<UploadPart>>;

    /// Parts with `part_number > part_number_marker`, ascending, up to
    /// `limit`.
    async fn list_parts(
        &self,
        upload_id: &str,
        part_number_marker: i32,
        limit: i64,
    ) -> MetaResult<Vec<UploadPart>>;

    /// In-progress uploads of a bucket, ordered by `(key, id)` past the
    /// markers, up to `limit`.
    async fn list_uploads(
        &self,
        bucket_id: i64,
        key_marker: &str,
        upload_id_marker: &str,
        limit: i64,
    ) -> MetaResult<Vec<MultipartUpload>>;

    /// In-progress uploads past their expiry, oldest first.
    async fn list_expired_uploads(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> MetaResult<Vec<MultipartUpload>>;

    /// Transactionally release every part's blob reference, delete the part
    /// rows, and mark the upload `Aborted`. Returns the number of parts
    /// released.
    async fn abort_upload(&self, upload_id: &str) -> MetaResult<u64>;
}

/// Lifecycle rules.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Insert a rule.
    async fn put_rule(&self, new: NewLifecycleRule) -> MetaResult<LifecycleRule>;

    /// Rules for one bucket.
    async fn list_rules(&self, bucket_id: i64) -> MetaResult<Vec<LifecycleRule>>;

    /// Enabled rules across all buckets.
    async fn list_enabled_rules(&self) -> MetaResult<Vec<LifecycleRule>>;

    /// Delete a rule.
    async fn delete_rule(&self, id: i64) -> MetaResult<()>;
}
