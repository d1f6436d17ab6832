//! Persistent entity types.
//!
//! These structs mirror the metadata tables one to one. Nullable columns
//! are `Option<T>`; state columns are typed enums stored as text.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A registered account.
#[derive(Debug, Clone)]
pub struct User {
    /// Row id.
    pub id: i64,
    /// Globally unique login name.
    pub username: String,
    /// Globally unique email.
    pub email: String,
    /// Salted adaptive password hash (bcrypt).
    pub password_hash: String,
    /// Inactive users cannot authenticate.
    pub is_active: bool,
    /// Admins bypass ownership checks.
    pub is_admin: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Whether an access key may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// The key authenticates requests.
    Active,
    /// The key is disabled but retained.
    Inactive,
}

impl KeyStatus {
    /// The stored text form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }

    /// Parse the stored text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(Self::Active),
            "Inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// An API credential owned by a user.
#[derive(Debug, Clone)]
pub struct AccessKey {
    /// Row id.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Globally unique 20-character id.
    pub access_key_id: String,
    /// AES-256-GCM sealed secret (base64 of nonce ‖ ciphertext ‖ tag).
    pub encrypted_secret: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Whether the key may authenticate.
    pub status: KeyStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Optional expiry; a past value disables the key.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful authentication, best effort.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AccessKey {
    /// Whether the key can authenticate at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Active && self.expires_at.is_none_or(|at| at > now)
    }
}

/// Bucket versioning state. Transitions only move forward from
/// `Disabled`; once versioning has been enabled a bucket can only toggle
/// between `Enabled` and `Suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningState {
    /// Versioning has never been enabled.
    Disabled,
    /// New writes create versions.
    Enabled,
    /// Writes overwrite the null version, history is retained.
    Suspended,
}

impl VersioningState {
    /// The stored text form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Enabled => "Enabled",
            Self::Suspended => "Suspended",
        }
    }

    /// Parse the stored text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Disabled" => Some(Self::Disabled),
            "Enabled" => Some(Self::Enabled),
            "Suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Canned bucket ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketAcl {
    /// Owner only.
    Private,
    /// Anonymous reads allowed.
    PublicRead,
    /// Anonymous reads and writes allowed.
    PublicReadWrite,
}

impl BucketAcl {
    /// The stored (and wire) text form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public-read",
            Self::PublicReadWrite => "public-read-write",
        }
    }

    /// Parse the stored text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "public-read" => Some(Self::PublicRead),
            "public-read-write" => Some(Self::PublicReadWrite),
            _ => None,
        }
    }
}

/// A bucket.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Row id.
    pub id: i64,
    /// Owning user.
    pub owner_id: i64,
    /// Globally unique name.
    pub name: String,
    /// Region reported in listings.
    pub region: String,
    /// Versioning state.
    pub versioning: VersioningState,
    /// Object-lock flag; once set it can never be cleared.
    pub object_lock: bool,
    /// Canned ACL.
    pub acl: BucketAcl,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// Whether new writes should create distinct versions.
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.versioning == VersioningState::Enabled
    }
}

/// User metadata attached to objects and uploads (`x-amz-meta-*`).
pub type UserMetadata = HashMap<String, String>;

/// One version row of an object.
///
/// For each `(bucket_id, key)` at most one row has `is_latest` set with
/// `deleted_at` null; that row is the key's current state. Delete markers
/// carry no content hash and a zero size.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    /// Row id.
    pub id: i64,
    /// Owning bucket.
    pub bucket_id: i64,
    /// Object key (at most 1024 bytes).
    pub key: String,
    /// Version id (UUIDv4, or `null` for never-versioned rows).
    pub version_id: String,
    /// Whether this row is the key's current version.
    pub is_latest: bool,
    /// Whether this row is a delete marker.
    pub is_delete_marker: bool,
    /// Content hash referencing a blob row; `None` for delete markers.
    pub content_hash: Option<String>,
    /// Payload size in bytes.
    pub size: i64,
    /// MIME type.
    pub content_type: String,
    /// Quoted entity tag.
    pub etag: String,
    /// Storage class label.
    pub storage_class: String,
    /// User metadata.
    pub metadata: UserMetadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-deletion time, if tombstoned.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One row of the refcounted blob index.
#[derive(Debug, Clone)]
pub struct BlobRecord {
    /// Primary key: 64 lowercase hex characters.
    pub content_hash: String,
    /// Payload size in bytes.
    pub size: i64,
    /// Sharded path relative to the blob root.
    pub storage_path: String,
    /// Live references from object versions and upload parts.
    pub ref_count: i32,
    /// Creation time; the GC grace period counts from here.
    pub created_at: DateTime<Utc>,
    /// Last read or reference time.
    pub last_accessed: DateTime<Utc>,
    /// Whether the payload is wrapped in an encryption envelope.
    pub is_encrypted: bool,
    /// Envelope IV when encrypted.
    pub encryption_iv: Option<String>,
}

/// Multipart upload state. Transitions are monotonic:
/// `InProgress → Completed | Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Accepting parts.
    InProgress,
    /// Assembled into a final object.
    Completed,
    /// Cancelled; parts released.
    Aborted,
}

impl UploadStatus {
    /// The stored text form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
        }
    }

    /// Parse the stored text form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InProgress" => Some(Self::InProgress),
            "Completed" => Some(Self::Completed),
            "Aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// A multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    /// Upload id (UUID).
    pub id: String,
    /// Target bucket.
    pub bucket_id: i64,
    /// Target key.
    pub key: String,
    /// User who initiated the upload.
    pub initiator_id: i64,
    /// Lifecycle state.
    pub status: UploadStatus,
    /// Storage class for the final object.
    pub storage_class: String,
    /// User metadata for the final object.
    pub metadata: UserMetadata,
    /// Initiation time.
    pub initiated_at: DateTime<Utc>,
    /// Expiry; the GC sweep aborts uploads past this point.
    pub expires_at: DateTime<Utc>,
    /// Completion time once assembled.
    pub completed_at: Option<DateTime<Utc>>,
}

impl MultipartUpload {
    /// Whether the upload can still accept parts at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == UploadStatus::InProgress && self.expires_at > now
    }
}

/// One uploaded part.
#[derive(Debug, Clone)]
pub struct UploadPart {
    /// Row id.
    pub id: i64,
    /// Owning upload.
    pub upload_id: String,
    /// Part number in `[1, 10000]`, unique per upload.
    pub part_number: i32,
    /// Content hash referencing a blob row.
    pub content_hash: String,
    /// Part size in bytes.
    pub size: i64,
    /// Quoted part entity tag.
    pub etag: String,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// A bucket lifecycle expiration rule.
#[derive(Debug, Clone)]
pub struct LifecycleRule {
    /// Row id.
    pub id: i64,
    /// Bucket the rule applies to.
    pub bucket_id: i64,
    /// Key prefix filter (empty matches everything).
    pub prefix: String,
    /// Age in days after which current versions expire.
    pub expiration_days: i32,
    /// Whether the rule is evaluated.
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_roundtrip_enum_text_forms() {
        for status in [KeyStatus::Active, KeyStatus::Inactive] {
            assert_eq!(KeyStatus::parse(status.as_str()), Some(status));
        }
        for state in [
            VersioningState::Disabled,
            VersioningState::Enabled,
            VersioningState::Suspended,
        ] {
            assert_eq!(VersioningState::parse(state.as_str()), Some(state));
        }
        for acl in [
            BucketAcl::Private,
            BucketAcl::PublicRead,
            BucketAcl::PublicReadWrite,
        ] {
            assert_eq!(BucketAcl::parse(acl.as_str()), Some(acl));
        }
        for status in [
            UploadStatus::InProgress,
            UploadStatus::Completed,
            UploadStatus::Aborted,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(KeyStatus::parse("bogus"), None);
        assert_eq!(VersioningState::parse("enabled"), None);
    }

    #[test]
    fn test_should_judge_access_key_usability() {
        let now = Utc::now();
        let mut key = AccessKey {
            id: 1,
            user_id: 1,
            access_key_id: "AKIA".to_owned(),
            encrypted_secret: String::new(),
            description: None,
            status: KeyStatus::Active,
            created_at: now,
            expires_at: None,
            last_used_at: None,
        };
        assert!(key.is_usable(now));

        key.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!key.is_usable(now));

        key.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(key.is_usable(now));

        key.status = KeyStatus::Inactive;
        assert!(!key.is_usable(now));
    }

    #[test]
    fn test_should_judge_upload_activity() {
        let now = Utc::now();
        let mut upload = MultipartUpload {
            id: "u".to_owned(),
            bucket_id: 1,
            key: "k".to_owned(),
            initiator_id: 1,
            status: UploadStatus::InProgress,
            storage_class: "STANDARD".to_owned(),
            metadata: UserMetadata::new(),
            initiated_at: now,
            expires_at: now + chrono::Duration::days(7),
            completed_at: None,
        };
        assert!(upload.is_active(now));

        upload.expires_at = now - chrono::Duration::seconds(1);
        assert!(!upload.is_active(now));

        upload.expires_at = now + chrono::Duration::days(7);
        upload.status = UploadStatus::Aborted;
        assert!(!upload.is_active(now));
    }
}
