//! The authenticated caller.

use strata_meta::entities::{Bucket, BucketAcl};

/// Identity attached to every service call.
///
/// Built by the HTTP layer from a verified signature (or by the CLI for
/// administrative work) and carried explicitly through the call chain.
#[derive(Debug, Clone)]
pub struct Principal {
    /// The owning user id.
    pub user_id: i64,
    /// The access key that authenticated the request, when one did.
    pub access_key_id: Option<String>,
    /// Admins bypass ownership checks.
    pub is_admin: bool,
}

impl Principal {
    /// A regular authenticated user.
    #[must_use]
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            access_key_id: None,
            is_admin: false,
        }
    }

    /// A user authenticated through a specific access key.
    #[must_use]
    pub fn with_access_key(user_id: i64, access_key_id: impl Into<String>) -> Self {
        Self {
            user_id,
            access_key_id: Some(access_key_id.into()),
            is_admin: false,
        }
    }

    /// The administrative identity used by the CLI and background tasks.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: 0,
            access_key_id: None,
            is_admin: true,
        }
    }

    /// Whether this principal owns the bucket or is an admin.
    #[must_use]
    pub fn owns(&self, bucket: &Bucket) -> bool {
        self.is_admin || bucket.owner_id == self.user_id
    }

    /// Whether this principal may read from the bucket.
    #[must_use]
    pub fn may_read(&self, bucket: &Bucket) -> bool {
        self.owns(bucket)
            || matches!(
                bucket.acl,
                BucketAcl::PublicRead | BucketAcl::PublicReadWrite
            )
    }

    /// Whether this principal may write to the bucket.
    #[must_use]
    pub fn may_write(&self, bucket: &Bucket) -> bool {
        self.owns(bucket) || bucket.acl == BucketAcl::PublicReadWrite
    }
}
