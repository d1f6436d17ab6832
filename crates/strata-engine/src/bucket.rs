//! Bucket operations.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use strata_core::cache::TtlCache;
use strata_meta::MetaError;
use strata_meta::entities::{Bucket, BucketAcl, VersioningState};
use strata_meta::store::{BucketStore, NewBucket};

use crate::error::{ServiceError, ServiceResult};
use crate::principal::Principal;
use crate::validation::validate_bucket_name;

/// Default region recorded on new buckets.
pub const DEFAULT_REGION: &str = "us-east-1";

/// How long bucket rows may be served from cache.
const BUCKET_CACHE_TTL: Duration = Duration::from_secs(5);

/// Bucket CRUD, versioning, and ACL handling.
pub struct BucketService {
    store: Arc<dyn BucketStore>,
    cache: TtlCache<Bucket>,
}

impl std::fmt::Debug for BucketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketService").finish_non_exhaustive()
    }
}

impl BucketService {
    /// Create the service over a bucket store.
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            cache: TtlCache::new(BUCKET_CACHE_TTL),
        }
    }

    /// Create a bucket owned by the principal.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidBucketName`] for names violating the rules,
    /// [`ServiceError::BucketAlreadyExists`] on collision.
    pub async fn create(
        &self,
        principal: &Principal,
        name: &str,
        region: Option<String>,
        object_lock: bool,
    ) -> ServiceResult<Bucket> {
        validate_bucket_name(name)?;

        let bucket = self
            .store
            .create_bucket(NewBucket {
                owner_id: principal.user_id,
                name: name.to_owned(),
                region: region.unwrap_or_else(|| DEFAULT_REGION.to_owned()),
                object_lock,
            })
            .await
            .map_err(|e| match e {
                MetaError::UniqueViolation { .. } => ServiceError::BucketAlreadyExists {
                    bucket: name.to_owned(),
                },
                other => other.into(),
            })?;

        info!(bucket = %bucket.name, owner_id = bucket.owner_id, "created bucket");
        Ok(bucket)
    }

    /// Fetch a bucket by name, consulting the cache first.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoSuchBucket`] when absent.
    pub async fn get(&self, name: &str) -> ServiceResult<Bucket> {
        if let Some(bucket) = self.cache.get(name) {
            return Ok(bucket);
        }
        let bucket = self.store.get_bucket(name).await.map_err(|e| match e {
            MetaError::NotFound { .. } => ServiceError::NoSuchBucket {
                bucket: name.to_owned(),
            },
            other => other.into(),
        })?;
        self.cache.insert(name, bucket.clone());
        Ok(bucket)
    }

    /// Existence check with read-permission enforcement.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoSuchBucket`] when absent,
    /// [`ServiceError::AccessDenied`] for private buckets of other users.
    pub async fn head(&self, principal: &Principal, name: &str) -> ServiceResult<Bucket> {
        let bucket = self.get(name).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }
        Ok(bucket)
    }

    /// List buckets: the principal's own, or every bucket for admins.
    pub async fn list(&self, principal: &Principal) -> ServiceResult<Vec<Bucket>> {
        let owner = if principal.is_admin {
            None
        } else {
            Some(principal.user_id)
        };
        Ok(self.store.list_buckets(owner).await?)
    }

    /// Delete an empty bucket.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AccessDenied`] without ownership,
    /// [`ServiceError::BucketNotEmpty`] when objects remain.
    pub async fn delete(&self, principal: &Principal, name: &str) -> ServiceResult<()> {
        let bucket = self.get(name).await?;
        if !principal.owns(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        let remaining = self.store.count_current_objects(bucket.id).await?;
        if remaining > 0 {
            return Err(ServiceError::BucketNotEmpty {
                bucket: name.to_owned(),
            });
        }

        self.store.delete_bucket(bucket.id).await?;
        self.cache.invalidate(name);
        info!(bucket = %name, "deleted bucket");
        Ok(())
    }

    /// Read the versioning state.
    pub async fn get_versioning(&self, name: &str) -> ServiceResult<VersioningState> {
        Ok(self.get(name).await?.versioning)
    }

    /// Change the versioning state. Only `Enabled` and `Suspended` are
    /// accepted; once versioning leaves `Disabled` it can never return.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidArgument`] for `Disabled`,
    /// [`ServiceError::AccessDenied`] without ownership.
    pub async fn put_versioning(
        &self,
        principal: &Principal,
        name: &str,
        state: VersioningState,
    ) -> ServiceResult<()> {
        if state == VersioningState::Disabled {
            return Err(ServiceError::InvalidArgument {
                message: "versioning can only be set to Enabled or Suspended".to_owned(),
            });
        }

        let bucket = self.get(name).await?;
        if !principal.owns(&bucket) {
            return Err(ServiceError::AccessDenied);
        }

        self.store.set_versioning(bucket.id, state).await?;
        self.cache.invalidate(name);
        debug!(bucket = %name, state = state.as_str(), "changed versioning state");
        Ok(())
    }

    /// Read the canned ACL.
    pub async fn get_acl(&self, principal: &Principal, name: &str) -> ServiceResult<BucketAcl> {
        let bucket = self.get(name).await?;
        if !principal.may_read(&bucket) {
            return Err(ServiceError::AccessDenied);
        }
        Ok(bucket.acl)
    }

    /// Change the canned ACL.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AccessDenied`] without ownership.
    pub async fn put_acl(
        &self,
        principal: &Principal,
        name: &str,
        acl: BucketAcl,
    ) -> ServiceResult<()> {
        let bucket = self.get(name).await?;
        if !principal.owns(&bucket) {
            return Err(ServiceError::AccessDenied);
        }
        self.store.set_acl(bucket.id, acl).await?;
        self.cache.invalidate(name);
        debug!(bucket = %name, acl = acl.as_str(), "changed bucket acl");
        Ok(())
    }
}
