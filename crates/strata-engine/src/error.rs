//! Service error taxonomy.
//!
//! Every variant maps to an S3 error code and HTTP status through
//! [`ServiceError::code`] and [`ServiceError::http_status`], so the
//! external HTTP layer renders the XML envelope without inspecting
//! messages. Lower-level I/O and database failures collapse into
//! [`ServiceError::Internal`], whose outward message is generic; details
//! stay in logs.

use strata_blob::BlobError;
use strata_core::locker::LockError;
use strata_meta::MetaError;

/// Errors surfaced by the service layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------
    /// Signature verification failure, passed through from the auth engine.
    #[error(transparent)]
    Auth(#[from] strata_auth::AuthError),

    /// The caller is authenticated but not allowed to do this.
    #[error("access denied")]
    AccessDenied,

    // -----------------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------------
    /// The bucket does not exist.
    #[error("the specified bucket does not exist: {bucket}")]
    NoSuchBucket {
        /// The missing bucket name.
        bucket: String,
    },

    /// The bucket name is taken.
    #[error("the requested bucket name is not available: {bucket}")]
    BucketAlreadyExists {
        /// The colliding bucket name.
        bucket: String,
    },

    /// The bucket still holds objects.
    #[error("the bucket you tried to delete is not empty: {bucket}")]
    BucketNotEmpty {
        /// The non-empty bucket name.
        bucket: String,
    },

    /// The bucket name violates the naming rules.
    #[error("invalid bucket name {name}: {reason}")]
    InvalidBucketName {
        /// The rejected name.
        name: String,
        /// Which rule failed.
        reason: String,
    },

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------
    /// The key does not exist.
    #[error("the specified key does not exist: {key}")]
    NoSuchKey {
        /// The missing key.
        key: String,
    },

    /// The version does not exist.
    #[error("the specified version does not exist: key={key}, version_id={version_id}")]
    NoSuchVersion {
        /// The key.
        key: String,
        /// The missing version id.
        version_id: String,
    },

    /// The key's current state is a delete marker.
    #[error("the object was deleted: {key}")]
    ObjectDeleted {
        /// The shadowed key.
        key: String,
    },

    /// The object key exceeds 1024 bytes.
    #[error("the object key is too long")]
    KeyTooLong,

    // -----------------------------------------------------------------------
    // Multipart
    // -----------------------------------------------------------------------
    /// The upload id does not exist.
    #[error("the specified upload does not exist: {upload_id}")]
    NoSuchUpload {
        /// The missing upload id.
        upload_id: String,
    },

    /// The upload was already completed.
    #[error("the upload has already been completed")]
    UploadCompleted,

    /// The upload was aborted.
    #[error("the upload has been aborted")]
    UploadAborted,

    /// The upload passed its expiry.
    #[error("the upload has expired")]
    UploadExpired,

    /// A part is missing, out of range, or its ETag does not match.
    #[error("one or more of the specified parts could not be found or did not match")]
    InvalidPart,

    /// The part list is not in ascending order.
    #[error("the list of parts was not in ascending order")]
    InvalidPartOrder,

    /// A non-final part is below the minimum size.
    #[error("your proposed upload is smaller than the minimum allowed size")]
    EntityTooSmall,

    /// A part exceeds the maximum size.
    #[error("your proposed upload exceeds the maximum allowed size")]
    EntityTooLarge,

    // -----------------------------------------------------------------------
    // Users / access keys
    // -----------------------------------------------------------------------
    /// Duplicate username or email.
    #[error("a user with that name or email already exists")]
    UserAlreadyExists,

    /// The user does not exist.
    #[error("the specified user does not exist")]
    NoSuchUser,

    /// The user already holds the maximum number of active keys.
    #[error("the user already has the maximum number of active access keys")]
    TooManyAccessKeys,

    /// The access key does not exist.
    #[error("the specified access key does not exist")]
    NoSuchAccessKey,

    // -----------------------------------------------------------------------
    // Storage
    // -----------------------------------------------------------------------
    /// The blob file is missing from the backend.
    #[error("blob not found: {content_hash}")]
    BlobNotFound {
        /// The missing content hash.
        content_hash: String,
    },

    /// Stored bytes do not match their content hash.
    #[error("blob corrupted: {content_hash}")]
    BlobCorrupted {
        /// The corrupt content hash.
        content_hash: String,
    },

    /// The backend is out of space.
    #[error("insufficient storage")]
    StorageFull,

    /// The requested range is not satisfiable.
    #[error("the requested range is not satisfiable")]
    InvalidRange,

    // -----------------------------------------------------------------------
    // Generic validation
    // -----------------------------------------------------------------------
    /// An argument is invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What is wrong.
        message: String,
    },

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------
    /// A conflicting operation holds the lock; the caller should retry.
    #[error("the resource is busy, try again: {key}")]
    LockNotAcquired {
        /// The contended lock key.
        key: String,
    },

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------
    /// Anything else. The outward message is intentionally generic.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

/// Convenience result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// The S3 error code string for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::AccessDenied => "AccessDenied",
            Self::NoSuchBucket { .. } => "NoSuchBucket",
            Self::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            Self::BucketNotEmpty { .. } => "BucketNotEmpty",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::NoSuchVersion { .. } => "NoSuchVersion",
            Self::ObjectDeleted { .. } => "ObjectDeleted",
            Self::KeyTooLong => "KeyTooLongError",
            Self::NoSuchUpload { .. } => "NoSuchUpload",
            Self::UploadCompleted => "UploadCompleted",
            Self::UploadAborted => "UploadAborted",
            Self::UploadExpired => "UploadExpired",
            Self::InvalidPart => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::EntityTooSmall => "EntityTooSmall",
            Self::EntityTooLarge => "EntityTooLarge",
            Self::UserAlreadyExists => "UserAlreadyExists",
            Self::NoSuchUser => "NoSuchUser",
            Self::TooManyAccessKeys => "TooManyAccessKeys",
            Self::NoSuchAccessKey => "NoSuchAccessKey",
            Self::BlobNotFound { .. } => "BlobNotFound",
            Self::BlobCorrupted { .. } => "BlobCorrupted",
            Self::StorageFull => "StorageFull",
            Self::InvalidRange => "InvalidRange",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::LockNotAcquired { .. } => "SlowDown",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The HTTP status the front-end should answer with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Auth(e) => e.http_status(),
            Self::AccessDenied => 403,
            Self::NoSuchBucket { .. }
            | Self::NoSuchKey { .. }
            | Self::NoSuchVersion { .. }
            | Self::ObjectDeleted { .. }
            | Self::NoSuchUpload { .. }
            | Self::NoSuchUser
            | Self::NoSuchAccessKey
            | Self::BlobNotFound { .. } => 404,
            Self::BucketAlreadyExists { .. }
            | Self::BucketNotEmpty { .. }
            | Self::UserAlreadyExists
            | Self::UploadCompleted
            | Self::UploadAborted => 409,
            Self::InvalidBucketName { .. }
            | Self::KeyTooLong
            | Self::UploadExpired
            | Self::InvalidPart
            | Self::InvalidPartOrder
            | Self::EntityTooSmall
            | Self::EntityTooLarge
            | Self::TooManyAccessKeys
            | Self::InvalidArgument { .. } => 400,
            Self::InvalidRange => 416,
            Self::StorageFull => 507,
            Self::LockNotAcquired { .. } => 503,
            Self::BlobCorrupted { .. } | Self::Internal(_) => 500,
        }
    }
}

impl From<MetaError> for ServiceError {
    fn from(e: MetaError) -> Self {
        // Context-specific cases (missing bucket, duplicate user, ...) are
        // mapped at the call site; whatever reaches this blanket conversion
        // is unexpected.
        Self::Internal(anyhow::Error::new(e))
    }
}

impl From<BlobError> for ServiceError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound { content_hash } => Self::BlobNotFound { content_hash },
            BlobError::HashMismatch { expected, .. } => Self::BlobCorrupted {
                content_hash: expected,
            },
            BlobError::SizeMismatch { expected, actual } => Self::InvalidArgument {
                message: format!("body length {actual} does not match declared size {expected}"),
            },
            BlobError::RangeUnsatisfiable { .. } | BlobError::RangeUnsupported => {
                Self::InvalidRange
            }
            BlobError::Io(io) if io.kind() == std::io::ErrorKind::StorageFull => Self::StorageFull,
            BlobError::Io(io) => Self::Internal(anyhow::Error::new(io)),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(e: LockError) -> Self {
        let LockError::NotAcquired { key } = e;
        Self::LockNotAcquired { key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_resource_errors_to_statuses() {
        assert_eq!(
            ServiceError::NoSuchBucket {
                bucket: "b".to_owned()
            }
            .http_status(),
            404
        );
        assert_eq!(
            ServiceError::BucketAlreadyExists {
                bucket: "b".to_owned()
            }
            .http_status(),
            409
        );
        assert_eq!(
            ServiceError::InvalidBucketName {
                name: "B".to_owned(),
                reason: "uppercase".to_owned()
            }
            .http_status(),
            400
        );
        assert_eq!(
            ServiceError::LockNotAcquired {
                key: "k".to_owned()
            }
            .http_status(),
            503
        );
    }

    #[test]
    fn test_should_pass_auth_codes_through() {
        let err = ServiceError::Auth(strata_auth::AuthError::SignatureDoesNotMatch);
        assert_eq!(err.code(), "SignatureDoesNotMatch");
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn test_should_map_blob_errors() {
        let err: ServiceError = BlobError::NotFound {
            content_hash: "h".to_owned(),
        }
        .into();
        assert!(matches!(err, ServiceError::BlobNotFound { .. }));

        let err: ServiceError = BlobError::RangeUnsupported.into();
        assert_eq!(err.http_status(), 416);
    }

    #[test]
    fn test_should_keep_internal_message_generic() {
        let err: ServiceError = MetaError::Corrupt("secret detail".to_owned()).into();
        assert_eq!(err.to_string(), "internal error");
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_should_map_lock_error() {
        let err: ServiceError = LockError::NotAcquired {
            key: "object:upload:1:k".to_owned(),
        }
        .into();
        assert_eq!(err.code(), "SlowDown");
    }
}
