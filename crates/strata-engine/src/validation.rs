//! Input validation for bucket names and object keys.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ServiceError, ServiceResult};

/// Maximum object key length in bytes.
const MAX_KEY_BYTES: usize = 1024;

/// Bucket names: 3-63 characters, lowercase alphanumeric plus `.` and `-`,
/// starting and ending alphanumeric.
static BUCKET_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("bucket name regex is valid")
});

/// Validate a bucket name.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidBucketName`] when the name does not match
/// the naming rules or is formatted like an IPv4 address.
///
/// # Examples
///
/// ```
/// use strata_engine::validation::validate_bucket_name;
///
/// assert!(validate_bucket_name("my-bucket").is_ok());
/// assert!(validate_bucket_name("aa").is_err());
/// assert!(validate_bucket_name("1.2.3.4").is_err());
/// ```
pub fn validate_bucket_name(name: &str) -> ServiceResult<()> {
    if !BUCKET_NAME_RE.is_match(name) {
        return Err(ServiceError::InvalidBucketName {
            name: name.to_owned(),
            reason: "must be 3-63 lowercase alphanumeric, dot, or hyphen characters, \
                     starting and ending alphanumeric"
                .to_owned(),
        });
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return Err(ServiceError::InvalidBucketName {
            name: name.to_owned(),
            reason: "must not be formatted as an IP address".to_owned(),
        });
    }
    Ok(())
}

/// Validate an object key: non-empty, at most 1024 bytes.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidArgument`] for empty keys and
/// [`ServiceError::KeyTooLong`] past the limit.
pub fn validate_object_key(key: &str) -> ServiceResult<()> {
    if key.is_empty() {
        return Err(ServiceError::InvalidArgument {
            message: "object key must not be empty".to_owned(),
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(ServiceError::KeyTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_accept_valid_bucket_names() {
        let long = "a".repeat(63);
        for name in ["abc", "my-bucket", "bucket.with.dots", "123", long.as_str()] {
            assert!(validate_bucket_name(name).is_ok(), "expected valid: {name}");
        }
    }

    #[test]
    fn test_should_reject_too_short_bucket_name() {
        assert!(validate_bucket_name("aa").is_err());
        assert!(validate_bucket_name("a").is_err());
        assert!(validate_bucket_name("").is_err());
    }

    #[test]
    fn test_should_reject_too_long_bucket_name() {
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_should_reject_bad_characters() {
        assert!(validate_bucket_name("MyBucket").is_err());
        assert!(validate_bucket_name("bucket_underscore").is_err());
        assert!(validate_bucket_name("-bucket").is_err());
        assert!(validate_bucket_name("bucket-").is_err());
        assert!(validate_bucket_name(".bucket").is_err());
    }

    #[test]
    fn test_should_reject_dotted_quad() {
        assert!(validate_bucket_name("1.2.3.4").is_err());
        assert!(validate_bucket_name("192.168.0.1").is_err());
        // Dots are otherwise fine.
        assert!(validate_bucket_name("1.2.3.4.5").is_ok());
    }

    #[test]
    fn test_should_accept_keys_up_to_limit() {
        assert!(validate_object_key("a").is_ok());
        assert!(validate_object_key("photos/2024/cat.jpg").is_ok());
        assert!(validate_object_key(&"k".repeat(1024)).is_ok());
    }

    #[test]
    fn test_should_reject_empty_or_oversized_keys() {
        assert!(validate_object_key("").is_err());
        assert!(matches!(
            validate_object_key(&"k".repeat(1025)),
            Err(ServiceError::KeyTooLong)
        ));
    }
}
