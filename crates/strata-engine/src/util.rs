//! Listing and range helpers shared by the object and multipart services.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

use crate::error::{ServiceError, ServiceResult};

/// Encode the last-emitted key as an opaque continuation token.
#[must_use]
pub fn encode_continuation_token(key: &str) -> String {
    BASE64_STANDARD.encode(key.as_bytes())
}

/// Decode a continuation token back to the key it wraps.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidArgument`] for tokens that are not valid
/// base64-wrapped UTF-8.
pub fn decode_continuation_token(token: &str) -> ServiceResult<String> {
    let bytes = BASE64_STANDARD
        .decode(token)
        .map_err(|_| ServiceError::InvalidArgument {
            message: "invalid continuation token".to_owned(),
        })?;
    String::from_utf8(bytes).map_err(|_| ServiceError::InvalidArgument {
        message: "invalid continuation token".to_owned(),
    })
}

/// Parse an HTTP `Range` header against a known content length.
///
/// Supported forms: `bytes=N-M`, `bytes=N-`, `bytes=-N`. Returns the
/// inclusive `(start, end)` pair, with `end` clamped to the content.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidRange`] for malformed or unsatisfiable
/// ranges.
pub fn parse_range_header(range: &str, content_length: u64) -> ServiceResult<(u64, u64)> {
    let spec = range
        .strip_prefix("bytes=")
        .ok_or(ServiceError::InvalidRange)?;

    if content_length == 0 {
        return Err(ServiceError::InvalidRange);
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        // bytes=-N: the last N bytes.
        let n: u64 = suffix.parse().map_err(|_| ServiceError::InvalidRange)?;
        if n == 0 || n > content_length {
            return Err(ServiceError::InvalidRange);
        }
        Ok((content_length - n, content_length - 1))
    } else if let Some(prefix) = spec.strip_suffix('-') {
        // bytes=N-: from N to the end.
        let start: u64 = prefix.parse().map_err(|_| ServiceError::InvalidRange)?;
        if start >= content_length {
            return Err(ServiceError::InvalidRange);
        }
        Ok((start, content_length - 1))
    } else {
        let (start, end) = spec.split_once('-').ok_or(ServiceError::InvalidRange)?;
        let start: u64 = start.parse().map_err(|_| ServiceError::InvalidRange)?;
        let end: u64 = end.parse().map_err(|_| ServiceError::InvalidRange)?;
        if start > end || start >= content_length {
            return Err(ServiceError::InvalidRange);
        }
        Ok((start, end.min(content_length - 1)))
    }
}

/// Extract the common prefix of `key` under `prefix` for a delimiter, if
/// the remainder of the key contains one.
///
/// # Examples
///
/// ```
/// use strata_engine::util::common_prefix_of;
///
/// assert_eq!(
///     common_prefix_of("photos/2024/cat.jpg", "photos/", "/"),
///     Some("photos/2024/".to_owned())
/// );
/// assert_eq!(common_prefix_of("readme.txt", "", "/"), None);
/// ```
#[must_use]
pub fn common_prefix_of(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let idx = rest.find(delimiter)?;
    Some(format!("{prefix}{}{delimiter}", &rest[..idx]))
}
