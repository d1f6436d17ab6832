//! Entity tag computation.
//!
//! Strata's ETags derive from content hashes, not raw bytes: a simple
//! upload's ETag is `"hex(MD5(content_hash))"`, and a multipart object's is
//! `"hex(MD5(concat(binary-decoded part ETags)))-N"`. Both forms are
//! quoted on the wire.

use md5::{Digest, Md5};

use crate::error::{ServiceError, ServiceResult};

/// ETag for a simple (non-multipart) object.
///
/// # Examples
///
/// ```
/// use strata_engine::etag::simple_etag;
///
/// let etag = simple_etag("abc123");
/// assert!(etag.starts_with('"') && etag.ends_with('"'));
/// assert_eq!(etag.len(), 34);
/// ```
#[must_use]
pub fn simple_etag(content_hash: &str) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(content_hash.as_bytes())))
}

/// Composite ETag for a completed multipart upload.
///
/// Each part ETag is unquoted, hex-decoded to its 16 raw bytes, the bytes
/// concatenated, and the MD5 of the concatenation suffixed with the part
/// count.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidPart`] when a part ETag is not 32 hex
/// characters.
pub fn composite_etag(part_etags: &[String]) -> ServiceResult<String> {
    let mut concatenated = Vec::with_capacity(part_etags.len() * 16);
    for etag in part_etags {
        let bytes = hex::decode(trim_etag(etag)).map_err(|_| ServiceError::InvalidPart)?;
        if bytes.len() != 16 {
            return Err(ServiceError::InvalidPart);
        }
        concatenated.extend_from_slice(&bytes);
    }
    Ok(format!(
        "\"{}-{}\"",
        hex::encode(Md5::digest(&concatenated)),
        part_etags.len()
    ))
}

/// Strip surrounding quotes from an ETag.
#[must_use]
pub fn trim_etag(etag: &str) -> &str {
    etag.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(etag)
}

/// Whether two ETags are equal ignoring quoting.
#[must_use]
pub fn etags_equal(a: &str, b: &str) -> bool {
    trim_etag(a) == trim_etag(b)
}
