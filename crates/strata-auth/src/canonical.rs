//! Canonical request construction for AWS Signature Version 4.
//!
//! The canonical request is the deterministic rendering every signer and
//! verifier must agree on:
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n\n
//! SignedHeaders\n
//! HashedPayload
//! ```

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// The payload hash value used when the body is not covered by the
/// signature (presigned URLs, streaming uploads).
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// SHA-256 of the empty payload, used for bodyless methods.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Characters that must be percent-encoded outside the RFC 3986 unreserved
/// set (`A-Z a-z 0-9 - _ . ~`).
const STRICT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Build the full canonical request string from its components.
///
/// `headers` supplies the raw header values; only names listed in
/// `signed_headers` participate. The query string must be the raw query as
/// received (it is re-canonicalized here, minus any `X-Amz-Signature`).
#[must_use]
pub fn build_canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(&str, &str)],
    signed_headers: &[&str],
    payload_hash: &str,
) -> String {
    let canonical_uri = canonical_uri(path);
    let canonical_query = canonical_query_string(query);
    let canonical_headers = canonical_headers(headers, signed_headers);
    let signed_headers_str = signed_headers_string(signed_headers);

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Canonicalize the URI path: each `/`-separated segment is decoded and
/// re-encoded with the unreserved set, `/` itself is never encoded, and an
/// empty path becomes `/`.
///
/// # Examples
///
/// ```
/// use strata_auth::canonical::canonical_uri;
///
/// assert_eq!(canonical_uri(""), "/");
/// assert_eq!(canonical_uri("/b/hello world"), "/b/hello%20world");
/// assert_eq!(canonical_uri("/b/hello%20world"), "/b/hello%20world");
/// ```
#[must_use]
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_owned();
    }

    path.split('/')
        .map(|segment| {
            // Decode first so already-encoded input is not double-encoded.
            let decoded = percent_decode_str(segment).decode_utf8_lossy();
            utf8_percent_encode(&decoded, STRICT_ENCODE_SET).to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonicalize the query string: every parameter except `X-Amz-Signature`
/// is decoded, re-encoded with the unreserved set, and sorted by key then
/// value.
///
/// # Examples
///
/// ```
/// use strata_auth::canonical::canonical_query_string;
///
/// assert_eq!(canonical_query_string(""), "");
/// assert_eq!(canonical_query_string("b=2&a=1"), "a=1&b=2");
/// assert_eq!(canonical_query_string("k=a b"), "k=a%20b");
/// assert_eq!(canonical_query_string("a=1&X-Amz-Signature=ffff"), "a=1");
/// ```
#[must_use]
pub fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key != "X-Amz-Signature")
        .map(|(key, value)| {
            (
                utf8_percent_encode(&key, STRICT_ENCODE_SET).to_string(),
                utf8_percent_encode(&value, STRICT_ENCODE_SET).to_string(),
            )
        })
        .collect();

    params.sort_unstable();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the canonical headers block for the signed header names.
///
/// Names are lowercased, values trimmed with inner whitespace runs
/// collapsed to a single space, duplicate names joined with commas, and
/// lines ordered by the sorted signed-header list. The trailing newline of
/// the block is added by [`build_canonical_request`].
#[must_use]
pub fn canonical_headers(headers: &[(&str, &str)], signed_headers: &[&str]) -> String {
    let mut header_map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let lower_name = name.to_lowercase();
        let trimmed = collapse_whitespace(value.trim());
        header_map
            .entry(lower_name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&trimmed);
            })
            .or_insert(trimmed);
    }

    let mut sorted_signed: Vec<&str> = signed_headers.to_vec();
    sorted_signed.sort_unstable();

    sorted_signed
        .iter()
        .filter_map(|name| header_map.get(*name).map(|value| format!("{name}:{value}")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Join the signed header names, sorted, with semicolons.
#[must_use]
pub fn signed_headers_string(signed_headers: &[&str]) -> String {
    let mut sorted: Vec<&str> = signed_headers.to_vec();
    sorted.sort_unstable();
    sorted.join(";")
}

/// Percent-encode a value with the strict unreserved set (for building
/// presigned query strings).
#[must_use]
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, STRICT_ENCODE_SET).to_string()
}

/// Collapse consecutive whitespace characters to a single space.
fn collapse_whitespace(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut prev_was_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            result.push(ch);
            prev_was_space = false;
        }
    }
    result
}
