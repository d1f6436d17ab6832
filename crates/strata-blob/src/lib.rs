//! Content-addressed blob storage.
//!
//! Every stored payload is identified by the SHA-256 of its bytes, which
//! gives deduplication and integrity checking for free: writing the same
//! content twice lands on the same file, and a hash mismatch is detected
//! before anything becomes visible.
//!
//! The [`BlobStore`] trait is the pluggable backend boundary; the bundled
//! [`FsBlobStore`] keeps blobs on a local filesystem in a two-level sharded
//! layout:
//!
//! ```text
//! <data_dir>/ab/cd/abcd<rest-of-64-hex-chars>
//! <temp_dir>/<random>.tmp
//! ```
//!
//! Writes stream through a temp file and are renamed into place only after
//! the hash is known, so a crashed or cancelled upload never leaves a
//! partial blob visible.

mod fs;

pub use fs::FsBlobStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// A readable blob payload stream.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors produced by blob backends.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The blob does not exist in storage.
    #[error("blob not found: {content_hash}")]
    NotFound {
        /// The missing content hash.
        content_hash: String,
    },

    /// The stream ended at a different length than the caller declared.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// The computed content hash differs from the caller's expectation.
    #[error("content hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch {
        /// Expected hash.
        expected: String,
        /// Computed hash.
        actual: String,
    },

    /// The requested byte range falls outside the blob.
    #[error("range {offset}..+{length} is not satisfiable for size {size}")]
    RangeUnsatisfiable {
        /// Range start.
        offset: u64,
        /// Range length.
        length: u64,
        /// Blob size.
        size: u64,
    },

    /// The backend cannot serve range reads.
    #[error("backend does not support range reads")]
    RangeUnsupported,

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compute the sharded path for a content hash under `base`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use strata_blob::shard_path;
///
/// let h = "abcdef0000000000000000000000000000000000000000000000000000000000";
/// let p = shard_path(Path::new("/data"), h);
/// assert_eq!(p, Path::new("/data/ab/cd").join(h));
/// ```
#[must_use]
pub fn shard_path(base: &Path, content_hash: &str) -> PathBuf {
    base.join(&content_hash[0..2])
        .join(&content_hash[2..4])
        .join(content_hash)
}

/// Pluggable content-addressed blob backend.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `reader` into storage, verifying it yields exactly
    /// `expected_size` bytes. Returns the content hash.
    ///
    /// Storing content that already exists is a deduplication hit: the new
    /// copy is discarded and the existing hash returned.
    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: u64,
    ) -> Result<String, BlobError>;

    /// Open a streaming reader over the full blob.
    async fn retrieve(&self, content_hash: &str) -> Result<BlobReader, BlobError>;

    /// Open a streaming reader over `length` bytes starting at `offset`.
    async fn retrieve_range(
        &self,
        content_hash: &str,
        offset: u64,
        length: u64,
    ) -> Result<BlobReader, BlobError>;

    /// Whether this backend can serve [`BlobStore::retrieve_range`].
    fn supports_range(&self) -> bool {
        true
    }

    /// Whether the blob exists.
    async fn exists(&self, content_hash: &str) -> Result<bool, BlobError>;

    /// Size of the blob in bytes.
    async fn size(&self, content_hash: &str) -> Result<u64, BlobError>;

    /// Delete the blob. Returns `false` if it was already gone (deleting a
    /// missing blob is not an error).
    async fn delete(&self, content_hash: &str) -> Result<bool, BlobError>;
}
