//! Filesystem blob backend.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use strata_core::crypto::StreamingSha256;

use crate::{BlobError, BlobReader, BlobStore, shard_path};

/// Copy buffer size for streaming writes.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Content-addressed blob store on a local filesystem.
///
/// `temp_dir` must live on the same filesystem as `data_dir`; the final
/// step of every write is a rename, which is only atomic within one
/// filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    data_dir: PathBuf,
    temp_dir: PathBuf,
}

/// Unlinks an in-flight temp file unless the write was persisted.
///
/// Dropping the store future mid-write (client disconnect, shutdown) runs
/// this guard, so no partial files accumulate outside `temp_dir` and the
/// temp file itself is removed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The write reached its final location; keep the renamed file.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
                }
            } else {
                trace!(path = %self.path.display(), "removed temp file");
            }
        }
    }
}

impl FsBlobStore {
    /// Create a store rooted at `data_dir` with temp files in `temp_dir`.
    ///
    /// Both directories are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Io`] if either directory cannot be created.
    pub async fn new(
        data_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Result<Self, BlobError> {
        let data_dir = data_dir.into();
        let temp_dir = temp_dir.into();
        fs::create_dir_all(&data_dir).await?;
        fs::create_dir_all(&temp_dir).await?;
        debug!(data_dir = %data_dir.display(), temp_dir = %temp_dir.display(), "opened blob store");
        Ok(Self { data_dir, temp_dir })
    }

    /// The sharded path a content hash maps to in this store.
    #[must_use]
    pub fn path_for(&self, content_hash: &str) -> PathBuf {
        shard_path(&self.data_dir, content_hash)
    }

    /// Open the file for a hash, translating "not found" into
    /// [`BlobError::NotFound`].
    async fn open_blob(&self, content_hash: &str) -> Result<File, BlobError> {
        match File::open(self.path_for(content_hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                content_hash: content_hash.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, content_hash: &str) -> Result<Option<u64>, BlobError> {
        match fs::metadata(self.path_for(content_hash)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: u64,
    ) -> Result<String, BlobError> {
        let temp_path = self.temp_dir.join(format!("{}.tmp", Uuid::new_v4().simple()));
        let mut guard = TempFileGuard::new(temp_path.clone());

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;

        // Stream-copy while hashing; never buffer the whole payload.
        let mut hasher = StreamingSha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > expected_size {
                return Err(BlobError::SizeMismatch {
                    expected: expected_size,
                    actual: written,
                });
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        if written != expected_size {
            return Err(BlobError::SizeMismatch {
                expected: expected_size,
                actual: written,
            });
        }
        file.flush().await?;
        drop(file);

        let content_hash = hasher.finalize_hex();
        let target = self.path_for(&content_hash);

        // Deduplication hit: the bytes are already on disk under this hash.
        if fs::metadata(&target).await.is_ok() {
            trace!(content_hash, "deduplicated blob write");
            return Ok(content_hash);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp_path, &target).await?;
        guard.disarm();

        debug!(content_hash, size = written, "stored blob");
        Ok(content_hash)
    }

    async fn retrieve(&self, content_hash: &str) -> Result<BlobReader, BlobError> {
        let file = self.open_blob(content_hash).await?;
        Ok(Box::new(file))
    }

    async fn retrieve_range(
        &self,
        content_hash: &str,
        offset: u64,
        length: u64,
    ) -> Result<BlobReader, BlobError> {
        let mut file = self.open_blob(content_hash).await?;
        let size = file.metadata().await?.len();
        if offset >= size || offset + length > size {
            return Err(BlobError::RangeUnsatisfiable {
                offset,
                length,
                size,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(length)))
    }

    async fn exists(&self, content_hash: &str) -> Result<bool, BlobError> {
        Ok(self.stat(content_hash).await?.is_some())
    }

    async fn size(&self, content_hash: &str) -> Result<u64, BlobError> {
        self.stat(content_hash)
            .await?
            .ok_or_else(|| BlobError::NotFound {
                content_hash: content_hash.to_owned(),
            })
    }

    async fn delete(&self, content_hash: &str) -> Result<bool, BlobError> {
        match fs::remove_file(self.path_for(content_hash)).await {
            Ok(()) => {
                debug!(content_hash, "deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strata_core::crypto::sha256_hex;

    async fn store_in(dir: &tempfile::TempDir) -> FsBlobStore {
        FsBlobStore::new(dir.path().join("blobs"), dir.path().join("tmp"))
            .await
            .expect("test store")
    }

    async fn read_all(mut reader: BlobReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("test read");
        out
    }

    // -----------------------------------------------------------------------
    // Store / retrieve
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_store_and_retrieve_blob() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"hello world";
        let hash = store
            .store(&mut &data[..], data.len() as u64)
            .await
            .expect("test store");
        assert_eq!(hash, sha256_hex(data));

        let body = read_all(store.retrieve(&hash).await.expect("test retrieve")).await;
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_should_place_blob_in_sharded_path() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"sharded";
        let hash = store
            .store(&mut &data[..], data.len() as u64)
            .await
            .expect("test store");

        let expected = dir
            .path()
            .join("blobs")
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash);
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_should_deduplicate_identical_content() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"ABC";
        let h1 = store
            .store(&mut &data[..], 3)
            .await
            .expect("test store 1");
        let h2 = store
            .store(&mut &data[..], 3)
            .await
            .expect("test store 2");
        assert_eq!(h1, h2);

        // Exactly one file exists on disk for the content.
        assert!(store.path_for(&h1).exists());
        let temp_entries = std::fs::read_dir(dir.path().join("tmp"))
            .expect("test read_dir")
            .count();
        assert_eq!(temp_entries, 0, "temp files should be cleaned up");
    }

    #[tokio::test]
    async fn test_should_reject_short_stream() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"short";
        let result = store.store(&mut &data[..], 100).await;
        assert!(matches!(
            result,
            Err(BlobError::SizeMismatch {
                expected: 100,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_should_reject_oversized_stream() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = vec![0x41u8; 64];
        let result = store.store(&mut &data[..], 10).await;
        assert!(matches!(result, Err(BlobError::SizeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_should_remove_temp_file_on_failed_store() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"abc";
        let _ = store.store(&mut &data[..], 99).await;

        let temp_entries = std::fs::read_dir(dir.path().join("tmp"))
            .expect("test read_dir")
            .count();
        assert_eq!(temp_entries, 0);
    }

    #[tokio::test]
    async fn test_should_store_empty_blob() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let hash = store.store(&mut &b""[..], 0).await.expect("test store");
        assert_eq!(hash, sha256_hex(b""));
        assert_eq!(store.size(&hash).await.expect("test size"), 0);
    }

    // -----------------------------------------------------------------------
    // Range reads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_retrieve_range() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"hello world";
        let hash = store
            .store(&mut &data[..], data.len() as u64)
            .await
            .expect("test store");

        let body = read_all(
            store
                .retrieve_range(&hash, 6, 5)
                .await
                .expect("test range"),
        )
        .await;
        assert_eq!(body, b"world");
    }

    #[tokio::test]
    async fn test_should_reject_out_of_bounds_range() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"abc";
        let hash = store.store(&mut &data[..], 3).await.expect("test store");

        assert!(matches!(
            store.retrieve_range(&hash, 3, 1).await,
            Err(BlobError::RangeUnsatisfiable { .. })
        ));
        assert!(matches!(
            store.retrieve_range(&hash, 0, 4).await,
            Err(BlobError::RangeUnsatisfiable { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Exists / size / delete
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_should_report_existence_and_size() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"sized";
        let hash = store.store(&mut &data[..], 5).await.expect("test store");

        assert!(store.exists(&hash).await.expect("test exists"));
        assert_eq!(store.size(&hash).await.expect("test size"), 5);

        let missing = "0".repeat(64);
        assert!(!store.exists(&missing).await.expect("test exists"));
        assert!(matches!(
            store.size(&missing).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_delete_idempotently() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;

        let data = b"doomed";
        let hash = store.store(&mut &data[..], 6).await.expect("test store");

        assert!(store.delete(&hash).await.expect("test delete"));
        // Second delete reports "was not found" without failing.
        assert!(!store.delete(&hash).await.expect("test delete again"));
        assert!(matches!(
            store.retrieve(&hash).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_retrieve_missing_blob_as_not_found() {
        let dir = tempfile::tempdir().expect("test tempdir");
        let store = store_in(&dir).await;
        let missing = "f".repeat(64);
        assert!(matches!(
            store.retrieve(&missing).await,
            Err(BlobError::NotFound { .. })
        ));
    }
}
