//! Durable tier: per-key files under a cache directory.
//!
//! Every key persists in two representations so that operators (and a
//! possible static front-end) can read pages without a Brotli decoder:
//! `<name>.br` holds the compressed bytes, `<name>.html` the decompressed
//! ones. All physical I/O on one instance is serialized through a single
//! read/write lock: reads run concurrently, writes exclude everything.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::RwLock;

use super::error::CacheError;

const COMPRESSED_EXT: &str = "br";
const DECOMPRESSED_EXT: &str = "html";

/// Disk persistence for cache entries.
pub struct Storage {
    base_dir: PathBuf,
    io_lock: RwLock<()>,
}

impl Storage {
    /// Create a storage instance rooted at `base_dir`, creating the
    /// directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|err| CacheError::io(&base_dir, err))?;
        Ok(Self {
            base_dir,
            io_lock: RwLock::new(()),
        })
    }

    /// Persist both representations for `cache_key`. Fails if either write
    /// fails; a partial write is not rolled back.
    pub async fn write(
        &self,
        cache_key: &str,
        compressed: &[u8],
        decompressed: &[u8],
    ) -> Result<(), CacheError> {
        let _guard = self.io_lock.write().await;

        let br_path = self.file_path(cache_key, COMPRESSED_EXT);
        tokio::fs::write(&br_path, compressed)
            .await
            .map_err(|err| CacheError::io(&br_path, err))?;

        let html_path = self.file_path(cache_key, DECOMPRESSED_EXT);
        tokio::fs::write(&html_path, decompressed)
            .await
            .map_err(|err| CacheError::io(&html_path, err))?;

        Ok(())
    }

    /// Read the compressed representation.
    pub async fn read_compressed(&self, cache_key: &str) -> Result<Bytes, CacheError> {
        self.read(cache_key, COMPRESSED_EXT).await
    }

    /// Read the decompressed representation.
    pub async fn read_decompressed(&self, cache_key: &str) -> Result<Bytes, CacheError> {
        self.read(cache_key, DECOMPRESSED_EXT).await
    }

    async fn read(&self, cache_key: &str, ext: &str) -> Result<Bytes, CacheError> {
        let _guard = self.io_lock.read().await;
        let path = self.file_path(cache_key, ext);
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|err| CacheError::io(&path, err))
    }

    /// True iff the compressed representation is present on disk.
    pub async fn exists(&self, cache_key: &str) -> bool {
        let _guard = self.io_lock.read().await;
        let path = self.file_path(cache_key, COMPRESSED_EXT);
        tokio::fs::metadata(&path).await.is_ok()
    }

    /// Remove both representations. Missing files are not an error; any
    /// other I/O failure is surfaced.
    pub async fn delete(&self, cache_key: &str) -> Result<(), CacheError> {
        let _guard = self.io_lock.write().await;

        for ext in [COMPRESSED_EXT, DECOMPRESSED_EXT] {
            let path = self.file_path(cache_key, ext);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CacheError::io(&path, err)),
            }
        }

        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, cache_key: &str, ext: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{ext}", file_name(cache_key)))
    }
}

/// Filesystem-safe transform of a cache key: `/` and `:` become `_`, and a
/// leading separator is stripped.
fn file_name(cache_key: &str) -> String {
    let name = cache_key.replace(['/', ':'], "_");
    match name.strip_prefix('_') {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}
