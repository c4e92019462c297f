//! Disk tier
//!
//! The disk store is an opaque key → bytes mapping. Writes are deferred: the
//! caller hands over an [`EntryWriter`] and returns immediately; the store
//! decides when and on which thread the bytes are produced and persisted.

use crate::error::DiskError;
use async_trait::async_trait;
use image::ImageFormat;
use parking_lot::Mutex;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{Artifact, CacheKey};
use tokio::task::JoinSet;

/// Deferred serialization of one cache entry
pub trait EntryWriter: Send + Sync {
    /// Serialize the entry into `out`
    ///
    /// # Errors
    /// Returns error if encoding or writing fails
    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

/// Writes a processed artifact as PNG
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    artifact: Artifact,
}

impl ArtifactWriter {
    /// Writer for the given artifact
    #[must_use]
    pub fn new(artifact: Artifact) -> Self {
        Self { artifact }
    }
}

impl EntryWriter for ArtifactWriter {
    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let mut buf = Cursor::new(Vec::new());
        self.artifact
            .image()
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(std::io::Error::other)?;
        out.write_all(buf.get_ref())
    }
}

/// Writes raw fetched bytes unchanged
#[derive(Debug, Clone)]
pub struct BytesWriter {
    bytes: Arc<[u8]>,
}

impl BytesWriter {
    /// Writer for the given bytes
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl EntryWriter for BytesWriter {
    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(&self.bytes)
    }
}

/// Disk tier contract
///
/// Implementations must be safe for concurrent use by many in-flight tasks.
#[async_trait]
pub trait DiskCache: Send + Sync {
    /// Read the stored bytes for a key
    ///
    /// # Errors
    /// Returns error if the entry exists but cannot be read
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, DiskError>;

    /// Schedule a write; returns without waiting for it
    fn put(&self, key: CacheKey, writer: Box<dyn EntryWriter>);

    /// Delete one entry; a missing entry is not an error
    ///
    /// # Errors
    /// Returns error if the entry exists but cannot be deleted
    async fn remove(&self, key: &CacheKey) -> Result<(), DiskError>;

    /// Delete every entry
    ///
    /// # Errors
    /// Returns error if the store cannot be enumerated or an entry cannot be deleted
    async fn clear(&self) -> Result<(), DiskError>;
}

/// One file per key under a directory
///
/// Entries are written to a temporary file in the same directory and renamed
/// into place, so a concurrent `get` sees either nothing or a complete entry.
/// `put` must be called from within a tokio runtime.
#[derive(Debug)]
pub struct FsDiskCache {
    dir: PathBuf,
    pending: Mutex<JoinSet<()>>,
}

impl FsDiskCache {
    /// Open (creating if needed) a cache directory
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, DiskError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DiskError::io_error(&dir, e))?;
        Ok(Self {
            dir,
            pending: Mutex::new(JoinSet::new()),
        })
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing a key
    #[must_use]
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.to_string())
    }

    /// Whether an entry exists for a key
    pub async fn contains(&self, key: &CacheKey) -> bool {
        tokio::fs::try_exists(self.entry_path(key))
            .await
            .unwrap_or(false)
    }

    /// Wait for every write scheduled so far
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("disk write task failed: {}", e);
            }
        }
    }

    fn write_entry(dir: &Path, key: CacheKey, writer: &dyn EntryWriter) -> Result<(), DiskError> {
        let path = dir.join(key.to_string());
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| DiskError::io_error(dir, e))?;
        writer
            .write_to(tmp.as_file_mut())
            .map_err(|e| DiskError::Encode(e.to_string()))?;
        tmp.as_file_mut()
            .flush()
            .map_err(|e| DiskError::io_error(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| DiskError::io_error(&path, e.error))?;
        Ok(())
    }
}

#[async_trait]
impl DiskCache for FsDiskCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, DiskError> {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiskError::io_error(path, e)),
        }
    }

    fn put(&self, key: CacheKey, writer: Box<dyn EntryWriter>) {
        let dir = self.dir.clone();
        let mut pending = self.pending.lock();
        // reap finished writes so the set only tracks in-flight ones
        while pending.try_join_next().is_some() {}
        pending.spawn_blocking(move || {
            match Self::write_entry(&dir, key, writer.as_ref()) {
                Ok(()) => tracing::trace!(key = %key.short(), "disk entry written"),
                Err(e) => tracing::warn!(key = %key.short(), "disk entry write failed: {}", e),
            }
        });
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), DiskError> {
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiskError::io_error(path, e)),
        }
    }

    async fn clear(&self) -> Result<(), DiskError> {
        self.flush().await;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| DiskError::io_error(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DiskError::io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.is_file() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| DiskError::io_error(&path, e))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    fn key(byte: u8) -> CacheKey {
        CacheKey::new([byte; 32])
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDiskCache::open(dir.path()).await.unwrap();
        assert!(cache.get(&key(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bytes_roundtrip_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDiskCache::open(dir.path()).await.unwrap();

        cache.put(key(1), Box::new(BytesWriter::new(b"raw bytes".to_vec())));
        cache.flush().await;

        assert!(cache.contains(&key(1)).await);
        assert_eq!(cache.get(&key(1)).await.unwrap().unwrap(), b"raw bytes");
    }

    #[tokio::test]
    async fn artifact_writer_encodes_png() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDiskCache::open(dir.path()).await.unwrap();
        let img = RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255]));
        let artifact = Artifact::new(DynamicImage::ImageRgba8(img));

        cache.put(key(2), Box::new(ArtifactWriter::new(artifact)));
        cache.flush().await;

        let bytes = cache.get(&key(2)).await.unwrap().unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDiskCache::open(dir.path().join("nested")).await.unwrap();
        cache.put(key(1), Box::new(BytesWriter::new(b"a".to_vec())));
        cache.put(key(2), Box::new(BytesWriter::new(b"b".to_vec())));
        cache.flush().await;

        cache.remove(&key(1)).await.unwrap();
        cache.remove(&key(1)).await.unwrap();
        assert!(!cache.contains(&key(1)).await);
        assert!(cache.contains(&key(2)).await);

        cache.clear().await.unwrap();
        assert!(!cache.contains(&key(2)).await);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsDiskCache::open(dir.path()).await.unwrap();
        cache.put(key(1), Box::new(BytesWriter::new(b"first".to_vec())));
        cache.flush().await;
        cache.put(key(1), Box::new(BytesWriter::new(b"second".to_vec())));
        cache.flush().await;

        assert_eq!(cache.get(&key(1)).await.unwrap().unwrap(), b"second");
    }
}
