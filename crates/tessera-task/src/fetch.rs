//! External fetch collaborators
//!
//! A [`Fetcher`] turns an address into raw, decodable bytes. Redirects, auth
//! and retry policy all live behind this seam; the retrieval task only sees
//! bytes, a [`FetchError`], or an interruption.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use std::fmt::{self, Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use tessera_cache::{BytesWriter, DiskCache};
use tessera_core::{Address, CacheKey, DecodeHints, DiskCacheStrategy, FetchError};
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Everything a fetcher may need about the request it serves
#[derive(Clone)]
pub struct FetchRequest {
    /// Canonical address
    pub address: Address,
    /// Decode hints, for fetchers that can negotiate size
    pub hints: Option<DecodeHints>,
    /// Key raw bytes are persisted under
    pub source_key: CacheKey,
    /// Disk write strategy of the request
    pub strategy: DiskCacheStrategy,
    /// Disk tier of the request, if any
    pub disk_cache: Option<Arc<dyn DiskCache>>,
}

impl Debug for FetchRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("address", &self.address)
            .field("hints", &self.hints)
            .field("source_key", &self.source_key.short())
            .field("strategy", &self.strategy)
            .field("disk_cache", &self.disk_cache.is_some())
            .finish()
    }
}

/// Fetches raw bytes for an address
///
/// Implementations should poll `cancel` during long reads and return
/// [`FetchError::Interrupted`] once it is set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the bytes at `request.address`
    ///
    /// # Errors
    /// Returns `FetchError::Interrupted` on cancellation, or any other
    /// `FetchError` when the bytes cannot be obtained
    async fn fetch(&self, request: &FetchRequest, cancel: &CancelToken)
        -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(request, cancel).await
    }
}

/// Reads `file://` addresses and bare paths from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl FileFetcher {
    /// Create a file fetcher
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Filesystem path an address names
    ///
    /// # Errors
    /// Returns `FetchError::UnsupportedAddress` for schemes other than `file`
    pub fn resolve(address: &Address) -> Result<PathBuf, FetchError> {
        match address.scheme() {
            None => Ok(PathBuf::from(address.as_str())),
            Some("file") => {
                let path = &address.as_str()["file://".len()..];
                Ok(PathBuf::from(path))
            }
            Some(_) => Err(FetchError::UnsupportedAddress(address.to_string())),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError> {
        let path = Self::resolve(&request.address)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(request.address.to_string()));
            }
            Err(e) => return Err(FetchError::Io(e)),
        };

        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Interrupted);
            }
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..n]);
        }
        tracing::trace!(address = %request.address, bytes = bytes.len(), "file read");
        Ok(bytes)
    }
}

/// Persists raw fetched bytes under the source key
///
/// Wraps another fetcher. When the request's strategy writes the source tier
/// and the request has a disk cache, successful fetches are handed to the
/// disk tier as-is. Nothing is written once the request is cancelled.
#[derive(Debug, Clone)]
pub struct SourcePersistingFetcher<F> {
    inner: F,
}

impl<F: Fetcher> SourcePersistingFetcher<F> {
    /// Wrap a fetcher
    #[must_use]
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    /// Wrapped fetcher
    #[must_use]
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for SourcePersistingFetcher<F> {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError> {
        let bytes = self.inner.fetch(request, cancel).await?;
        if cancel.is_cancelled() || !request.strategy.writes_source() {
            return Ok(bytes);
        }
        if let Some(disk) = &request.disk_cache {
            tracing::debug!(key = %request.source_key.short(), "persisting source bytes");
            disk.put(
                request.source_key,
                Box::new(BytesWriter::new(bytes.as_slice())),
            );
        }
        Ok(bytes)
    }
}
