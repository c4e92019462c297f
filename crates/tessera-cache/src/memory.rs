//! In-process artifact cache using moka
//!
//! Holds only processed artifacts, keyed by result key. Bounded by decoded
//! pixel bytes rather than entry count, so one huge image evicts many small ones.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use tessera_core::{Artifact, CacheKey};

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
    /// Sum of entry weights (decoded bytes)
    pub weighted_size: u64,
}

/// Memory tier contract
///
/// Implementations must be safe for concurrent use by many in-flight tasks.
#[async_trait]
pub trait MemoryCache: Send + Sync {
    /// Look up a processed artifact
    async fn get(&self, key: &CacheKey) -> Option<Artifact>;

    /// Store a processed artifact; last writer wins
    async fn put(&self, key: CacheKey, artifact: Artifact);

    /// Drop one entry
    async fn remove(&self, key: &CacheKey);

    /// Drop every entry
    async fn clear(&self);

    /// Best-effort pass that releases memory held by evicted entries
    async fn reclaim(&self) {}

    /// Approximate number of entries
    fn entry_count(&self) -> u64;
}

/// Byte-bounded memory cache
#[derive(Debug, Clone)]
pub struct MokaMemoryCache {
    inner: Cache<CacheKey, Artifact>,
}

impl MokaMemoryCache {
    /// Create a cache holding at most `max_bytes` of decoded pixels
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Self::builder(max_bytes).build(),
        }
    }

    /// Create a cache whose entries also expire after `ttl`
    #[must_use]
    pub fn with_ttl(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            inner: Self::builder(max_bytes).time_to_live(ttl).build(),
        }
    }

    fn builder(
        max_bytes: u64,
    ) -> moka::future::CacheBuilder<CacheKey, Artifact, Cache<CacheKey, Artifact>> {
        Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &CacheKey, artifact: &Artifact| -> u32 {
                u32::try_from(artifact.byte_size()).unwrap_or(u32::MAX)
            })
    }

    /// Check if cache contains key
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Get cache statistics
    ///
    /// Counts are eventually consistent; call [`MemoryCache::reclaim`] first
    /// for exact figures.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
            weighted_size: self.inner.weighted_size(),
        }
    }
}

impl Default for MokaMemoryCache {
    /// Create cache with default capacity (64 MiB of pixels)
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

#[async_trait]
impl MemoryCache for MokaMemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<Artifact> {
        self.inner.get(key).await
    }

    async fn put(&self, key: CacheKey, artifact: Artifact) {
        self.inner.insert(key, artifact).await;
    }

    async fn remove(&self, key: &CacheKey) {
        self.inner.invalidate(key).await;
    }

    async fn clear(&self) {
        self.inner.invalidate_all();
    }

    async fn reclaim(&self) {
        self.inner.run_pending_tasks().await;
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn artifact(side: u32) -> Artifact {
        Artifact::new(DynamicImage::ImageRgba8(RgbaImage::new(side, side)))
    }

    fn key(byte: u8) -> CacheKey {
        CacheKey::new([byte; 32])
    }

    #[tokio::test]
    async fn cache_put_and_get() {
        let cache = MokaMemoryCache::new(1024 * 1024);
        let stored = artifact(4);

        cache.put(key(1), stored.clone()).await;

        let retrieved = cache.get(&key(1)).await.unwrap();
        assert!(retrieved.ptr_eq(&stored));
    }

    #[tokio::test]
    async fn cache_returns_none_for_missing() {
        let cache = MokaMemoryCache::default();
        assert!(cache.get(&key(9)).await.is_none());
    }

    #[tokio::test]
    async fn cache_remove_and_clear() {
        let cache = MokaMemoryCache::new(1024 * 1024);
        cache.put(key(1), artifact(2)).await;
        cache.put(key(2), artifact(2)).await;

        cache.remove(&key(1)).await;
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));

        cache.clear().await;
        cache.reclaim().await;
        assert!(cache.get(&key(2)).await.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn cache_stats_track_weight() {
        let cache = MokaMemoryCache::new(1024 * 1024);
        cache.put(key(1), artifact(4)).await;
        cache.put(key(2), artifact(2)).await;
        cache.reclaim().await;

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.weighted_size, (4 * 4 * 4 + 2 * 2 * 4) as u64);
    }

    #[tokio::test]
    async fn cache_evicts_beyond_byte_budget() {
        // 16x16 RGBA = 1024 bytes; budget fits two
        let cache = MokaMemoryCache::new(2048);
        for i in 0..8 {
            cache.put(key(i), artifact(16)).await;
        }
        cache.reclaim().await;

        assert!(cache.stats().weighted_size <= 2048);
    }
}
