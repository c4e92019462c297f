//! Loader: bounded worker pool and serialized delivery
//!
//! The [`Loader`] owns the collaborators every task shares (fetcher, decoder,
//! key maker, failure memo, default cache tiers). Tasks run in parallel, at
//! most `pool_size` at a time. Outcomes are handed to a single
//! [`DeliveryLoop`], the only place [`Target`](crate::Target) callbacks run, so
//! consumers observe results one at a time.

use crate::cancel::CancelToken;
use crate::config::LoaderConfig;
use crate::decode::{Decoder, ImageDecoder};
use crate::error::LoaderError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::request::{Request, RequestBuilder, TargetId};
use crate::retrieval::{RetrievalTask, TaskContext, TaskId, TaskOutcome};
use dashmap::DashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tessera_cache::{
    BytesWriter, DiskCache, FsDiskCache, LoadErrorMemo, MemoryCache, MokaMemoryCache,
};
use tessera_core::{
    Address, CacheKey, DigestKeyMaker, DiskCacheStrategy, KeyMaker, LoadFailure, Origin,
    RequestKeys,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

const DELIVERY_BUFFER: usize = 256;

/// One outcome waiting to reach its target
struct Delivery {
    request: Request,
    outcome: TaskOutcome,
    cancel: CancelToken,
    done: oneshot::Sender<()>,
}

impl Delivery {
    fn deliver(self) {
        if !self.cancel.is_cancelled() {
            if let Some(target) = self.request.target() {
                match &self.outcome {
                    TaskOutcome::Success { artifact, origin } => {
                        target.on_result(artifact.clone(), *origin, &self.request);
                    }
                    TaskOutcome::Failure { error, origin } => {
                        target.on_error(error, *origin, &self.request);
                    }
                    TaskOutcome::Cancelled => {}
                }
            }
        }
        let _ = self.done.send(());
    }
}

/// Drains outcomes and invokes targets, one at a time
///
/// [`LoaderBuilder::build`] spawns this on the runtime. Callers that need
/// delivery on a context of their own use [`LoaderBuilder::build_with_delivery`]
/// and drive it themselves.
pub struct DeliveryLoop {
    receiver: mpsc::Receiver<Delivery>,
}

impl DeliveryLoop {
    /// Deliver until every loader handle and in-flight task is gone
    pub async fn run(mut self) {
        while let Some(delivery) = self.receiver.recv().await {
            delivery.deliver();
        }
        tracing::debug!("delivery loop stopped");
    }

    /// Deliver one outcome; `false` once no more can arrive
    pub async fn deliver_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(delivery) => {
                delivery.deliver();
                true
            }
            None => false,
        }
    }
}

impl Debug for DeliveryLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryLoop").finish_non_exhaustive()
    }
}

/// Handle to a task started with [`Loader::go`]
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    cancel: CancelToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Task id
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation; the target will not be called
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task has finished, delivery included
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the outcome
    ///
    /// Resolves after the target was invoked (or skipped). With a
    /// caller-driven [`DeliveryLoop`] this waits for the loop to reach it.
    pub async fn join(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => TaskOutcome::Cancelled,
        }
    }
}

struct LoaderInner {
    ctx: TaskContext,
    memory_cache: Option<Arc<dyn MemoryCache>>,
    disk_cache: Option<Arc<dyn DiskCache>>,
    default_strategy: DiskCacheStrategy,
    pool: Semaphore,
    pool_size: usize,
    in_flight: DashMap<TargetId, (TaskId, CancelToken)>,
    delivery: mpsc::Sender<Delivery>,
}

impl LoaderInner {
    async fn deliver(&self, request: Request, outcome: TaskOutcome, cancel: CancelToken) {
        if request.target().is_none() || outcome.is_cancelled() || cancel.is_cancelled() {
            return;
        }
        let (done, delivered) = oneshot::channel();
        let delivery = Delivery {
            request,
            outcome,
            cancel,
            done,
        };
        if self.delivery.send(delivery).await.is_err() {
            tracing::warn!("delivery loop is gone, outcome dropped");
            return;
        }
        let _ = delivered.await;
    }

    fn release_target(&self, target_id: Option<&TargetId>, task: TaskId) {
        if let Some(target_id) = target_id {
            self.in_flight
                .remove_if(target_id, |_, (owner, _)| *owner == task);
        }
    }
}

/// Entry point: builds requests and runs them
///
/// Cheap to clone; clones share pool, caches and delivery.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    /// Start building a loader around a fetcher
    #[must_use]
    pub fn builder(fetcher: impl Fetcher + 'static) -> LoaderBuilder {
        LoaderBuilder::new(Arc::new(fetcher))
    }

    /// Request builder prefilled with this loader's cache tiers and strategy
    #[must_use]
    pub fn request(&self, address: impl Into<Address>) -> RequestBuilder {
        Request::builder(address)
            .memory_cache(self.inner.memory_cache.clone())
            .disk_cache(self.inner.disk_cache.clone())
            .strategy(self.inner.default_strategy)
    }

    /// Run a request on the pool and deliver its outcome to its target
    ///
    /// A request with a target id cancels any in-flight task for that id.
    /// Must be called from within a tokio runtime.
    pub fn go(&self, request: Request) -> TaskHandle {
        let cancel = CancelToken::new();
        let mut task = RetrievalTask::new(request, &self.inner.ctx, cancel.clone());
        let id = task.id();

        if let Some(target_id) = task.request().target_id() {
            let previous = self
                .inner
                .in_flight
                .insert(target_id.clone(), (id, cancel.clone()));
            if let Some((replaced, token)) = previous {
                tracing::debug!(target_id = %target_id, task = %replaced, "replaced by newer request");
                token.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = {
                let Ok(_permit) = inner.pool.acquire().await else {
                    return TaskOutcome::Cancelled;
                };
                task.run().await
            };
            inner.release_target(task.request().target_id(), id);
            inner
                .deliver(task.request().clone(), outcome.clone(), task_cancel)
                .await;
            outcome
        });

        TaskHandle { id, cancel, join }
    }

    /// Resolve a request on the pool without target delivery
    pub async fn load(&self, request: Request) -> TaskOutcome {
        self.load_with_cancel(request, CancelToken::new()).await
    }

    /// [`Loader::load`] under a caller-held cancellation token
    pub async fn load_with_cancel(&self, request: Request, cancel: CancelToken) -> TaskOutcome {
        let mut task = RetrievalTask::new(request, &self.inner.ctx, cancel);
        let Ok(_permit) = self.inner.pool.acquire().await else {
            return TaskOutcome::Cancelled;
        };
        task.run().await
    }

    /// Cancel the in-flight task for a target id, if any
    ///
    /// Returns whether a task was cancelled.
    pub fn cancel_target(&self, target_id: &TargetId) -> bool {
        match self.inner.in_flight.remove(target_id) {
            Some((_, (task, token))) => {
                tracing::debug!(target_id = %target_id, %task, "target cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of target ids with a task in flight
    #[must_use]
    pub fn in_flight_targets(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Keys a request would use right now
    #[must_use]
    pub fn keys(&self, request: &Request) -> RequestKeys {
        let snapshot = request.processors().snapshot();
        self.inner.ctx.key_maker.keys(&request.key_subject(&snapshot))
    }

    /// Fetch raw bytes and persist them under the source key
    ///
    /// Nothing is decoded and the memory tier is untouched. Returns the source
    /// key once the write is scheduled, or `None` when the request has no disk
    /// tier. An entry already on disk is not fetched again.
    ///
    /// # Errors
    /// Returns the fetch failure (memoized, as on the main path) or a valid
    /// memoized failure for the address
    pub async fn download_only(&self, request: &Request) -> Result<Option<CacheKey>, LoadFailure> {
        let Some(disk) = request.disk_cache() else {
            return Ok(None);
        };
        let source_key = self.keys(request).source;
        let address = request.address();

        if matches!(disk.get(&source_key).await, Ok(Some(_))) {
            tracing::debug!(%address, "source already on disk");
            return Ok(Some(source_key));
        }
        if let Some(memoized) = self.inner.ctx.errors.get_valid(address) {
            return Err(LoadFailure::io(Origin::Memory, Arc::clone(memoized.failure())));
        }

        let Ok(_permit) = self.inner.pool.acquire().await else {
            return Ok(None);
        };
        // the bytes are persisted here, so a persisting fetcher must not do it too
        let fetch_request = FetchRequest {
            address: address.clone(),
            hints: request.hints(),
            source_key,
            strategy: DiskCacheStrategy::None,
            disk_cache: None,
        };
        match self
            .inner
            .ctx
            .fetcher
            .fetch(&fetch_request, &CancelToken::new())
            .await
        {
            Ok(bytes) => {
                self.inner.ctx.errors.remove(address);
                disk.put(source_key, Box::new(BytesWriter::new(bytes)));
                Ok(Some(source_key))
            }
            Err(e) => {
                let failure = Arc::new(e);
                self.inner
                    .ctx
                    .errors
                    .put(address.clone(), Arc::clone(&failure), Origin::External);
                Err(LoadFailure::io(Origin::External, failure))
            }
        }
    }

    /// Drop a request's entries from its memory and disk tiers
    ///
    /// # Errors
    /// Returns error if a disk entry exists but cannot be deleted
    pub async fn remove_from_cache(&self, request: &Request) -> Result<(), LoaderError> {
        let keys = self.keys(request);
        if let Some(memory) = request.memory_cache() {
            memory.remove(&keys.result).await;
        }
        if let Some(disk) = request.disk_cache() {
            disk.remove(&keys.result).await?;
            if keys.distinct() {
                disk.remove(&keys.source).await?;
            }
        }
        Ok(())
    }

    /// Empty the loader's memory tier
    pub async fn clear_memory_cache(&self) {
        if let Some(memory) = &self.inner.memory_cache {
            memory.clear().await;
        }
    }

    /// Empty the loader's disk tier
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared
    pub async fn clear_disk_cache(&self) -> Result<(), LoaderError> {
        if let Some(disk) = &self.inner.disk_cache {
            disk.clear().await?;
        }
        Ok(())
    }

    /// Empty both tiers
    ///
    /// # Errors
    /// Returns error if the disk tier cannot be cleared
    pub async fn clear_cache(&self) -> Result<(), LoaderError> {
        self.clear_memory_cache().await;
        self.clear_disk_cache().await
    }

    /// Forget every memoized failure
    pub fn clear_load_errors(&self) {
        self.inner.ctx.errors.clear();
    }

    /// Shared task collaborators
    #[must_use]
    pub fn context(&self) -> &TaskContext {
        &self.inner.ctx
    }

    /// Failure memo
    #[must_use]
    pub fn errors(&self) -> &Arc<LoadErrorMemo> {
        &self.inner.ctx.errors
    }

    /// Default memory tier
    #[must_use]
    pub fn memory_cache(&self) -> Option<&Arc<dyn MemoryCache>> {
        self.inner.memory_cache.as_ref()
    }

    /// Default disk tier
    #[must_use]
    pub fn disk_cache(&self) -> Option<&Arc<dyn DiskCache>> {
        self.inner.disk_cache.as_ref()
    }

    /// Worker pool size
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }
}

impl Debug for Loader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("pool_size", &self.inner.pool_size)
            .field("default_strategy", &self.inner.default_strategy)
            .field("memory_cache", &self.inner.memory_cache.is_some())
            .field("disk_cache", &self.inner.disk_cache.is_some())
            .field("in_flight_targets", &self.inner.in_flight.len())
            .finish()
    }
}

/// Builder for [`Loader`]
#[must_use]
pub struct LoaderBuilder {
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn Decoder>,
    key_maker: Arc<dyn KeyMaker>,
    errors: Arc<LoadErrorMemo>,
    memory_cache: Option<Arc<dyn MemoryCache>>,
    disk_cache: Option<Arc<dyn DiskCache>>,
    default_strategy: DiskCacheStrategy,
    pool_size: usize,
}

impl Debug for LoaderBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderBuilder")
            .field("pool_size", &self.pool_size)
            .field("default_strategy", &self.default_strategy)
            .field("memory_cache", &self.memory_cache.is_some())
            .field("disk_cache", &self.disk_cache.is_some())
            .finish_non_exhaustive()
    }
}

impl LoaderBuilder {
    fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let defaults = LoaderConfig::default();
        Self {
            fetcher,
            decoder: Arc::new(ImageDecoder::new()),
            key_maker: Arc::new(DigestKeyMaker),
            errors: Arc::new(LoadErrorMemo::new(defaults.error_ttl())),
            memory_cache: None,
            disk_cache: None,
            default_strategy: defaults.default_strategy,
            pool_size: defaults.pool_size,
        }
    }

    /// Builder configured from a [`LoaderConfig`]
    ///
    /// Opens the disk directory when one is configured.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the disk directory
    /// cannot be opened
    pub async fn from_config(
        config: &LoaderConfig,
        fetcher: impl Fetcher + 'static,
    ) -> Result<Self, LoaderError> {
        config.validate()?;

        let memory = match config.memory_ttl() {
            Some(ttl) => MokaMemoryCache::with_ttl(config.memory_capacity_bytes, ttl),
            None => MokaMemoryCache::new(config.memory_capacity_bytes),
        };
        let decoder = match config.decode_limit_bytes {
            Some(limit) => ImageDecoder::with_limit(limit),
            None => ImageDecoder::new(),
        };

        let mut builder = Self::new(Arc::new(fetcher))
            .decoder(decoder)
            .memory_cache(Arc::new(memory))
            .error_ttl(config.error_ttl())
            .strategy(config.default_strategy)
            .pool_size(config.pool_size);

        if let Some(dir) = &config.disk_dir {
            let disk = FsDiskCache::open(dir).await?;
            tracing::info!(dir = %dir.display(), "disk cache opened");
            builder = builder.disk_cache(Arc::new(disk));
        }
        Ok(builder)
    }

    /// With decoder
    pub fn decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// With key maker
    pub fn key_maker(mut self, key_maker: impl KeyMaker + 'static) -> Self {
        self.key_maker = Arc::new(key_maker);
        self
    }

    /// With default memory tier
    pub fn memory_cache(mut self, cache: Arc<dyn MemoryCache>) -> Self {
        self.memory_cache = Some(cache);
        self
    }

    /// With default disk tier
    pub fn disk_cache(mut self, cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = Some(cache);
        self
    }

    /// With default strategy for [`Loader::request`]
    pub fn strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// With worker pool size (at least 1)
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// With a fresh failure memo of the given validity window
    pub fn error_ttl(mut self, ttl: Duration) -> Self {
        self.errors = Arc::new(LoadErrorMemo::new(ttl));
        self
    }

    /// With a shared failure memo
    pub fn error_memo(mut self, errors: Arc<LoadErrorMemo>) -> Self {
        self.errors = errors;
        self
    }

    /// Build and spawn the delivery loop on the current runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime
    #[must_use]
    pub fn build(self) -> Loader {
        let (loader, delivery) = self.build_with_delivery();
        tokio::spawn(delivery.run());
        loader
    }

    /// Build, handing the delivery loop to the caller
    #[must_use]
    pub fn build_with_delivery(self) -> (Loader, DeliveryLoop) {
        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let ctx = TaskContext::new(self.fetcher, self.decoder)
            .with_key_maker(self.key_maker)
            .with_errors(self.errors);
        tracing::debug!(
            pool_size = self.pool_size,
            strategy = %self.default_strategy,
            "loader built"
        );
        let inner = LoaderInner {
            ctx,
            memory_cache: self.memory_cache,
            disk_cache: self.disk_cache,
            default_strategy: self.default_strategy,
            pool: Semaphore::new(self.pool_size),
            pool_size: self.pool_size,
            in_flight: DashMap::new(),
            delivery: sender,
        };
        (
            Loader {
                inner: Arc::new(inner),
            },
            DeliveryLoop { receiver },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MockFetcher;
    use crate::request::Target;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use parking_lot::Mutex;
    use std::io::Cursor;
    use tessera_core::{Artifact, FetchError, Grayscale};

    fn png() -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl Target for Log {
        fn on_result(&self, _artifact: Artifact, origin: Origin, request: &Request) {
            self.events
                .lock()
                .push(format!("ok {} {}", request.address(), origin));
        }

        fn on_error(&self, _error: &LoadFailure, origin: Origin, request: &Request) {
            self.events
                .lock()
                .push(format!("err {} {}", request.address(), origin));
        }
    }

    #[tokio::test]
    async fn go_delivers_once() {
        let bytes = png();
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(move |_, _| Ok(bytes.clone()));
        let loader = Loader::builder(fetcher)
            .memory_cache(Arc::new(MokaMemoryCache::default()))
            .build();
        let log = Arc::new(Log::default());

        let request = loader
            .request("img://a")
            .processor(Arc::new(Grayscale))
            .target(log.clone())
            .build();
        let outcome = loader.go(request).join().await;

        assert!(outcome.is_success());
        assert_eq!(*log.events.lock(), vec!["ok img://a external".to_string()]);
    }

    #[tokio::test]
    async fn failure_is_delivered_to_on_error() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_, _| Err(FetchError::Other("boom".to_string())));
        let loader = Loader::builder(fetcher).build();
        let log = Arc::new(Log::default());

        let request = loader.request("img://b").target(log.clone()).build();
        loader.go(request).join().await;

        assert_eq!(*log.events.lock(), vec!["err img://b external".to_string()]);
    }

    #[tokio::test]
    async fn caller_driven_delivery() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_, _| Err(FetchError::Other("boom".to_string())));
        let (loader, mut delivery) = Loader::builder(fetcher).build_with_delivery();
        let log = Arc::new(Log::default());

        let handle = loader.go(loader.request("img://b").target(log.clone()).build());
        assert!(delivery.deliver_next().await);
        handle.join().await;

        assert_eq!(log.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn load_skips_delivery() {
        let bytes = png();
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(move |_, _| Ok(bytes.clone()));
        let loader = Loader::builder(fetcher).build();
        let log = Arc::new(Log::default());

        let outcome = loader
            .load(loader.request("img://a").target(log.clone()).build())
            .await;

        assert_eq!(outcome.origin(), Some(Origin::External));
        assert!(log.events.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_target_without_task_is_noop() {
        let loader = Loader::builder(MockFetcher::new()).build();
        assert!(!loader.cancel_target(&TargetId::new("nobody")));
        assert_eq!(loader.in_flight_targets(), 0);
    }

    #[tokio::test]
    async fn download_only_without_disk_fetches_nothing() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(0);
        let loader = Loader::builder(fetcher).build();

        let request = loader.request("img://a").build();
        assert_eq!(loader.download_only(&request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn from_config_applies_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoaderConfig::new()
            .with_pool_size(2)
            .with_disk_dir(dir.path())
            .with_default_strategy(DiskCacheStrategy::Source)
            .with_error_ttl(Duration::from_secs(5));

        let loader = LoaderBuilder::from_config(&config, MockFetcher::new())
            .await
            .unwrap()
            .build();

        assert_eq!(loader.pool_size(), 2);
        assert!(loader.memory_cache().is_some());
        assert!(loader.disk_cache().is_some());
        assert_eq!(loader.errors().ttl(), Duration::from_secs(5));
        let request = loader.request("img://a").build();
        assert_eq!(request.strategy(), DiskCacheStrategy::Source);
    }

    #[tokio::test]
    async fn from_config_rejects_invalid() {
        let config = LoaderConfig::new().with_pool_size(0);
        let err = LoaderBuilder::from_config(&config, MockFetcher::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Config(_)));
    }
}
