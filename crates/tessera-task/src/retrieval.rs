//! Retrieval task
//!
//! One [`RetrievalTask`] resolves one [`Request`]. It walks the tiers in order
//! (memory, disk result, disk source, failure memo, external fetch), applies
//! the processor chain when the artifact did not come from a processed tier,
//! and populates the caches on the way out.
//!
//! Cancellation is polled at every transition and after every operation that
//! can race with it (disk reads, decodes, fetches, processor runs). A cancelled
//! task writes nothing further and produces [`TaskOutcome::Cancelled`].

use crate::cancel::CancelToken;
use crate::decode::Decoder;
use crate::fetch::{FetchRequest, Fetcher};
use crate::request::Request;
use crate::state::{validate_transition, TaskState};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use tessera_cache::{ArtifactWriter, DiskCache, LoadErrorMemo};
use tessera_core::{
    apply_snapshot, Artifact, CacheKey, DecodeError, DecodeHints, DigestKeyMaker,
    DiskCacheStrategy, KeyMaker, LoadFailure, Origin, ProcessorSnapshot, RequestKeys,
};
use ulid::Ulid;

/// Unique task identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Generate new task ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collaborators shared by every task of a loader
#[derive(Clone)]
pub struct TaskContext {
    /// External fetch
    pub fetcher: Arc<dyn Fetcher>,
    /// Byte decoding
    pub decoder: Arc<dyn Decoder>,
    /// Key derivation
    pub key_maker: Arc<dyn KeyMaker>,
    /// Failure memo
    pub errors: Arc<LoadErrorMemo>,
}

impl TaskContext {
    /// Context with the digest key maker and a default failure memo
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>, decoder: Arc<dyn Decoder>) -> Self {
        Self {
            fetcher,
            decoder,
            key_maker: Arc::new(DigestKeyMaker),
            errors: Arc::new(LoadErrorMemo::default()),
        }
    }

    /// With key maker
    #[must_use]
    pub fn with_key_maker(mut self, key_maker: Arc<dyn KeyMaker>) -> Self {
        self.key_maker = key_maker;
        self
    }

    /// With failure memo
    #[must_use]
    pub fn with_errors(mut self, errors: Arc<LoadErrorMemo>) -> Self {
        self.errors = errors;
        self
    }
}

impl Debug for TaskContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

/// How a task ended
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Resolved with an artifact
    Success {
        /// The processed artifact
        artifact: Artifact,
        /// Tier that produced it
        origin: Origin,
    },
    /// Resolved with a failure
    Failure {
        /// What went wrong
        error: LoadFailure,
        /// Tier the failure is attributed to
        origin: Origin,
    },
    /// Abandoned; nothing is delivered
    Cancelled,
}

impl TaskOutcome {
    /// Origin tier, unless cancelled
    #[must_use]
    pub fn origin(&self) -> Option<Origin> {
        match self {
            Self::Success { origin, .. } | Self::Failure { origin, .. } => Some(*origin),
            Self::Cancelled => None,
        }
    }

    /// The artifact, if resolved successfully
    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Success { artifact, .. } => Some(artifact),
            _ => None,
        }
    }

    /// The failure, if any
    #[must_use]
    pub fn error(&self) -> Option<&LoadFailure> {
        match self {
            Self::Failure { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether the task resolved with an artifact
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether the task was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why resolution stopped before an artifact was produced
enum Halt {
    Failed(LoadFailure),
    Cancelled,
}

type Step<T> = Result<T, Halt>;

/// Orchestrates one request through the tiers
pub struct RetrievalTask {
    id: TaskId,
    request: Request,
    ctx: TaskContext,
    cancel: CancelToken,
    snapshot: ProcessorSnapshot,
    keys: RequestKeys,
    state: TaskState,
    trail: Vec<TaskState>,
}

impl RetrievalTask {
    /// Create a task, snapshotting the processor chain and deriving both keys
    #[must_use]
    pub fn new(request: Request, ctx: &TaskContext, cancel: CancelToken) -> Self {
        let snapshot = request.processors().snapshot();
        let keys = ctx.key_maker.keys(&request.key_subject(&snapshot));
        Self {
            id: TaskId::new(),
            request,
            ctx: ctx.clone(),
            cancel,
            snapshot,
            keys,
            state: TaskState::Created,
            trail: vec![TaskState::Created],
        }
    }

    /// Task id
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Source and result keys
    #[must_use]
    pub fn keys(&self) -> RequestKeys {
        self.keys
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every state entered so far, starting with `Created`
    #[must_use]
    pub fn trail(&self) -> &[TaskState] {
        &self.trail
    }

    /// The request being resolved
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Resolve the request
    pub async fn run(&mut self) -> TaskOutcome {
        tracing::debug!(
            task = %self.id,
            address = %self.request.address(),
            result_key = %self.keys.result.short(),
            "retrieval started"
        );

        let outcome = match self.resolve().await {
            Ok((artifact, origin)) => match self.advance(TaskState::Done) {
                Ok(()) => TaskOutcome::Success { artifact, origin },
                Err(_) => TaskOutcome::Cancelled,
            },
            Err(Halt::Failed(error)) => match self.advance(TaskState::Failed) {
                Ok(()) => TaskOutcome::Failure {
                    origin: error.origin(),
                    error,
                },
                Err(_) => TaskOutcome::Cancelled,
            },
            Err(Halt::Cancelled) => {
                if self.state != TaskState::Cancelled {
                    self.enter(TaskState::Cancelled);
                }
                TaskOutcome::Cancelled
            }
        };

        match &outcome {
            TaskOutcome::Success { origin, .. } => {
                tracing::debug!(task = %self.id, %origin, "retrieval done");
            }
            TaskOutcome::Failure { error, .. } => {
                tracing::debug!(task = %self.id, "retrieval failed: {}", error);
            }
            TaskOutcome::Cancelled => tracing::debug!(task = %self.id, "retrieval cancelled"),
        }
        outcome
    }

    async fn resolve(&mut self) -> Step<(Artifact, Origin)> {
        self.advance(TaskState::CheckMemory)?;
        if let Some(artifact) = self.check_memory().await {
            self.populate_disk_from_memory(&artifact);
            return Ok((artifact, Origin::Memory));
        }

        self.advance(TaskState::CheckDisk)?;
        if let Some(artifact) = self.check_disk().await? {
            self.put_in_memory(&artifact).await;
            return Ok((artifact, Origin::Disk));
        }

        self.advance(TaskState::CheckErrorMemo)?;
        if let Some(memoized) = self.ctx.errors.get_valid(self.request.address()) {
            tracing::debug!(task = %self.id, "memoized failure short-circuits fetch");
            return Err(Halt::Failed(LoadFailure::io(
                Origin::Memory,
                Arc::clone(memoized.failure()),
            )));
        }

        self.advance(TaskState::FetchExternal)?;
        let fetched = self.fetch_external().await?;

        self.advance(TaskState::ApplyProcessors)?;
        let artifact = self.apply_processors(fetched).await?;

        self.advance(TaskState::PopulateCaches)?;
        self.populate(&artifact).await?;

        Ok((artifact, Origin::External))
    }

    /// Enter `next`, or `Cancelled` if cancellation was requested
    fn advance(&mut self, next: TaskState) -> Step<()> {
        if self.cancel.is_cancelled() {
            if self.state != TaskState::Cancelled {
                self.enter(TaskState::Cancelled);
            }
            return Err(Halt::Cancelled);
        }
        self.enter(next);
        Ok(())
    }

    fn enter(&mut self, next: TaskState) {
        if let Err(e) = validate_transition(self.state, next) {
            tracing::error!(task = %self.id, "{}", e);
        }
        tracing::trace!(task = %self.id, from = %self.state, to = %next, "transition");
        self.state = next;
        self.trail.push(next);
    }

    fn check_cancel(&self) -> Step<()> {
        if self.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn check_memory(&self) -> Option<Artifact> {
        if self.request.skip_read_memory() {
            return None;
        }
        let cache = self.request.memory_cache()?;
        let hit = cache.get(&self.keys.result).await;
        if hit.is_some() {
            tracing::debug!(task = %self.id, key = %self.keys.result.short(), "memory hit");
        }
        hit
    }

    /// Whether the processed result belongs under the result key on disk
    ///
    /// Under `All` with equal keys the fetcher already persisted the same entry.
    fn writes_result(&self) -> bool {
        match self.request.strategy() {
            DiskCacheStrategy::Result => true,
            DiskCacheStrategy::All => self.keys.distinct(),
            _ => false,
        }
    }

    /// Disk write after a memory hit; runs regardless of cancellation
    ///
    /// Written under `Result` and `All` even when both keys name one entry, so
    /// a cleared disk tier is refilled from memory.
    fn populate_disk_from_memory(&self, artifact: &Artifact) {
        if !self.request.strategy().writes_result() {
            return;
        }
        if let Some(disk) = self.request.disk_cache() {
            disk.put(self.keys.result, Box::new(ArtifactWriter::new(artifact.clone())));
        }
    }

    async fn check_disk(&self) -> Step<Option<Artifact>> {
        if self.request.skip_read_disk() {
            return Ok(None);
        }
        let Some(disk) = self.request.disk_cache() else {
            return Ok(None);
        };

        if let Some(bytes) = self.read_disk(disk.as_ref(), &self.keys.result).await {
            self.check_cancel()?;
            if let Some(artifact) = self.decode_disk_entry(bytes, None).await? {
                tracing::debug!(task = %self.id, "disk result hit");
                return Ok(Some(artifact));
            }
        }
        self.check_cancel()?;

        // equal keys name the same entry, already looked up
        if !self.keys.distinct() {
            return Ok(None);
        }
        let Some(bytes) = self.read_disk(disk.as_ref(), &self.keys.source).await else {
            return Ok(None);
        };
        self.check_cancel()?;
        let Some(source) = self
            .decode_disk_entry(bytes, self.request.hints())
            .await?
        else {
            return Ok(None);
        };
        tracing::debug!(task = %self.id, "disk source hit");
        self.apply_processors(source).await.map(Some)
    }

    async fn read_disk(&self, disk: &dyn DiskCache, key: &CacheKey) -> Option<Vec<u8>> {
        match disk.get(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(task = %self.id, key = %key.short(), "disk read failed: {}", e);
                None
            }
        }
    }

    /// Decode a disk entry, retrying once after freeing memory on exhaustion
    ///
    /// An unreadable entry is a miss.
    async fn decode_disk_entry(
        &self,
        bytes: Vec<u8>,
        hints: Option<DecodeHints>,
    ) -> Step<Option<Artifact>> {
        let bytes: Arc<[u8]> = bytes.into();
        let mut retried = false;
        loop {
            let decoded = self.decode(Arc::clone(&bytes), hints).await?;
            match decoded {
                Ok(artifact) => return Ok(Some(artifact)),
                Err(e) if e.is_resource_exhausted() && !retried => {
                    tracing::warn!(task = %self.id, "decode exhausted memory, clearing memory cache");
                    if let Some(cache) = self.request.memory_cache() {
                        cache.clear().await;
                        cache.reclaim().await;
                    }
                    self.check_cancel()?;
                    retried = true;
                }
                Err(e) if e.is_resource_exhausted() => {
                    return Err(Halt::Failed(LoadFailure::ResourceExhausted {
                        origin: Origin::Disk,
                    }));
                }
                Err(e) => {
                    tracing::warn!(task = %self.id, "unreadable disk entry: {}", e);
                    return Ok(None);
                }
            }
        }
    }

    async fn decode(
        &self,
        bytes: Arc<[u8]>,
        hints: Option<DecodeHints>,
    ) -> Step<Result<Artifact, DecodeError>> {
        let decoder = Arc::clone(&self.ctx.decoder);
        let decoded = off_thread(move || decoder.decode(&bytes, hints.as_ref())).await?;
        self.check_cancel()?;
        Ok(decoded)
    }

    async fn fetch_external(&self) -> Step<Artifact> {
        let address = self.request.address();
        let fetch_request = FetchRequest {
            address: address.clone(),
            hints: self.request.hints(),
            source_key: self.keys.source,
            strategy: self.request.strategy(),
            disk_cache: self.request.disk_cache().cloned(),
        };

        let bytes = match self.ctx.fetcher.fetch(&fetch_request, &self.cancel).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_interrupted() || self.cancel.is_cancelled() => {
                return Err(Halt::Cancelled);
            }
            Err(e) => {
                let failure = Arc::new(e);
                self.ctx
                    .errors
                    .put(address.clone(), Arc::clone(&failure), Origin::External);
                return Err(Halt::Failed(LoadFailure::io(Origin::External, failure)));
            }
        };
        self.check_cancel()?;
        self.ctx.errors.remove(address);

        self.decode(bytes.into(), self.request.hints())
            .await?
            .map_err(|e| Halt::Failed(LoadFailure::decode(Origin::External, e)))
    }

    async fn apply_processors(&self, artifact: Artifact) -> Step<Artifact> {
        if self.snapshot.is_empty() {
            return Ok(artifact);
        }
        let snapshot = Arc::clone(&self.snapshot);
        let processed = off_thread(move || apply_snapshot(&snapshot, artifact)).await?;
        self.check_cancel()?;
        Ok(processed)
    }

    async fn put_in_memory(&self, artifact: &Artifact) {
        if self.request.skip_write_memory() || self.cancel.is_cancelled() {
            return;
        }
        if let Some(cache) = self.request.memory_cache() {
            cache.put(self.keys.result, artifact.clone()).await;
        }
    }

    async fn populate(&self, artifact: &Artifact) -> Step<()> {
        self.put_in_memory(artifact).await;
        self.check_cancel()?;
        if self.writes_result() {
            if let Some(disk) = self.request.disk_cache() {
                disk.put(self.keys.result, Box::new(ArtifactWriter::new(artifact.clone())));
            }
        }
        Ok(())
    }
}

impl Debug for RetrievalTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrievalTask")
            .field("id", &self.id)
            .field("address", self.request.address())
            .field("state", &self.state)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Run CPU-bound work on the blocking pool
///
/// A panic in `f` resumes on the caller. A pool shut down under the task
/// counts as cancellation.
async fn off_thread<T, F>(f: F) -> Step<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Halt::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ImageDecoder;
    use crate::fetch::MockFetcher;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use tessera_cache::{FsDiskCache, MemoryCache, MokaMemoryCache};
    use tessera_core::{FetchError, Grayscale};
    use TaskState::*;

    fn png() -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([90, 40, 200, 255])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn context(fetcher: MockFetcher) -> TaskContext {
        TaskContext::new(Arc::new(fetcher), Arc::new(ImageDecoder::new()))
    }

    fn fetch_ok(times: usize) -> MockFetcher {
        let bytes = png();
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(times)
            .returning(move |_, _| Ok(bytes.clone()));
        fetcher
    }

    #[tokio::test]
    async fn external_path_walks_every_state() {
        let memory = Arc::new(MokaMemoryCache::default());
        let ctx = context(fetch_ok(1));
        let request = Request::builder("img://a")
            .processor(Arc::new(Grayscale))
            .memory_cache(Some(memory.clone()))
            .build();

        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        let outcome = task.run().await;

        assert_eq!(outcome.origin(), Some(Origin::External));
        assert_eq!(
            task.trail(),
            &[
                Created,
                CheckMemory,
                CheckDisk,
                CheckErrorMemo,
                FetchExternal,
                ApplyProcessors,
                PopulateCaches,
                Done
            ]
        );
        assert!(memory.contains(&task.keys().result));
    }

    #[tokio::test]
    async fn memory_hit_stops_at_check_memory() {
        let memory = Arc::new(MokaMemoryCache::default());
        let ctx = context(fetch_ok(0));
        let request = Request::builder("img://a")
            .memory_cache(Some(memory.clone()))
            .build();
        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        let artifact = ImageDecoder::new().decode(&png(), None).unwrap();
        memory.put(task.keys().result, artifact.clone()).await;

        let outcome = task.run().await;

        assert_eq!(outcome.origin(), Some(Origin::Memory));
        assert!(outcome.artifact().unwrap().ptr_eq(&artifact));
        assert_eq!(task.trail(), &[Created, CheckMemory, Done]);
    }

    #[tokio::test]
    async fn fetch_failure_is_memoized_then_short_circuits() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|req, _| Err(FetchError::NotFound(req.address.to_string())));
        let ctx = context(fetcher);

        let request = Request::builder("img://b").build();
        let mut first = RetrievalTask::new(request.clone(), &ctx, CancelToken::new());
        let outcome = first.run().await;
        assert_eq!(outcome.origin(), Some(Origin::External));
        assert_eq!(first.state(), Failed);

        let mut second = RetrievalTask::new(request, &ctx, CancelToken::new());
        let outcome = second.run().await;
        assert_eq!(outcome.origin(), Some(Origin::Memory));
        assert_eq!(
            second.trail(),
            &[Created, CheckMemory, CheckDisk, CheckErrorMemo, Failed]
        );
    }

    #[tokio::test]
    async fn interrupted_fetch_is_silent() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(1).returning(|_, cancel| {
            cancel.cancel();
            Err(FetchError::Interrupted)
        });
        let ctx = context(fetcher);

        let request = Request::builder("img://c").build();
        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        let outcome = task.run().await;

        assert!(outcome.is_cancelled());
        assert_eq!(task.state(), Cancelled);
        assert!(ctx.errors.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_successful_fetch_discards_result() {
        let bytes = png();
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(1).returning(move |_, cancel| {
            cancel.cancel();
            Ok(bytes.clone())
        });
        let memory = Arc::new(MokaMemoryCache::default());
        let ctx = context(fetcher);
        let request = Request::builder("img://a")
            .memory_cache(Some(memory.clone()))
            .build();

        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        let outcome = task.run().await;

        assert!(outcome.is_cancelled());
        assert_eq!(memory.entry_count(), 0);
        assert!(!memory.contains(&task.keys().result));
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let ctx = context(fetch_ok(0));
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut task = RetrievalTask::new(Request::builder("img://a").build(), &ctx, cancel);
        assert!(task.run().await.is_cancelled());
        assert_eq!(task.trail(), &[Created, Cancelled]);
    }

    #[tokio::test]
    async fn external_decode_failure_is_not_memoized() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_, _| Ok(b"not an image".to_vec()));
        let ctx = context(fetcher);

        let request = Request::builder("img://d").build();
        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        let outcome = task.run().await;

        assert!(matches!(
            outcome.error(),
            Some(LoadFailure::Decode {
                origin: Origin::External,
                ..
            })
        ));
        assert!(ctx.errors.is_empty());
    }

    #[tokio::test]
    async fn corrupt_disk_result_falls_through_to_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(FsDiskCache::open(dir.path()).await.unwrap());
        let ctx = context(fetch_ok(1));
        let request = Request::builder("img://a")
            .processor(Arc::new(Grayscale))
            .strategy(DiskCacheStrategy::Result)
            .disk_cache(Some(disk.clone()))
            .build();
        let mut task = RetrievalTask::new(request, &ctx, CancelToken::new());
        std::fs::write(disk.entry_path(&task.keys().result), b"garbage").unwrap();

        let outcome = task.run().await;

        assert_eq!(outcome.origin(), Some(Origin::External));
        disk.flush().await;
        let stored = disk.get(&task.keys().result).await.unwrap().unwrap();
        assert!(ImageDecoder::new().decode(&stored, None).is_ok());
    }
}
