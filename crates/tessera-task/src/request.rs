//! Requests and delivery targets
//!
//! A [`Request`] is an immutable description of what to load and how. It
//! carries its own cache tiers: a request without a memory or disk cache simply
//! skips that tier.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use tessera_cache::{DiskCache, MemoryCache};
use tessera_core::{
    Address, Artifact, DecodeHints, DiskCacheStrategy, KeySubject, LoadFailure, Origin,
    Processor, ProcessorChain, ProcessorSnapshot,
};

/// Consumer-side delivery sink
///
/// Invoked at most once per task, only from the delivery loop, and never for
/// a cancelled task.
pub trait Target: Send + Sync {
    /// The request resolved to an artifact
    fn on_result(&self, artifact: Artifact, origin: Origin, request: &Request);

    /// The request failed
    fn on_error(&self, error: &LoadFailure, origin: Origin, request: &Request);
}

/// Identifies a consumer slot; a newer request for the same slot replaces an
/// older in-flight one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(String);

impl TargetId {
    /// Create a target id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable load request
#[derive(Clone)]
pub struct Request {
    address: Address,
    hints: Option<DecodeHints>,
    processors: ProcessorChain,
    target: Option<Arc<dyn Target>>,
    target_id: Option<TargetId>,
    skip_read_memory: bool,
    skip_write_memory: bool,
    skip_read_disk: bool,
    strategy: DiskCacheStrategy,
    memory_cache: Option<Arc<dyn MemoryCache>>,
    disk_cache: Option<Arc<dyn DiskCache>>,
}

impl Request {
    /// Start building a request with no cache tiers
    #[must_use]
    pub fn builder(address: impl Into<Address>) -> RequestBuilder {
        RequestBuilder::new(address.into())
    }

    /// Canonical address
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Decode hints
    #[must_use]
    pub fn hints(&self) -> Option<DecodeHints> {
        self.hints
    }

    /// Processor chain (shared, may still grow)
    #[must_use]
    pub fn processors(&self) -> &ProcessorChain {
        &self.processors
    }

    /// Delivery target
    #[must_use]
    pub fn target(&self) -> Option<&Arc<dyn Target>> {
        self.target.as_ref()
    }

    /// Consumer slot id
    #[must_use]
    pub fn target_id(&self) -> Option<&TargetId> {
        self.target_id.as_ref()
    }

    /// Skip the memory lookup
    #[must_use]
    pub fn skip_read_memory(&self) -> bool {
        self.skip_read_memory
    }

    /// Skip memory writes
    #[must_use]
    pub fn skip_write_memory(&self) -> bool {
        self.skip_write_memory
    }

    /// Skip both disk lookups
    #[must_use]
    pub fn skip_read_disk(&self) -> bool {
        self.skip_read_disk
    }

    /// Disk write strategy
    #[must_use]
    pub fn strategy(&self) -> DiskCacheStrategy {
        self.strategy
    }

    /// Memory tier, if configured
    #[must_use]
    pub fn memory_cache(&self) -> Option<&Arc<dyn MemoryCache>> {
        self.memory_cache.as_ref()
    }

    /// Disk tier, if configured
    #[must_use]
    pub fn disk_cache(&self) -> Option<&Arc<dyn DiskCache>> {
        self.disk_cache.as_ref()
    }

    /// Key subject for a given processor snapshot
    #[must_use]
    pub fn key_subject(&self, snapshot: &ProcessorSnapshot) -> KeySubject {
        KeySubject::new(
            self.address.clone(),
            self.hints,
            tessera_core::snapshot_ids(snapshot),
        )
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("address", &self.address)
            .field("hints", &self.hints)
            .field("processors", &self.processors)
            .field("target_id", &self.target_id)
            .field("skip_read_memory", &self.skip_read_memory)
            .field("skip_write_memory", &self.skip_write_memory)
            .field("skip_read_disk", &self.skip_read_disk)
            .field("strategy", &self.strategy)
            .field("memory_cache", &self.memory_cache.is_some())
            .field("disk_cache", &self.disk_cache.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Request`]
#[must_use]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    fn new(address: Address) -> Self {
        Self {
            request: Request {
                address,
                hints: None,
                processors: ProcessorChain::new(),
                target: None,
                target_id: None,
                skip_read_memory: false,
                skip_write_memory: false,
                skip_read_disk: false,
                strategy: DiskCacheStrategy::default(),
                memory_cache: None,
                disk_cache: None,
            },
        }
    }

    /// Set decode hints
    pub fn hints(mut self, hints: DecodeHints) -> Self {
        self.request.hints = Some(hints);
        self
    }

    /// Downsample while decoding
    pub fn sample_size(self, sample_size: u32) -> Self {
        self.hints(DecodeHints::with_sample_size(sample_size))
    }

    /// Append a processor
    pub fn processor(self, processor: Arc<dyn Processor>) -> Self {
        self.request.processors.push(processor);
        self
    }

    /// Use an existing (possibly shared) chain
    pub fn processors(mut self, chain: ProcessorChain) -> Self {
        self.request.processors = chain;
        self
    }

    /// Set the delivery target
    pub fn target(mut self, target: Arc<dyn Target>) -> Self {
        self.request.target = Some(target);
        self
    }

    /// Set the consumer slot id
    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.request.target_id = Some(TargetId::new(id));
        self
    }

    /// Skip the memory lookup
    pub fn skip_read_memory(mut self, skip: bool) -> Self {
        self.request.skip_read_memory = skip;
        self
    }

    /// Skip memory writes
    pub fn skip_write_memory(mut self, skip: bool) -> Self {
        self.request.skip_write_memory = skip;
        self
    }

    /// Skip both disk lookups
    pub fn skip_read_disk(mut self, skip: bool) -> Self {
        self.request.skip_read_disk = skip;
        self
    }

    /// Set the disk write strategy
    pub fn strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.request.strategy = strategy;
        self
    }

    /// Set or clear the memory tier
    pub fn memory_cache(mut self, cache: Option<Arc<dyn MemoryCache>>) -> Self {
        self.request.memory_cache = cache;
        self
    }

    /// Set or clear the disk tier
    pub fn disk_cache(mut self, cache: Option<Arc<dyn DiskCache>>) -> Self {
        self.request.disk_cache = cache;
        self
    }

    /// Finish the request
    #[must_use]
    pub fn build(self) -> Request {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DigestKeyMaker, Grayscale, KeyMaker};

    #[test]
    fn builder_defaults() {
        let request = Request::builder("img://a").build();
        assert_eq!(request.address().as_str(), "img://a");
        assert!(request.hints().is_none());
        assert!(request.processors().is_empty());
        assert!(request.target().is_none());
        assert!(request.memory_cache().is_none());
        assert!(request.disk_cache().is_none());
        assert_eq!(request.strategy(), DiskCacheStrategy::All);
        assert!(!request.skip_read_memory());
        assert!(!request.skip_write_memory());
        assert!(!request.skip_read_disk());
    }

    #[test]
    fn builder_sets_fields() {
        let request = Request::builder("img://a")
            .sample_size(2)
            .processor(Arc::new(Grayscale))
            .target_id("slot-1")
            .skip_read_memory(true)
            .skip_write_memory(true)
            .skip_read_disk(true)
            .strategy(DiskCacheStrategy::Result)
            .build();

        assert_eq!(request.hints(), Some(DecodeHints::with_sample_size(2)));
        assert_eq!(request.processors().ids(), vec!["grayscale"]);
        assert_eq!(request.target_id(), Some(&TargetId::new("slot-1")));
        assert!(request.skip_read_memory());
        assert!(request.skip_write_memory());
        assert!(request.skip_read_disk());
        assert_eq!(request.strategy(), DiskCacheStrategy::Result);
    }

    #[test]
    fn key_subject_follows_snapshot() {
        let request = Request::builder("img://a")
            .processor(Arc::new(Grayscale))
            .build();
        let snapshot = request.processors().snapshot();
        let subject = request.key_subject(&snapshot);
        let keys = DigestKeyMaker.keys(&subject);
        assert!(keys.distinct());
        assert_eq!(subject.processor_ids, vec!["grayscale"]);
    }

    #[test]
    fn debug_omits_collaborators() {
        let text = format!("{:?}", Request::builder("img://a").build());
        assert!(text.contains("img://a"));
        assert!(text.contains("memory_cache: false"));
    }
}
