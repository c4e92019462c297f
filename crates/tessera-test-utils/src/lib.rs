//! Testing utilities for the Tessera workspace
//!
//! Scriptable collaborators that record how the retrieval pipeline used them.

#![allow(missing_docs)]

use async_trait::async_trait;
use dashmap::DashMap;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_cache::{DiskCache, DiskError, EntryWriter, MemoryCache};
use tessera_core::{
    Address, Artifact, CacheKey, DecodeError, DecodeHints, FetchError, LoadFailure, Origin,
    Processor,
};
use tessera_task::{CancelToken, Decoder, FetchRequest, Fetcher, ImageDecoder, Request, Target};
use tokio::sync::Notify;

/// PNG bytes of a solid-colour image
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(rgba)));
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .expect("in-memory png encode");
    buf.into_inner()
}

/// A small red test image
pub fn red_png() -> Vec<u8> {
    solid_png(8, 8, [220, 20, 20, 255])
}

/// Decoded form of [`solid_png`]
pub fn solid_artifact(width: u32, height: u32, rgba: [u8; 4]) -> Artifact {
    Artifact::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba(rgba),
    )))
}

/// What a [`ScriptedFetcher`] does for one address
#[derive(Clone)]
pub enum Script {
    /// Return these bytes
    Bytes(Vec<u8>),
    /// Fail with `FetchError::NotFound`
    NotFound,
    /// Fail with `FetchError::Other`
    Fail(String),
    /// Cancel the token, then return the bytes anyway
    CancelThenSucceed(Vec<u8>),
    /// Cancel the token and report the interruption
    Interrupt,
    /// Block until released or cancelled, then return the bytes
    Gate(Vec<u8>, Arc<Notify>),
}

/// Fetcher answering from a per-address script, counting calls
///
/// Unscripted addresses fail with `NotFound`.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: DashMap<Address, Script>,
    calls: DashMap<Address, usize>,
    total: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, address: &str, script: Script) -> &Self {
        self.scripts.insert(Address::new(address), script);
        self
    }

    pub fn respond(&self, address: &str, bytes: Vec<u8>) -> &Self {
        self.script(address, Script::Bytes(bytes))
    }

    pub fn fail(&self, address: &str, message: &str) -> &Self {
        self.script(address, Script::Fail(message.to_string()))
    }

    /// Hold fetches of `address` until the returned notify is signalled
    pub fn gate(&self, address: &str, bytes: Vec<u8>) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.script(address, Script::Gate(bytes, Arc::clone(&notify)));
        notify
    }

    pub fn calls(&self, address: &str) -> usize {
        self.calls
            .get(&Address::new(address))
            .map_or(0, |count| *count)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, FetchError> {
        *self.calls.entry(request.address.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let script = self.scripts.get(&request.address).map(|s| s.value().clone());
        match script {
            None | Some(Script::NotFound) => Err(FetchError::NotFound(request.address.to_string())),
            Some(Script::Bytes(bytes)) => Ok(bytes),
            Some(Script::Fail(message)) => Err(FetchError::Other(message)),
            Some(Script::CancelThenSucceed(bytes)) => {
                cancel.cancel();
                Ok(bytes)
            }
            Some(Script::Interrupt) => {
                cancel.cancel();
                Err(FetchError::Interrupted)
            }
            Some(Script::Gate(bytes, notify)) => {
                tokio::select! {
                    () = notify.notified() => Ok(bytes),
                    () = cancel.cancelled() => Err(FetchError::Interrupted),
                }
            }
        }
    }
}

/// Image decoder that counts calls and can be told to run out of memory
#[derive(Default)]
pub struct CountingDecoder {
    inner: ImageDecoder,
    calls: AtomicUsize,
    exhaust: AtomicUsize,
}

impl CountingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` decodes report resource exhaustion
    pub fn exhaust_next(&self, n: usize) {
        self.exhaust.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for CountingDecoder {
    fn decode(&self, bytes: &[u8], hints: Option<&DecodeHints>) -> Result<Artifact, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let exhausted = self
            .exhaust
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if exhausted {
            return Err(DecodeError::ResourceExhausted);
        }
        self.inner.decode(bytes, hints)
    }
}

/// One target callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Result {
        address: String,
        origin: Origin,
        width: u32,
        height: u32,
    },
    Error {
        address: String,
        origin: Origin,
        message: String,
    },
}

impl Delivered {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Result { origin, .. } | Self::Error { origin, .. } => *origin,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Target recording every callback
#[derive(Default)]
pub struct RecordingTarget {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl Target for RecordingTarget {
    fn on_result(&self, artifact: Artifact, origin: Origin, request: &Request) {
        self.delivered.lock().push(Delivered::Result {
            address: request.address().to_string(),
            origin,
            width: artifact.width(),
            height: artifact.height(),
        });
    }

    fn on_error(&self, error: &LoadFailure, origin: Origin, request: &Request) {
        self.delivered.lock().push(Delivered::Error {
            address: request.address().to_string(),
            origin,
            message: error.to_string(),
        });
    }
}

/// In-memory disk store that runs writers immediately and logs every write
#[derive(Default)]
pub struct RecordingDiskCache {
    entries: DashMap<CacheKey, Vec<u8>>,
    writes: Mutex<Vec<CacheKey>>,
    reads: AtomicUsize,
}

impl RecordingDiskCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store bytes without logging a write
    pub fn seed(&self, key: CacheKey, bytes: Vec<u8>) {
        self.entries.insert(key, bytes);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn bytes(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn writes(&self) -> Vec<CacheKey> {
        self.writes.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DiskCache for RecordingDiskCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, DiskError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes(key))
    }

    fn put(&self, key: CacheKey, writer: Box<dyn EntryWriter>) {
        let mut bytes = Vec::new();
        if writer.write_to(&mut bytes).is_ok() {
            self.entries.insert(key, bytes);
        }
        self.writes.lock().push(key);
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), DiskError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), DiskError> {
        self.entries.clear();
        Ok(())
    }
}

/// Memory tier over a map, counting puts and clears
#[derive(Default)]
pub struct RecordingMemoryCache {
    entries: DashMap<CacheKey, Artifact>,
    puts: AtomicUsize,
    clears: AtomicUsize,
    reclaims: AtomicUsize,
}

impl RecordingMemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, artifact: Artifact) {
        self.entries.insert(key, artifact);
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryCache for RecordingMemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<Artifact> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    async fn put(&self, key: CacheKey, artifact: Artifact) {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(key, artifact);
    }

    async fn remove(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    async fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    async fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }

    fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Pass-through processor counting its invocations
pub struct CountingProcessor {
    id: String,
    calls: Arc<AtomicUsize>,
}

impl CountingProcessor {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for CountingProcessor {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        self.calls.fetch_add(1, Ordering::SeqCst);
        artifact
    }
}
