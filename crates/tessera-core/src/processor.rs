//! Processor chains
//!
//! A [`Processor`] is a pure artifact → artifact transform with a stable
//! identifier. A [`ProcessorChain`] is an ordered, shareable list of them.
//!
//! # Snapshots
//!
//! The chain is copy-on-write: [`ProcessorChain::push`] swaps in a new list and
//! [`ProcessorChain::snapshot`] hands out the current one. A task takes one
//! snapshot and uses it both to derive its result key and to apply the chain,
//! so a concurrent push can neither corrupt iteration nor desynchronise the key
//! from the pixels it names.

use crate::artifact::Artifact;
use image::imageops::FilterType;
use parking_lot::RwLock;
use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;

/// Pure artifact transform
///
/// # Contract
/// - `id` must be stable across runs and include every parameter that affects
///   output; it feeds the result key
/// - `process` must be deterministic for a given input
pub trait Processor: Send + Sync {
    /// Stable identifier, e.g. `blur(2.5)`
    fn id(&self) -> String;

    /// Transform the artifact
    fn process(&self, artifact: Artifact) -> Artifact;
}

/// Immutable view of a chain at one instant
pub type ProcessorSnapshot = Arc<[Arc<dyn Processor>]>;

/// Ordered, shareable processor list
///
/// Clones share the same underlying list.
#[derive(Clone)]
pub struct ProcessorChain {
    inner: Arc<RwLock<ProcessorSnapshot>>,
}

impl ProcessorChain {
    /// Empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::from_processors(Vec::new())
    }

    /// Chain over the given processors, in order
    #[must_use]
    pub fn from_processors(processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        let list: Vec<Arc<dyn Processor>> = processors.into_iter().collect();
        Self {
            inner: Arc::new(RwLock::new(Arc::from(list))),
        }
    }

    /// Append a processor; existing snapshots are unaffected
    pub fn push(&self, processor: Arc<dyn Processor>) {
        let mut guard = self.inner.write();
        let mut list: Vec<Arc<dyn Processor>> = guard.iter().cloned().collect();
        list.push(processor);
        *guard = Arc::from(list);
    }

    /// Current list
    #[must_use]
    pub fn snapshot(&self) -> ProcessorSnapshot {
        self.inner.read().clone()
    }

    /// Identifiers of the current list, in order
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        snapshot_ids(&self.snapshot())
    }

    /// Number of processors
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessorChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ProcessorChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

/// Identifiers of a snapshot, in order
#[must_use]
pub fn snapshot_ids(snapshot: &ProcessorSnapshot) -> Vec<String> {
    snapshot.iter().map(|p| p.id()).collect()
}

/// Run every processor of a snapshot in order; an empty snapshot passes through
#[must_use]
pub fn apply_snapshot(snapshot: &ProcessorSnapshot, artifact: Artifact) -> Artifact {
    snapshot
        .iter()
        .fold(artifact, |current, processor| processor.process(current))
}

/// Converts to grayscale
#[derive(Debug, Clone, Copy, Default)]
pub struct Grayscale;

impl Processor for Grayscale {
    fn id(&self) -> String {
        "grayscale".to_string()
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        artifact.map(image::DynamicImage::grayscale)
    }
}

/// Inverts every color channel
#[derive(Debug, Clone, Copy, Default)]
pub struct Invert;

impl Processor for Invert {
    fn id(&self) -> String {
        "invert".to_string()
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        artifact.map(|img| {
            let mut out = img.clone();
            out.invert();
            out
        })
    }
}

/// Gaussian blur
#[derive(Debug, Clone, Copy)]
pub struct Blur {
    sigma: f32,
}

impl Blur {
    /// Blur with the given standard deviation; `None` unless finite and positive
    #[must_use]
    pub fn new(sigma: f32) -> Option<Self> {
        (sigma.is_finite() && sigma > 0.0).then_some(Self { sigma })
    }

    /// Standard deviation of the kernel
    #[inline]
    #[must_use]
    pub fn sigma(&self) -> f32 {
        self.sigma
    }
}

impl Processor for Blur {
    fn id(&self) -> String {
        format!("blur({})", self.sigma)
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        artifact.map(|img| img.blur(self.sigma))
    }
}

/// Exact resize with a triangle filter
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    /// Target width
    pub width: u32,
    /// Target height
    pub height: u32,
}

impl Processor for Resize {
    fn id(&self) -> String {
        format!("resize({}x{})", self.width, self.height)
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        artifact.map(|img| img.resize_exact(self.width, self.height, FilterType::Triangle))
    }
}

/// Clockwise rotation in quarter turns
#[derive(Debug, Clone, Copy)]
pub struct Rotate {
    /// Number of 90° clockwise turns, taken modulo 4
    pub quarter_turns: u8,
}

impl Processor for Rotate {
    fn id(&self) -> String {
        format!("rotate({})", self.quarter_turns % 4)
    }

    fn process(&self, artifact: Artifact) -> Artifact {
        match self.quarter_turns % 4 {
            1 => artifact.map(image::DynamicImage::rotate90),
            2 => artifact.map(image::DynamicImage::rotate180),
            3 => artifact.map(image::DynamicImage::rotate270),
            _ => artifact,
        }
    }
}

/// Failure parsing a processor spec such as `blur:2.5`
#[derive(Debug, thiserror::Error)]
pub enum ProcessorSpecError {
    /// No processor with that name
    #[error("unknown processor: '{0}'")]
    Unknown(String),

    /// Argument missing or malformed
    #[error("invalid argument for {name}: '{arg}'")]
    InvalidArgument {
        /// Processor name
        name: String,
        /// Offending argument text
        arg: String,
    },
}

/// Parsed processor spec, `name[:arg]`
///
/// Accepted forms: `grayscale`, `invert`, `blur:<sigma>`, `resize:<w>x<h>`,
/// `rotate:<quarter_turns>`.
#[derive(Clone)]
pub struct ProcessorSpec(pub Arc<dyn Processor>);

impl FromStr for ProcessorSpec {
    type Err = ProcessorSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), arg.trim()),
            None => (s.trim(), ""),
        };
        let invalid = || ProcessorSpecError::InvalidArgument {
            name: name.to_string(),
            arg: arg.to_string(),
        };

        let processor: Arc<dyn Processor> = match name {
            "grayscale" => Arc::new(Grayscale),
            "invert" => Arc::new(Invert),
            "blur" => {
                let sigma: f32 = arg.parse().map_err(|_| invalid())?;
                Arc::new(Blur::new(sigma).ok_or_else(invalid)?)
            }
            "resize" => {
                let (w, h) = arg.split_once('x').ok_or_else(invalid)?;
                let width = w.parse().map_err(|_| invalid())?;
                let height = h.parse().map_err(|_| invalid())?;
                Arc::new(Resize { width, height })
            }
            "rotate" => {
                let quarter_turns = arg.parse().map_err(|_| invalid())?;
                Arc::new(Rotate { quarter_turns })
            }
            other => return Err(ProcessorSpecError::Unknown(other.to_string())),
        };
        Ok(Self(processor))
    }
}
