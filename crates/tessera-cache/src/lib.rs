//! Tessera cache tiers
//!
//! The shared, internally synchronized stores a retrieval task consults:
//!
//! - [`MemoryCache`]: decoded artifacts by result key, bounded and evicting
//! - [`DiskCache`]: opaque key → bytes persistence with deferred writes
//! - [`LoadErrorMemo`]: last fetch failure per address, with a validity window
//!
//! # Architecture
//!
//! ```text
//! RetrievalTask ──get/put──▶ MemoryCache   (MokaMemoryCache)
//!               ──get/put──▶ DiskCache     (FsDiskCache, one file per key)
//!               ──get/put──▶ LoadErrorMemo (DashMap, checked at lookup time)
//! ```
//!
//! None of these are singletons. Callers construct them, wrap them in `Arc`,
//! and pass them to the pipeline that owns their lifetime.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod disk;
pub mod error;
pub mod error_memo;
pub mod memory;

pub use disk::{ArtifactWriter, BytesWriter, DiskCache, EntryWriter, FsDiskCache};
pub use error::DiskError;
pub use error_memo::{LoadError, LoadErrorMemo};
pub use memory::{CacheStats, MemoryCache, MokaMemoryCache};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
