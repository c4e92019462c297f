//! Tessera Task - Retrieval Orchestration
//!
//! Resolves a [`Request`] to a decoded, processed artifact through an ordered
//! set of tiers, under a cooperative cancellation contract:
//!
//! ```text
//! CREATED → CHECK_MEMORY → CHECK_DISK → CHECK_ERROR_MEMO → FETCH_EXTERNAL
//!         → APPLY_PROCESSORS → POPULATE_CACHES → DONE
//!
//!   any state ──cancel──▶ CANCELLED (silent)
//!   CHECK_DISK / CHECK_ERROR_MEMO / FETCH_EXTERNAL ──▶ FAILED
//! ```
//!
//! The [`Loader`] runs tasks on a bounded pool and hands every outcome to a
//! single delivery loop, which is the only place targets are invoked.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_task::prelude::*;
//!
//! let loader = Loader::builder(FileFetcher::new())
//!     .memory_cache(Arc::new(MokaMemoryCache::default()))
//!     .build();
//!
//! let request = loader
//!     .request("file:///tmp/a.png")
//!     .processor(Arc::new(Grayscale))
//!     .target(Arc::new(my_target))
//!     .build();
//!
//! let handle = loader.go(request);
//! let outcome = handle.join().await;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cancel;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod request;
pub mod retrieval;
pub mod state;

pub use cancel::CancelToken;
pub use config::LoaderConfig;
pub use decode::{Decoder, ImageDecoder};
pub use error::{LoaderError, StateError};
pub use fetch::{FetchRequest, Fetcher, FileFetcher, SourcePersistingFetcher};
pub use loader::{DeliveryLoop, Loader, LoaderBuilder, TaskHandle};
pub use request::{Request, RequestBuilder, Target, TargetId};
pub use retrieval::{RetrievalTask, TaskContext, TaskId, TaskOutcome};
pub use state::TaskState;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for loading artifacts
    pub use crate::{
        CancelToken, Decoder, Fetcher, FileFetcher, ImageDecoder, Loader, LoaderConfig, Request,
        Target, TaskHandle, TaskOutcome,
    };
    pub use tessera_cache::{DiskCache, FsDiskCache, LoadErrorMemo, MemoryCache, MokaMemoryCache};
    pub use tessera_core::prelude::*;
}
