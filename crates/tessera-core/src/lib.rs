//! Tessera Core
//!
//! The vocabulary shared by every tier of the retrieval pipeline:
//!
//! - **Addresses and hints**: what a request asks for ([`Address`], [`DecodeHints`])
//! - **Keys**: stable digests that name cached artifacts ([`CacheKey`], [`KeyMaker`])
//! - **Artifacts**: decoded images, cheap to share ([`Artifact`])
//! - **Processors**: ordered, identifiable transforms ([`Processor`], [`ProcessorChain`])
//! - **Failures**: origin-attributed errors ([`LoadFailure`], [`FetchError`], [`DecodeError`])
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_core::prelude::*;
//!
//! let chain = ProcessorChain::from_processors([Arc::new(Grayscale) as Arc<dyn Processor>]);
//! let subject = KeySubject::new(Address::new("img://a"), None, chain.ids());
//!
//! let keys = DigestKeyMaker.keys(&subject);
//! assert_ne!(keys.source, keys.result);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod address;
pub mod artifact;
pub mod error;
pub mod key;
pub mod processor;
pub mod types;

pub use address::{Address, DecodeHints};
pub use artifact::Artifact;
pub use error::{DecodeError, FetchError, KeyParseError, LoadFailure};
pub use key::{CacheKey, DigestKeyMaker, KeyMaker, KeySubject, RequestKeys};
pub use processor::{
    apply_snapshot, snapshot_ids, Blur, Grayscale, Invert, Processor, ProcessorChain,
    ProcessorSnapshot, ProcessorSpec, ProcessorSpecError, Resize, Rotate,
};
pub use types::{DiskCacheStrategy, Origin};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Tessera core types
    pub use crate::{
        Address, Artifact, CacheKey, DecodeHints, DigestKeyMaker, DiskCacheStrategy, KeyMaker,
        KeySubject, LoadFailure, Origin, Processor, ProcessorChain, RequestKeys,
    };
    pub use crate::processor::{Blur, Grayscale, Invert, Resize, Rotate};
    pub use std::sync::Arc;
}
