//! Failure taxonomy
//!
//! Every failure a request can observe is a [`LoadFailure`] attributed to an
//! [`Origin`]. Cancellation is not in this taxonomy: a cancelled request is
//! silent, never an error.

use crate::types::Origin;
use std::sync::Arc;

/// Failure reported by a fetcher
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or filesystem IO failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing exists at the address
    #[error("not found: {0}")]
    NotFound(String),

    /// The fetcher cannot handle this kind of address
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    /// The fetch was stopped by cancellation
    #[error("fetch interrupted")]
    Interrupted,

    /// Fetcher-specific failure
    #[error("fetch failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Whether this failure is a cancellation rather than a real error
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

/// Failure reported by a decoder
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Bytes are not a valid image
    #[error("malformed image data: {0}")]
    Malformed(String),

    /// Image format is recognised but not supported
    #[error("unsupported image format: {0}")]
    Unsupported(String),

    /// Decoding would exceed the allowed memory
    #[error("decode exhausted available memory")]
    ResourceExhausted,
}

impl DecodeError {
    /// Whether a retry after freeing memory might succeed
    #[inline]
    #[must_use]
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted)
    }
}

/// A failure delivered to a request's target
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadFailure {
    /// Network or disk read failure, possibly replayed from the failure memo
    #[error("io failure at {origin} tier: {source}")]
    Io {
        /// Tier the failure is attributed to
        origin: Origin,
        /// Underlying fetch failure
        #[source]
        source: Arc<FetchError>,
    },

    /// Decoding could not complete even after freeing the memory cache
    #[error("resource exhaustion at {origin} tier")]
    ResourceExhausted {
        /// Tier the failure is attributed to
        origin: Origin,
    },

    /// Decoding failed for a reason unrelated to IO
    #[error("decode failure at {origin} tier: {source}")]
    Decode {
        /// Tier the failure is attributed to
        origin: Origin,
        /// Underlying decode failure
        #[source]
        source: DecodeError,
    },
}

impl LoadFailure {
    /// IO failure at the given tier
    pub fn io(origin: Origin, source: impl Into<Arc<FetchError>>) -> Self {
        Self::Io {
            origin,
            source: source.into(),
        }
    }

    /// Decode failure at the given tier, mapping exhaustion to its own variant
    #[must_use]
    pub fn decode(origin: Origin, source: DecodeError) -> Self {
        if source.is_resource_exhausted() {
            Self::ResourceExhausted { origin }
        } else {
            Self::Decode { origin, source }
        }
    }

    /// Tier the failure is attributed to
    #[inline]
    #[must_use]
    pub fn origin(&self) -> Origin {
        match self {
            Self::Io { origin, .. }
            | Self::ResourceExhausted { origin }
            | Self::Decode { origin, .. } => *origin,
        }
    }
}

/// Failure parsing a [`crate::CacheKey`] from text
#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    /// Invalid digest length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Hex decoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
