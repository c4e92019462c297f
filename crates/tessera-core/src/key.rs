//! Cache key derivation
//!
//! Provides [`CacheKey`], a 32-byte Blake3 digest naming a cached artifact, and
//! the [`KeyMaker`] contract that derives the source and result keys of a request.
//!
//! # Encoding
//!
//! [`DigestKeyMaker`] hashes a domain-tagged, length-prefixed encoding:
//!
//! ```text
//! "tessera.key.v1" | A len(address) address | [H sample_size] | [P len(id) id]...
//! ```
//!
//! Every field carries its own length, so no two distinct (address, hints,
//! chain) triples share an encoding. With no hints and an empty chain the result
//! encoding is the source encoding, so the two keys are equal.

use crate::address::{Address, DecodeHints};
use crate::error::KeyParseError;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const DOMAIN_TAG: &[u8] = b"tessera.key.v1";
const ADDRESS_TAG: u8 = b'A';
const HINTS_TAG: u8 = b'H';
const PROCESSOR_TAG: u8 = b'P';

/// A 32-byte cache key (Blake3)
///
/// Immutable and cheap to clone (Copy). Its hex form doubles as the disk file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Create a key from raw digest bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create key from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyParseError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyParseError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Short string representation (first 16 hex chars), used in logs
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for CacheKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

/// Everything a key is derived from, captured at one instant
///
/// `processor_ids` must come from the same chain snapshot the task applies, so
/// the key always names what was actually produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySubject {
    /// Canonical address
    pub address: Address,
    /// Decode hints, if any
    pub hints: Option<DecodeHints>,
    /// Stable processor identifiers, in application order
    pub processor_ids: Vec<String>,
}

impl KeySubject {
    /// Create a key subject
    #[must_use]
    pub fn new(address: Address, hints: Option<DecodeHints>, processor_ids: Vec<String>) -> Self {
        Self {
            address,
            hints,
            processor_ids,
        }
    }
}

/// The pair of keys a retrieval task works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKeys {
    /// Names the raw fetched bytes
    pub source: CacheKey,
    /// Names the fully processed artifact
    pub result: CacheKey,
}

impl RequestKeys {
    /// Whether the result tier is a distinct entry from the source tier
    #[inline]
    #[must_use]
    pub fn distinct(&self) -> bool {
        self.source != self.result
    }
}

/// Derives cache keys from a request
///
/// # Contract
/// - Pure and infallible; absent fields are omitted, never an error
/// - `source_key` depends only on the address
/// - `result_key` changes iff the address, hints, or processor ids/order change
pub trait KeyMaker: Send + Sync {
    /// Key of the raw fetched artifact
    fn source_key(&self, subject: &KeySubject) -> CacheKey;

    /// Key of the artifact after the processor chain
    fn result_key(&self, subject: &KeySubject) -> CacheKey;

    /// Both keys at once
    fn keys(&self, subject: &KeySubject) -> RequestKeys {
        RequestKeys {
            source: self.source_key(subject),
            result: self.result_key(subject),
        }
    }
}

/// Default key maker: structured Blake3 digest
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestKeyMaker;

impl DigestKeyMaker {
    fn address_hasher(address: &Address) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_TAG);
        write_field(&mut hasher, ADDRESS_TAG, address.as_str().as_bytes());
        hasher
    }

    fn finish(hasher: &blake3::Hasher) -> CacheKey {
        CacheKey::new(*hasher.finalize().as_bytes())
    }
}

impl KeyMaker for DigestKeyMaker {
    fn source_key(&self, subject: &KeySubject) -> CacheKey {
        Self::finish(&Self::address_hasher(&subject.address))
    }

    fn result_key(&self, subject: &KeySubject) -> CacheKey {
        let mut hasher = Self::address_hasher(&subject.address);
        if let Some(hints) = subject.hints {
            write_field(&mut hasher, HINTS_TAG, &hints.sample_size.to_le_bytes());
        }
        for id in &subject.processor_ids {
            write_field(&mut hasher, PROCESSOR_TAG, id.as_bytes());
        }
        Self::finish(&hasher)
    }
}

fn write_field(hasher: &mut blake3::Hasher, tag: u8, bytes: &[u8]) {
    hasher.update(&[tag]);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
