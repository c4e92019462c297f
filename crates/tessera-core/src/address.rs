//! Request addressing
//!
//! An [`Address`] is the canonical, URI-like name of an asset. It is the key for
//! the failure memo and the only input to the source key.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Canonical address of a remotely- or locally-addressed asset
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create an address from its canonical text
    #[inline]
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The canonical text
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme portion (`file`, `img`, ...) if the address carries one
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.0.split_once("://")?;
        if scheme.is_empty() {
            None
        } else {
            Some(scheme)
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Decode hints carried by a request
///
/// `sample_size` is a downsample factor: 2 decodes at half width and height,
/// 4 at a quarter. Values below 1 are clamped to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecodeHints {
    /// Downsample factor applied while decoding
    pub sample_size: u32,
}

impl DecodeHints {
    /// Hints with the given downsample factor
    #[inline]
    #[must_use]
    pub const fn with_sample_size(sample_size: u32) -> Self {
        Self { sample_size }
    }

    /// Effective downsample factor, never below 1
    #[inline]
    #[must_use]
    pub const fn effective_sample_size(&self) -> u32 {
        if self.sample_size == 0 {
            1
        } else {
            self.sample_size
        }
    }
}

impl Default for DecodeHints {
    fn default() -> Self {
        Self { sample_size: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_scheme() {
        assert_eq!(Address::new("img://a").scheme(), Some("img"));
        assert_eq!(Address::new("file:///tmp/a.png").scheme(), Some("file"));
        assert_eq!(Address::new("/tmp/a.png").scheme(), None);
        assert_eq!(Address::new("://oops").scheme(), None);
    }

    #[test]
    fn address_display_roundtrips_text() {
        let address = Address::from("img://a");
        assert_eq!(address.to_string(), "img://a");
        assert_eq!(address.as_str(), "img://a");
    }

    #[test]
    fn hints_clamp_zero_sample_size() {
        assert_eq!(DecodeHints::with_sample_size(0).effective_sample_size(), 1);
        assert_eq!(DecodeHints::with_sample_size(4).effective_sample_size(), 4);
    }

    #[test]
    fn address_serializes_as_plain_string() {
        let json = serde_json::to_string(&Address::new("img://a")).unwrap();
        assert_eq!(json, "\"img://a\"");
    }
}
