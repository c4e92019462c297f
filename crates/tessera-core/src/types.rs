//! Origin tiers and disk write strategies

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// The tier that ultimately produced a result or a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// In-process memory cache, or a memoized failure
    Memory,
    /// Disk cache, result or source tier
    Disk,
    /// The external fetch collaborator
    External,
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

/// Which disk tiers are written after an external fetch
///
/// Source-tier persistence of raw bytes belongs to the fetcher; the retrieval
/// task only ever writes the processed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheStrategy {
    /// Nothing is written to disk
    None,
    /// Raw fetched bytes only
    Source,
    /// Post-processing result only
    Result,
    /// Both tiers
    #[default]
    All,
}

impl DiskCacheStrategy {
    /// Whether the processed result is persisted under the result key
    #[inline]
    #[must_use]
    pub const fn writes_result(self) -> bool {
        matches!(self, Self::Result | Self::All)
    }

    /// Whether raw fetched bytes are persisted under the source key
    #[inline]
    #[must_use]
    pub const fn writes_source(self) -> bool {
        matches!(self, Self::Source | Self::All)
    }
}

impl Display for DiskCacheStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Source => "source",
            Self::Result => "result",
            Self::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for DiskCacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "source" => Ok(Self::Source),
            "result" => Ok(Self::Result),
            "all" => Ok(Self::All),
            other => Err(format!("unknown disk cache strategy: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_tiers() {
        assert!(!DiskCacheStrategy::None.writes_result());
        assert!(!DiskCacheStrategy::None.writes_source());
        assert!(DiskCacheStrategy::Source.writes_source());
        assert!(!DiskCacheStrategy::Source.writes_result());
        assert!(DiskCacheStrategy::Result.writes_result());
        assert!(!DiskCacheStrategy::Result.writes_source());
        assert!(DiskCacheStrategy::All.writes_result());
        assert!(DiskCacheStrategy::All.writes_source());
    }

    #[test]
    fn strategy_parse() {
        assert_eq!("ALL".parse::<DiskCacheStrategy>(), Ok(DiskCacheStrategy::All));
        assert_eq!("result".parse::<DiskCacheStrategy>(), Ok(DiskCacheStrategy::Result));
        assert!("sometimes".parse::<DiskCacheStrategy>().is_err());
    }

    #[test]
    fn strategy_serde_lowercase() {
        let json = serde_json::to_string(&DiskCacheStrategy::Source).unwrap();
        assert_eq!(json, "\"source\"");
        let parsed: DiskCacheStrategy = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, DiskCacheStrategy::None);
    }

    #[test]
    fn origin_display() {
        assert_eq!(Origin::Memory.to_string(), "memory");
        assert_eq!(Origin::Disk.to_string(), "disk");
        assert_eq!(Origin::External.to_string(), "external");
    }
}
