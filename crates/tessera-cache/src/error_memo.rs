//! Failure memo
//!
//! Remembers the last fetch failure per address so a known-bad source is not
//! hammered. Validity is re-evaluated on every lookup; an expired entry is
//! removed and ignored rather than trusted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{Address, FetchError, Origin};
use tokio::time::Instant;

/// A memoized failure
#[derive(Debug, Clone)]
pub struct LoadError {
    address: Address,
    failure: Arc<FetchError>,
    origin: Origin,
    recorded_at: Instant,
    timestamp: DateTime<Utc>,
    ttl: Duration,
}

impl LoadError {
    /// Record a failure observed now
    #[must_use]
    pub fn new(address: Address, failure: Arc<FetchError>, origin: Origin, ttl: Duration) -> Self {
        Self {
            address,
            failure,
            origin,
            recorded_at: Instant::now(),
            timestamp: Utc::now(),
            ttl,
        }
    }

    /// Address the failure belongs to
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The underlying failure
    #[must_use]
    pub fn failure(&self) -> &Arc<FetchError> {
        &self.failure
    }

    /// Tier the failure was observed at
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Wall-clock time the failure was recorded
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the failure should still short-circuit fetches, as of now
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.recorded_at.elapsed() < self.ttl
    }
}

/// Address → last failure
#[derive(Debug)]
pub struct LoadErrorMemo {
    entries: DashMap<Address, LoadError>,
    ttl: Duration,
}

impl LoadErrorMemo {
    /// Memo whose entries stay valid for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Validity window applied to new entries
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Raw lookup, valid or not
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<LoadError> {
        self.entries.get(address).map(|entry| entry.value().clone())
    }

    /// Lookup that drops an expired entry and reports only a valid one
    #[must_use]
    pub fn get_valid(&self, address: &Address) -> Option<LoadError> {
        let error = self.get(address)?;
        if error.is_valid() {
            Some(error)
        } else {
            tracing::debug!(%address, "memoized failure expired");
            self.entries
                .remove_if(address, |_, stored| stored.recorded_at == error.recorded_at);
            None
        }
    }

    /// Record a failure, replacing any previous one for the address
    pub fn put(&self, address: Address, failure: Arc<FetchError>, origin: Origin) {
        tracing::warn!(%address, %origin, "memoizing failure: {}", failure);
        let error = LoadError::new(address.clone(), failure, origin, self.ttl);
        self.entries.insert(address, error);
    }

    /// Forget the failure for an address
    pub fn remove(&self, address: &Address) {
        self.entries.remove(address);
    }

    /// Forget every failure
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, valid or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the memo is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LoadErrorMemo {
    /// Memo with a one minute validity window
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> Arc<FetchError> {
        Arc::new(FetchError::NotFound("img://b".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn valid_within_window() {
        let memo = LoadErrorMemo::new(Duration::from_secs(10));
        let address = Address::new("img://b");
        memo.put(address.clone(), failure(), Origin::External);

        tokio::time::advance(Duration::from_secs(9)).await;

        let error = memo.get_valid(&address).unwrap();
        assert_eq!(error.origin(), Origin::External);
        assert_eq!(error.address(), &address);
        assert!(matches!(error.failure().as_ref(), FetchError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_removed_on_lookup() {
        let memo = LoadErrorMemo::new(Duration::from_secs(10));
        let address = Address::new("img://b");
        memo.put(address.clone(), failure(), Origin::External);

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(memo.get(&address).is_some());
        assert!(!memo.get(&address).unwrap().is_valid());
        assert!(memo.get_valid(&address).is_none());
        assert!(memo.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_refreshes_window() {
        let memo = LoadErrorMemo::new(Duration::from_secs(10));
        let address = Address::new("img://b");
        memo.put(address.clone(), failure(), Origin::External);
        tokio::time::advance(Duration::from_secs(8)).await;
        memo.put(address.clone(), failure(), Origin::External);
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(memo.get_valid(&address).is_some());
    }

    #[test]
    fn remove_and_clear() {
        let memo = LoadErrorMemo::default();
        memo.put(Address::new("img://a"), failure(), Origin::External);
        memo.put(Address::new("img://b"), failure(), Origin::External);
        assert_eq!(memo.len(), 2);

        memo.remove(&Address::new("img://a"));
        assert!(memo.get(&Address::new("img://a")).is_none());

        memo.clear();
        assert!(memo.is_empty());
    }

    #[test]
    fn zero_ttl_never_short_circuits() {
        let memo = LoadErrorMemo::new(Duration::ZERO);
        let address = Address::new("img://a");
        memo.put(address.clone(), failure(), Origin::External);
        assert!(memo.get_valid(&address).is_none());
    }
}
