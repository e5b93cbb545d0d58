//! Check-result cache with bounded staleness.
//!
//! Entries are only ever created from a completed remote exchange and are
//! never served once their TTL has elapsed. Expiry is lazy: stale entries
//! stay in storage until overwritten, invalidated or purged, but lookups
//! treat them as absent.

use crate::application::ports::{Clock, Storage};
use crate::domain::{decision::CheckDecision, key::CheckKey};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cached decision and its freshness window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    decision: CheckDecision,
    /// When the remote exchange producing this decision completed
    acquired_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    /// Create an entry for a decision completed at `acquired_at`.
    pub fn new(decision: CheckDecision, acquired_at: Instant, ttl: Duration) -> Self {
        Self {
            decision,
            acquired_at,
            ttl,
        }
    }

    /// The cached decision.
    pub fn decision(&self) -> &CheckDecision {
        &self.decision
    }

    /// Completion time of the remote exchange.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Freshness window.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Remaining freshness at `now`, or `None` once `now - acquired_at >= ttl`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let age = now.saturating_duration_since(self.acquired_at);
        self.ttl.checked_sub(age).filter(|left| !left.is_zero())
    }

    /// Whether the entry may still be served at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.remaining(now).is_some()
    }
}

/// Cache of authorization decisions keyed by `CheckKey`.
///
/// Generic over the storage implementation; in production this is
/// `Arc<ShardedStorage<CheckKey, CacheEntry>>`.
#[derive(Debug, Clone)]
pub struct CheckCache<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    storage: S,
    clock: Arc<dyn Clock>,
}

impl<S> CheckCache<S>
where
    S: Storage<CheckKey, CacheEntry> + Clone,
{
    /// Create a cache over `storage`, reading time from `clock`.
    pub fn new(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Return the cached decision and its remaining freshness, if fresh.
    pub fn lookup(&self, key: &CheckKey) -> Option<(CheckDecision, Duration)> {
        let now = self.clock.now();
        self.storage
            .with_entry(key, |entry| {
                entry
                    .remaining(now)
                    .map(|left| (entry.decision.clone(), left))
            })
            .flatten()
    }

    /// Store an entry unless a more recently completed one is already cached.
    ///
    /// Returns true if `entry` was written.
    pub fn store(&self, key: CheckKey, entry: CacheEntry) -> bool {
        self.storage.upsert_if(key, entry, |existing, candidate| {
            candidate.acquired_at >= existing.acquired_at
        })
    }

    /// Drop the entry for `key`. Returns true if one was present.
    pub fn invalidate(&self, key: &CheckKey) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Remove every entry that can no longer be served. Returns how many
    /// were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.storage.retain(|_, entry| {
            let keep = entry.is_fresh(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::DenialReason;
    use crate::infrastructure::mocks::MockClock;
    use crate::infrastructure::storage::ShardedStorage;

    fn cache() -> (
        CheckCache<Arc<ShardedStorage<CheckKey, CacheEntry>>>,
        MockClock,
    ) {
        let clock = MockClock::new(Instant::now());
        let cache = CheckCache::new(Arc::new(ShardedStorage::new()), Arc::new(clock.clone()));
        (cache, clock)
    }

    fn key() -> CheckKey {
        CheckKey::simple("catalog", "key123", "GetItem")
    }

    #[test]
    fn test_lookup_miss_on_empty() {
        let (cache, _) = cache();
        assert!(cache.lookup(&key()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_never_served_at_or_after_ttl() {
        let (cache, clock) = cache();
        cache.store(
            key(),
            CacheEntry::new(CheckDecision::allow(), clock.now(), Duration::from_secs(5)),
        );

        clock.advance(Duration::from_millis(4999));
        let (decision, left) = cache.lookup(&key()).unwrap();
        assert!(decision.is_allowed());
        assert_eq!(left, Duration::from_millis(1));

        clock.advance(Duration::from_millis(1));
        assert!(cache.lookup(&key()).is_none());
        // Lazy expiry keeps the stale entry stored.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_ttl_is_never_served() {
        let (cache, clock) = cache();
        cache.store(
            key(),
            CacheEntry::new(CheckDecision::allow(), clock.now(), Duration::ZERO),
        );
        assert!(cache.lookup(&key()).is_none());
    }

    #[test]
    fn test_older_completion_does_not_overwrite_newer() {
        let (cache, clock) = cache();
        let early = clock.now();
        clock.advance(Duration::from_secs(1));
        let late = clock.now();

        let deny = CheckDecision::deny(DenialReason::PermissionDenied("revoked".to_string()));
        assert!(cache.store(key(), CacheEntry::new(deny.clone(), late, Duration::from_secs(5))));
        assert!(!cache.store(
            key(),
            CacheEntry::new(CheckDecision::allow(), early, Duration::from_secs(5))
        ));

        let (decision, _) = cache.lookup(&key()).unwrap();
        assert_eq!(decision, deny);
    }

    #[test]
    fn test_newer_completion_overwrites() {
        let (cache, clock) = cache();
        let first = clock.now();
        cache.store(
            key(),
            CacheEntry::new(CheckDecision::allow(), first, Duration::from_secs(5)),
        );

        clock.advance(Duration::from_secs(1));
        let deny = CheckDecision::deny(DenialReason::PermissionDenied("revoked".to_string()));
        assert!(cache.store(key(), CacheEntry::new(deny.clone(), clock.now(), Duration::from_secs(5))));
        assert_eq!(cache.lookup(&key()).unwrap().0, deny);
    }

    #[test]
    fn test_invalidate() {
        let (cache, clock) = cache();
        cache.store(
            key(),
            CacheEntry::new(CheckDecision::allow(), clock.now(), Duration::from_secs(5)),
        );
        assert!(cache.invalidate(&key()));
        assert!(!cache.invalidate(&key()));
        assert!(cache.lookup(&key()).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = cache();
        let now = clock.now();
        cache.store(
            CheckKey::simple("catalog", "a", "GetItem"),
            CacheEntry::new(CheckDecision::allow(), now, Duration::from_secs(1)),
        );
        cache.store(
            CheckKey::simple("catalog", "b", "GetItem"),
            CacheEntry::new(CheckDecision::allow(), now, Duration::from_secs(10)),
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache
            .lookup(&CheckKey::simple("catalog", "b", "GetItem"))
            .is_some());
    }

    #[test]
    fn test_keys_with_different_quotas_do_not_share_entries() {
        use crate::domain::key::QuotaRequest;

        let (cache, clock) = cache();
        let one = CheckKey::new("catalog", "key123", "GetItem", &[QuotaRequest::new("reads", 1)]);
        let five = CheckKey::new("catalog", "key123", "GetItem", &[QuotaRequest::new("reads", 5)]);
        cache.store(
            one.clone(),
            CacheEntry::new(CheckDecision::allow(), clock.now(), Duration::from_secs(5)),
        );

        assert!(cache.lookup(&one).is_some());
        assert!(cache.lookup(&five).is_none());
    }
}
