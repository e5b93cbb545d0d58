//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::remote::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, RemoteError,
    ReportRequest,
};
use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

/// Port for obtaining current time.
///
/// This abstraction allows the application layer to work with time
/// without depending on system clock implementation details.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Port for the remote service control backend.
///
/// Implementations own credentials, wire encoding and transport. Calls may
/// fail and may be cancelled by dropping the returned future. A single
/// client is shared by every task, so implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait RemoteServiceClient: Send + Sync + Debug {
    /// Ask whether a consumer may invoke an operation.
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, RemoteError>;

    /// Reserve quota for a consumer.
    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, RemoteError>;

    /// Submit a batch of aggregated metrics.
    async fn report(&self, request: ReportRequest) -> Result<(), RemoteError>;
}

/// Port for concurrent key-value storage.
///
/// This abstraction allows the application layer to store and retrieve values
/// without depending on specific concurrent data structure implementations.
/// Infrastructure provides concrete implementations (ShardedStorage).
///
/// Every operation on a single key is atomic with respect to other
/// operations on that key. Operations on different keys do not serialize
/// against each other beyond what the implementation's sharding requires.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    ///
    /// # Returns
    /// The result from the accessor function
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Read an existing entry without creating it.
    fn with_entry<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&V) -> R;

    /// Insert `value` unless an existing entry is preferred over it.
    ///
    /// `replace` receives the existing value and the candidate and returns
    /// whether the candidate should win. Returns true if `value` was stored.
    fn upsert_if<F>(&self, key: K, value: V, replace: F) -> bool
    where
        F: FnOnce(&V, &V) -> bool;

    /// Remove an entry and return its value.
    fn remove(&self, key: &K) -> Option<V>;

    /// Remove every entry and return them.
    ///
    /// Each removal is atomic per key; entries created concurrently with
    /// the drain are either returned or left for the next drain, never both.
    fn drain(&self) -> Vec<(K, V)>;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}
