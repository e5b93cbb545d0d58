//! Coalescing of identical in-flight remote exchanges.
//!
//! The first caller for a key becomes the leader and owns a [`Flight`];
//! every caller arriving while that flight is registered gets a [`Waiter`]
//! on the same `watch` channel. No lock is held while the exchange runs: the
//! table only guards registration, waiter counting and removal.
//!
//! A flight lives as long as someone waits on it. When the last waiter is
//! dropped before a value is published, the flight is unregistered and the
//! exchange task attached to it is aborted.

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Table of in-flight exchanges keyed by request identity.
#[derive(Debug)]
pub(crate) struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    flights: DashMap<K, Slot<V>, RandomState>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Slot<V> {
    id: u64,
    rx: watch::Receiver<Option<V>>,
    state: Arc<FlightState>,
}

#[derive(Debug)]
struct FlightState {
    // Only changed while the key's shard is locked.
    waiters: AtomicUsize,
    task: OnceLock<AbortHandle>,
}

/// How a caller takes part in an exchange.
#[derive(Debug)]
pub(crate) enum Role<K, V, R>
where
    K: Eq + Hash + Clone,
{
    /// The recheck produced an answer; nothing was registered.
    Ready(R),
    /// A flight for the key already exists.
    Follower(Waiter<K, V>),
    /// This caller registered a new flight and must complete it.
    Leader(Flight<K, V>, Waiter<K, V>),
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: DashMap::with_hasher(RandomState::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the flight for `key` or register a new one.
    ///
    /// `recheck` runs only when no flight is registered, while the key's
    /// shard is locked. A caller that finds the answer there (for instance a
    /// cache entry written by a flight that just finished) never starts a
    /// second exchange.
    pub(crate) fn join<R>(
        self: &Arc<Self>,
        key: K,
        recheck: impl FnOnce() -> Option<R>,
    ) -> Role<K, V, R> {
        match self.flights.entry(key) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get();
                slot.state.waiters.fetch_add(1, Ordering::AcqRel);
                Role::Follower(Waiter {
                    rx: slot.rx.clone(),
                    key: occupied.key().clone(),
                    id: slot.id,
                    state: Arc::clone(&slot.state),
                    table: Arc::clone(self),
                    settled: false,
                })
            }
            Entry::Vacant(vacant) => {
                if let Some(ready) = recheck() {
                    return Role::Ready(ready);
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                let state = Arc::new(FlightState {
                    waiters: AtomicUsize::new(1),
                    task: OnceLock::new(),
                });
                let key = vacant.key().clone();
                vacant.insert(Slot {
                    id,
                    rx: rx.clone(),
                    state: Arc::clone(&state),
                });
                let waiter = Waiter {
                    rx,
                    key: key.clone(),
                    id,
                    state,
                    table: Arc::clone(self),
                    settled: false,
                };
                Role::Leader(
                    Flight {
                        key,
                        id,
                        tx,
                        table: Arc::clone(self),
                    },
                    waiter,
                )
            }
        }
    }

    /// Number of registered flights.
    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }
}

/// One caller's interest in a flight.
///
/// Dropping it before [`wait`](Waiter::wait) returns withdraws that
/// interest. The last waiter to leave unregisters the flight and aborts
/// its exchange task.
#[derive(Debug)]
pub(crate) struct Waiter<K, V>
where
    K: Eq + Hash + Clone,
{
    rx: watch::Receiver<Option<V>>,
    key: K,
    id: u64,
    state: Arc<FlightState>,
    table: Arc<SingleFlight<K, V>>,
    settled: bool,
}

impl<K, V> Waiter<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Tie the exchange task to this flight. Only the leader calls this.
    pub(crate) fn abort_on_abandon(&self, task: AbortHandle) {
        if self.state.task.set(task).is_err() {
            tracing::debug!("exchange task already attached to flight");
        }
    }

    /// Wait for the flight's value.
    ///
    /// Returns `None` if the leader went away without completing.
    pub(crate) async fn wait(mut self) -> Option<V> {
        let value = self
            .rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        self.settled = true;
        value
    }
}

impl<K, V> Drop for Waiter<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let id = self.id;
        let state = &self.state;
        let removed = self.table.flights.remove_if(&self.key, |_, slot| {
            slot.id == id && state.waiters.fetch_sub(1, Ordering::AcqRel) == 1
        });
        if removed.is_some() {
            if let Some(task) = state.task.get() {
                task.abort();
            }
        }
    }
}

/// Ownership of a registered flight.
///
/// Dropping it unregisters the flight. Dropping it without calling
/// [`Flight::complete`] wakes every waiter with `None`.
#[derive(Debug)]
pub(crate) struct Flight<K, V>
where
    K: Eq + Hash + Clone,
{
    key: K,
    id: u64,
    tx: watch::Sender<Option<V>>,
    table: Arc<SingleFlight<K, V>>,
}

impl<K, V> Flight<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Publish the value to every waiter and unregister.
    pub(crate) fn complete(self, value: V) {
        self.tx.send_replace(Some(value));
    }
}

impl<K, V> Drop for Flight<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        let id = self.id;
        self.table
            .flights
            .remove_if(&self.key, |_, slot| slot.id == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Table = Arc<SingleFlight<&'static str, u32>>;

    fn lead(table: &Table) -> (Flight<&'static str, u32>, Waiter<&'static str, u32>) {
        match table.join("k", || None::<()>) {
            Role::Leader(flight, waiter) => (flight, waiter),
            other => panic!("expected leader, got {:?}", other),
        }
    }

    fn follow(table: &Table) -> Waiter<&'static str, u32> {
        match table.join("k", || None::<()>) {
            Role::Follower(waiter) => waiter,
            other => panic!("expected follower, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_caller_leads_others_follow() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());

        let (leader, leader_waiter) = lead(&table);
        let follower = follow(&table);
        assert_eq!(table.len(), 1);

        leader.complete(7);
        assert_eq!(follower.wait().await, Some(7));
        assert_eq!(leader_waiter.wait().await, Some(7));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_recheck_short_circuits_registration() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        match table.join("k", || Some(3)) {
            Role::Ready(value) => assert_eq!(value, 3),
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_recheck_skipped_when_flight_registered() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let _leader = table.join("k", || None::<()>);

        let role = table.join("k", || -> Option<()> { panic!("recheck must not run") });
        assert!(matches!(role, Role::Follower(_)));
    }

    #[tokio::test]
    async fn test_abandoned_flight_wakes_waiters_with_none() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (flight, waiter) = lead(&table);

        drop(flight);
        assert_eq!(waiter.wait().await, None);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_late_follower_sees_completed_value() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (flight, _leader_waiter) = lead(&table);
        let follower = follow(&table);

        flight.complete(11);
        // Sender is gone but the value was published first.
        assert_eq!(follower.wait().await, Some(11));
    }

    #[tokio::test]
    async fn test_stale_flight_does_not_remove_successor() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (first, first_waiter) = lead(&table);
        // Simulate the entry being replaced by a newer registration.
        table.flights.remove("k");
        let (second, _second_waiter) = lead(&table);

        drop(first);
        drop(first_waiter);
        assert_eq!(table.len(), 1);
        drop(second);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_last_waiter_leaving_aborts_the_task() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (flight, waiter) = lead(&table);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flight.complete(1);
        });
        waiter.abort_on_abandon(task.abort_handle());

        drop(waiter);
        assert_eq!(table.len(), 0);
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_remaining_waiter_keeps_the_task_alive() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (flight, leader_waiter) = lead(&table);
        let follower = follow(&table);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = release_rx.await;
            flight.complete(5);
        });
        leader_waiter.abort_on_abandon(task.abort_handle());

        drop(leader_waiter);
        assert_eq!(table.len(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(follower.wait().await, Some(5));
        task.await.unwrap();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_settled_waiter_drop_is_a_no_op() {
        let table: Arc<SingleFlight<&str, u32>> = Arc::new(SingleFlight::new());
        let (flight, waiter) = lead(&table);
        flight.complete(2);
        assert_eq!(waiter.wait().await, Some(2));

        let (_next, _next_waiter) = lead(&table);
        assert_eq!(table.len(), 1);
    }
}
