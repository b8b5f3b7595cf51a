use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// An operation currently running under an identity
struct Pending<T, E> {
    generation: u64,
    flight: Flight<T, E>,
}

struct Registry<T, E> {
    pending: HashMap<String, Pending<T, E>>,
    next_generation: u64,
}

impl<T, E> Default for Registry<T, E> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_generation: 0,
        }
    }
}

fn lock<T, E>(registry: &Mutex<Registry<T, E>>) -> MutexGuard<'_, Registry<T, E>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a flight's registry entry once its operation is done with.
///
/// Dropped at the end of the flight, before the result is handed out, and
/// also on panic or when the flight itself is dropped unfinished.
struct Settle<T, E> {
    registry: Weak<Mutex<Registry<T, E>>>,
    identity: String,
    generation: u64,
}

impl<T, E> Drop for Settle<T, E> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let removed = {
            let mut registry = lock(&registry);
            match registry.pending.get(&self.identity) {
                Some(entry) if entry.generation == self.generation => {
                    registry.pending.remove(&self.identity)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(identity = %self.identity, generation = self.generation, "Flight settled");
        }
    }
}

/// Collapses concurrent calls that share an identity into one execution.
///
/// Only calls that overlap in time are merged. As soon as the operation
/// settles its entry is gone, so the next call runs the operation again and
/// failures are never remembered.
pub struct RequestDeduplicator<T, E> {
    registry: Arc<Mutex<Registry<T, E>>>,
    enabled: AtomicBool,
}

impl<T, E> Default for RequestDeduplicator<T, E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            enabled: AtomicBool::new(true),
        }
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` unless an operation with the same identity is
    /// already in flight, in which case its outcome is shared instead.
    ///
    /// The flight is driven by its own task on the current tokio runtime,
    /// so it settles and leaves the registry even if every caller stops
    /// waiting on it. Outside a runtime it only advances while polled.
    pub async fn execute<F, Fut>(&self, identity: impl Into<String>, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if !self.is_enabled() {
            return operation().await;
        }

        self.join_or_launch(identity.into(), operation).await
    }

    /// Returns the flight registered under `identity`, registering a new
    /// one around `operation` if there is none.
    fn join_or_launch<F, Fut>(&self, identity: String, operation: F) -> Flight<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut registry = lock(&self.registry);
        if let Some(entry) = registry.pending.get(&identity) {
            debug!(
                identity = %identity,
                generation = entry.generation,
                "Merged with in-flight operation"
            );
            return entry.flight.clone();
        }

        let generation = registry.next_generation;
        registry.next_generation += 1;

        let settle = Settle {
            registry: Arc::downgrade(&self.registry),
            identity: identity.clone(),
            generation,
        };
        let flight = async move {
            let _settle = settle;
            operation().await
        }
        .boxed()
        .shared();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(flight.clone().map(drop));
        }

        debug!(identity = %identity, generation, "Started new flight");
        registry.pending.insert(
            identity,
            Pending {
                generation,
                flight: flight.clone(),
            },
        );
        flight
    }

    /// Forgets every in-flight operation.
    ///
    /// Running operations are not cancelled; callers already waiting on them
    /// still get their outcome, but new callers start fresh flights.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut lock(&self.registry).pending);
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cleared in-flight operations");
        }
        // Dropping a flight can run its `Settle`, which takes the lock.
        drop(drained);
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.registry).pending.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Turns merging on or off. Disabling also clears the registry.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::{Barrier, oneshot};

    use super::*;

    type Dedup = RequestDeduplicator<String, String>;

    fn delayed(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    fn gated(
        calls: &Arc<AtomicUsize>,
        gate: oneshot::Receiver<Result<String, String>>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { gate.await.unwrap_or_else(|_| Err("gate dropped".to_string())) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_execution() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let results =
            join_all((0..5).map(|_| dedup.execute("users", delayed(&calls, "alice")))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Ok("alice".to_string()));
        }
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_identities_run_concurrently() {
        let dedup = Dedup::new();
        let barrier = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let op = |name: &'static str| {
            let barrier = Arc::clone(&barrier);
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Both operations must be running at once to pass the barrier.
                barrier.wait().await;
                Ok::<_, String>(name.to_string())
            }
        };

        let (a, b) = tokio::join!(dedup.execute("a", op("a")), dedup.execute("b", op("b")));

        assert_eq!(a, Ok("a".to_string()));
        assert_eq!(b, Ok("b".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_flights_are_not_cached() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        dedup.execute("users", delayed(&calls, "first")).await.unwrap();
        let second = dedup.execute("users", delayed(&calls, "second")).await;

        assert_eq!(second, Ok("second".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let mut first = Box::pin(dedup.execute("users", gated(&calls, rx)));
        let (_unused_tx, unused_rx) = oneshot::channel();
        let mut second = Box::pin(dedup.execute("users", gated(&calls, unused_rx)));
        assert!(futures::poll!(&mut first).is_pending());
        assert!(futures::poll!(&mut second).is_pending());

        tx.send(Err("boom".to_string())).unwrap();
        assert_eq!(first.await, Err("boom".to_string()));
        assert_eq!(second.await, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.pending_count(), 0);

        let (tx, rx) = oneshot::channel();
        tx.send(Ok("recovered".to_string())).unwrap();
        assert_eq!(
            dedup.execute("users", gated(&calls, rx)).await,
            Ok("recovered".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_bypasses_merging() {
        let dedup = Dedup::new();
        dedup.set_enabled(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            dedup.execute("users", delayed(&calls, "a")),
            dedup.execute("users", delayed(&calls, "b"))
        );

        assert_eq!(a, Ok("a".to_string()));
        assert_eq!(b, Ok("b".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_count_tracks_window() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let (_unused_tx, unused_rx) = oneshot::channel();

        let mut first = Box::pin(dedup.execute("GET:/users:{}", gated(&calls, rx)));
        let mut second = Box::pin(dedup.execute("GET:/users:{}", gated(&calls, unused_rx)));
        assert!(futures::poll!(&mut first).is_pending());
        assert!(futures::poll!(&mut second).is_pending());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.pending_count(), 1);

        tx.send(Ok("users".to_string())).unwrap();
        assert_eq!(first.await, Ok("users".to_string()));
        assert_eq!(second.await, Ok("users".to_string()));
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disabling_clears_registry() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let mut first = Box::pin(dedup.execute("users", gated(&calls, rx)));
        assert!(futures::poll!(&mut first).is_pending());
        assert_eq!(dedup.pending_count(), 1);

        dedup.set_enabled(false);
        assert!(!dedup.is_enabled());
        assert_eq!(dedup.pending_count(), 0);

        tx.send(Ok("still delivered".to_string())).unwrap();
        assert_eq!(first.await, Ok("still delivered".to_string()));
    }

    #[tokio::test]
    async fn test_clear_keeps_running_flights_and_protects_newer_entries() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (old_tx, old_rx) = oneshot::channel();
        let (new_tx, new_rx) = oneshot::channel();

        let mut old = Box::pin(dedup.execute("users", gated(&calls, old_rx)));
        assert!(futures::poll!(&mut old).is_pending());

        dedup.clear();
        assert_eq!(dedup.pending_count(), 0);

        let mut new = Box::pin(dedup.execute("users", gated(&calls, new_rx)));
        assert!(futures::poll!(&mut new).is_pending());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.pending_count(), 1);

        old_tx.send(Ok("old".to_string())).unwrap();
        assert_eq!(old.await, Ok("old".to_string()));
        // The stale flight must not evict the newer one.
        assert_eq!(dedup.pending_count(), 1);

        new_tx.send(Ok("new".to_string())).unwrap();
        assert_eq!(new.await, Ok("new".to_string()));
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_flight_settles_without_callers() {
        let dedup = Dedup::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = Box::pin(dedup.execute("GET:/users", delayed(&calls, "stale")));
        assert!(futures::poll!(&mut first).is_pending());
        drop(first);
        assert_eq!(dedup.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(dedup.pending_count(), 0);

        let later = dedup.execute("GET:/users", delayed(&calls, "fresh")).await;
        assert_eq!(later, Ok("fresh".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_task_does_not_cancel_flight() {
        let dedup = Arc::new(Dedup::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let caller = {
            let dedup = Arc::clone(&dedup);
            let op = delayed(&calls, "value");
            tokio::spawn(async move { dedup.execute("users", op).await })
        };
        tokio::task::yield_now().await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.pending_count(), 0);
    }
}
