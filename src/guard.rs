use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::identity::signature;

/// Cooldown kept after a guarded call settles unless told otherwise
pub const DEFAULT_DELAY: Duration = Duration::from_millis(300);

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `release` after `delay` on the current tokio runtime.
///
/// Returns the timer so the caller can abort it, or `None` when `release`
/// already ran because there is nothing to wait for.
fn schedule_release<R>(delay: Duration, release: R) -> Option<JoinHandle<()>>
where
    R: FnOnce() + Send + 'static,
{
    if delay.is_zero() {
        release();
        return None;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            release();
        })),
        Err(_) => {
            debug!("No runtime to time the cooldown, releasing immediately");
            release();
            None
        }
    }
}

struct Busy {
    engaged: bool,
    timer: Option<JoinHandle<()>>,
}

/// Starts the cooldown of a [`CooldownGuard`] call when dropped.
///
/// Lives across the wrapped call so that an error, a panic or the caller
/// giving up all count as settlement.
struct BusyRelease {
    state: Weak<Mutex<Busy>>,
    delay: Duration,
}

impl Drop for BusyRelease {
    fn drop(&mut self) {
        let state = self.state.clone();
        let timer = schedule_release(self.delay, move || {
            if let Some(state) = state.upgrade() {
                let mut busy = lock(&state);
                busy.engaged = false;
                busy.timer = None;
                debug!("Cooldown guard released");
            }
        });

        if let (Some(timer), Some(state)) = (timer, self.state.upgrade()) {
            let mut busy = lock(&state);
            if let Some(previous) = busy.timer.replace(timer) {
                previous.abort();
            }
        }
    }
}

/// Drops calls while a previous call is running or cooling down.
///
/// The guard stays engaged until `delay` has passed since the last accepted
/// call settled, which absorbs trailing duplicates such as a double click
/// that lands after the first request already returned.
pub struct CooldownGuard<F> {
    f: F,
    delay: Duration,
    state: Arc<Mutex<Busy>>,
}

impl<F> CooldownGuard<F> {
    pub fn new(f: F, delay: Duration) -> Self {
        Self {
            f,
            delay,
            state: Arc::new(Mutex::new(Busy {
                engaged: false,
                timer: None,
            })),
        }
    }

    pub fn with_default_delay(f: F) -> Self {
        Self::new(f, DEFAULT_DELAY)
    }

    pub fn is_engaged(&self) -> bool {
        lock(&self.state).engaged
    }

    /// Calls the wrapped function unless the guard is engaged.
    ///
    /// Returns `None` for a dropped call; a call that ran is always `Some`,
    /// even when the function itself returns `()` or `None`.
    pub async fn call<A, Fut>(&self, args: A) -> Option<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        {
            let mut busy = lock(&self.state);
            if busy.engaged {
                debug!("Dropped call, cooldown guard engaged");
                return None;
            }
            busy.engaged = true;
            if let Some(timer) = busy.timer.take() {
                timer.abort();
            }
        }

        let _release = BusyRelease {
            state: Arc::downgrade(&self.state),
            delay: self.delay,
        };
        Some((self.f)(args).await)
    }
}

impl<F> Drop for CooldownGuard<F> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

/// Signatures currently running or cooling down, with their release timers
type Guarded = HashMap<String, Option<JoinHandle<()>>>;

struct SignatureRelease {
    state: Weak<Mutex<Guarded>>,
    signature: String,
    delay: Duration,
}

impl Drop for SignatureRelease {
    fn drop(&mut self) {
        let state = self.state.clone();
        let signature = self.signature.clone();
        let timer = schedule_release(self.delay, move || {
            if let Some(state) = state.upgrade() {
                lock(&state).remove(&signature);
                debug!(signature = %signature, "Signature guard released");
            }
        });

        if let (Some(timer), Some(state)) = (timer, self.state.upgrade()) {
            let mut guarded = lock(&state);
            match guarded.get_mut(&self.signature) {
                Some(slot) => {
                    if let Some(previous) = slot.replace(timer) {
                        previous.abort();
                    }
                }
                // Released already; nothing left to cancel later.
                None => drop(timer),
            }
        }
    }
}

/// Per-argument variant of [`CooldownGuard`].
///
/// Calls are keyed by the JSON [`signature`] of their arguments. Calls with
/// different signatures run independently; a call whose signature is still
/// running or cooling down is dropped.
pub struct SignatureGuard<F> {
    f: F,
    delay: Duration,
    state: Arc<Mutex<Guarded>>,
}

impl<F> SignatureGuard<F> {
    pub fn new(f: F, delay: Duration) -> Self {
        Self {
            f,
            delay,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_default_delay(f: F) -> Self {
        Self::new(f, DEFAULT_DELAY)
    }

    pub fn guarded_count(&self) -> usize {
        lock(&self.state).len()
    }

    /// Calls the wrapped function unless the same arguments are guarded.
    ///
    /// `Ok(None)` is a dropped call. Errors only come from serializing the
    /// arguments, in which case the function is not called.
    pub async fn call<A, Fut>(&self, args: A) -> Result<Option<Fut::Output>>
    where
        A: Serialize,
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        let signature = signature(&args)?;
        {
            let mut guarded = lock(&self.state);
            if guarded.contains_key(&signature) {
                debug!(signature = %signature, "Dropped call, signature guarded");
                return Ok(None);
            }
            guarded.insert(signature.clone(), None);
        }

        let _release = SignatureRelease {
            state: Arc::downgrade(&self.state),
            signature,
            delay: self.delay,
        };
        Ok(Some((self.f)(args).await))
    }
}

impl<F> Drop for SignatureGuard<F> {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.state).drain() {
            if let Some(timer) = timer {
                timer.abort();
            }
        }
    }
}
