use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::guard::DEFAULT_DELAY;

/// Time gate for synchronous handlers.
///
/// A call is accepted when no call was accepted yet, or when at least
/// `delay` has passed since the last accepted one. Rejected calls do not
/// move the window.
pub struct DebounceGuard<F> {
    f: F,
    delay: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl<F> DebounceGuard<F> {
    pub fn new(f: F, delay: Duration) -> Self {
        Self {
            f,
            delay,
            last_accepted: Mutex::new(None),
        }
    }

    pub fn with_default_delay(f: F) -> Self {
        Self::new(f, DEFAULT_DELAY)
    }

    /// Returns `None` when the call falls inside the window.
    pub fn call<A, R>(&self, args: A) -> Option<R>
    where
        F: Fn(A) -> R,
    {
        if !self.try_accept(Instant::now()) {
            debug!("Dropped call inside debounce window");
            return None;
        }
        Some((self.f)(args))
    }

    fn try_accept(&self, now: Instant) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.delay => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
