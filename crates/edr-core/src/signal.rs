//! Cross-thread signals.
//!
//! [`Shutdown`] is a latch: once triggered it stays triggered and every
//! waiter wakes immediately. [`Wakeup`] is auto-resetting: a raise wakes
//! one wait and is then consumed.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn lock(mutex: &Mutex<bool>) -> MutexGuard<'_, bool> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Latched stop request shared by every long-running thread.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut triggered = lock(flag);
        while !*triggered {
            triggered = cvar
                .wait(triggered)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Sleep up to `timeout`, returning early (with `true`) on trigger.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut triggered = lock(flag);
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            triggered = match cvar.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *triggered
    }
}

/// Auto-resetting wake-up flag.
#[derive(Debug, Clone, Default)]
pub struct Wakeup {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    /// Wait up to `timeout` for a raise. Returns whether one was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut raised = lock(flag);
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            raised = match cvar.wait_timeout(raised, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *raised = false;
        true
    }
}
