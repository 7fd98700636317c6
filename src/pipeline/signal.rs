use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cooperative run flag shared between a worker and whoever stops it.
///
/// Workers sleep through `wait_timeout`, which returns early once the signal is
/// cleared, so a stop request never waits out a full sleep interval.
#[derive(Clone, Debug)]
pub struct RunSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl RunSignal {
    /// A signal in the running state.
    pub fn running() -> Self {
        Self {
            inner: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|running| *running).unwrap_or(false)
    }

    /// Clear the flag and wake any waiter.
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        match lock.lock() {
            Ok(mut running) => *running = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
        cvar.notify_all();
    }

    /// Sleep for up to `timeout`. Returns `true` if still running afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let Ok(mut running) = lock.lock() else {
            return false;
        };
        while *running {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match cvar.wait_timeout(running, deadline - now) {
                Ok((guard, _)) => running = guard,
                Err(_) => return false,
            }
        }
        *running
    }
}
