use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// A monotonically increasing 64-bit counter that can be waited on.
///
/// Waiters pass the counter value they want to see; they are released as
/// soon as the counter reaches (or has already reached) that value. The
/// counter never decreases.
pub struct TimelineSemaphore {
    value: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl TimelineSemaphore {
    #[inline]
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// The current counter value.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_signaled(&self, value: u64) -> bool {
        self.counter() >= value
    }

    /// Blocks until the counter reaches `value`.
    pub fn wait(&self, value: u64) {
        if self.counter() >= value {
            return;
        }
        let mut guard = self.lock.lock();
        while self.value.load(Ordering::Acquire) < value {
            self.cond.wait(&mut guard);
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `true` when the counter reached `value`.
    pub fn wait_timeout(&self, value: u64, timeout: std::time::Duration) -> bool {
        if self.counter() >= value {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.value.load(Ordering::Acquire) < value {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.is_signaled(value);
            }
        }
        true
    }

    /// Advances the counter to `value`, releasing every waiter whose target
    /// is now reached. Waiters with a larger target go back to sleep.
    ///
    /// # Panics
    ///
    /// Panics when `value` does not advance the counter; the counter is
    /// strictly monotonic.
    pub fn signal(&self, value: u64) {
        let _guard = self.lock.lock();
        let current = self.value.load(Ordering::Relaxed);
        assert!(
            value > current,
            "timeline semaphore must advance: counter is {current}, signal requested {value}"
        );
        self.value.store(value, Ordering::Release);
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("counter", &self.counter())
            .finish()
    }
}
