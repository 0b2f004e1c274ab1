use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

const SIGNALED: u8 = 0b01;
const CONTENDED: u8 = 0b10;

/// A one-shot latch.
///
/// A `Fence` starts out unsignaled. Any number of threads or pool tasks can
/// block in [`wait`](Self::wait) until some other party calls
/// [`signal`](Self::signal). Signals are idempotent and happen-before the
/// return of every `wait` that observes them.
///
/// Unlike a `std::sync::Once`-style latch, a fence can be [`reset`](Self::reset)
/// and reused, but only while nobody is waiting on it.
pub struct Fence {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Fence {
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the fence is signaled.
    ///
    /// Returns immediately when the fence is already signaled.
    pub fn wait(&self) {
        if self.state.load(Ordering::Acquire) & SIGNALED != 0 {
            return;
        }
        let mut guard = self.lock.lock();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SIGNALED != 0 {
                return;
            }
            if state & CONTENDED == 0
                && self
                    .state
                    .compare_exchange(state, state | CONTENDED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                // raced with a signal or another waiter, re-inspect
                continue;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    ///
    /// Returns `true` when the fence was signaled.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        if self.state.load(Ordering::Acquire) & SIGNALED != 0 {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SIGNALED != 0 {
                return true;
            }
            if state & CONTENDED == 0
                && self
                    .state
                    .compare_exchange(state, state | CONTENDED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                continue;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.is_signaled();
            }
        }
    }

    /// Signals the fence, waking all current waiters. Idempotent.
    pub fn signal(&self) {
        let prev = self.state.swap(SIGNALED, Ordering::AcqRel);
        if prev & CONTENDED != 0 {
            // the lock closes the gap between a waiter installing CONTENDED
            // and entering the condition wait
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Clears the signaled state so the fence can be waited on again.
    ///
    /// # Panics
    ///
    /// Panics when waiters are still being woken from a previous signal.
    /// Resetting a fence that has active waiters is a program error; the
    /// waiters would miss the signal they were woken for.
    pub fn reset(&self) {
        let prev = self.state.swap(0, Ordering::AcqRel);
        assert_ne!(
            prev,
            SIGNALED | CONTENDED,
            "fence reset while waiters are still being woken"
        );
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) & SIGNALED != 0
    }
}

impl Default for Fence {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
