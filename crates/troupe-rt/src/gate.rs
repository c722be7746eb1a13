//! Park gate: the wait/wake primitive between task producers and workers.
//!
//! Producers `release` one permit per submitted task; idle workers consume
//! permits with `try_acquire` and park when none are available. A release
//! wakes at most one parked worker. Spurious wakeups are fine by contract:
//! the worker loop revalidates queue emptiness after every wakeup.

use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Counting permit gate with condvar parking.
pub struct ParkGate {
    /// Outstanding wakeup permits; one per submitted task. Never negative.
    permits: CachePadded<AtomicIsize>,
    /// Number of currently parked workers; doubles as the condvar's mutex.
    waiters: Mutex<usize>,
    wakeup: Condvar,
}

impl ParkGate {
    pub fn new() -> Self {
        ParkGate {
            permits: CachePadded::new(AtomicIsize::new(0)),
            waiters: Mutex::new(0),
            wakeup: Condvar::new(),
        }
    }

    /// Add `n` permits and wake at most one parked worker.
    pub fn release(&self, n: usize) {
        self.permits.fetch_add(n as isize, Ordering::Release);
        // Taking the waiter lock orders this against a parking worker's
        // final permit re-check, closing the lost-wakeup window.
        let waiting = self.waiters.lock();
        if *waiting > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Consume one permit if any are available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.load(Ordering::Acquire);
        while permits > 0 {
            match self.permits.compare_exchange_weak(
                permits,
                permits - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => permits = current,
            }
        }
        false
    }

    /// Whether any permit is currently available.
    pub fn has_permits(&self) -> bool {
        self.permits.load(Ordering::Acquire) > 0
    }

    /// Park until a wakeup arrives, unless `should_park` turns false while
    /// the waiter lock is held. Returns on any notify; callers revalidate.
    pub fn park(&self, should_park: impl Fn() -> bool) {
        let mut waiting = self.waiters.lock();
        // Re-evaluated under the lock: a concurrent release/wake_all either
        // happened before (visible here) or will take the lock and see us.
        if !should_park() {
            return;
        }
        *waiting += 1;
        self.wakeup.wait(&mut waiting);
        *waiting -= 1;
    }

    /// Wake every parked worker. Used by the shutdown paths so parked
    /// workers re-check the pool state.
    pub fn wake_all(&self) {
        let waiting = self.waiters.lock();
        if *waiting > 0 {
            self.wakeup.notify_all();
        }
    }
}

impl Default for ParkGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ParkGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkGate")
            .field("permits", &self.permits.load(Ordering::Relaxed))
            .field("waiters", &*self.waiters.lock())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
