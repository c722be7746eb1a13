//! Countdown latch tracking worker terminations.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A saturating countdown latch.
///
/// Each worker counts down exactly once on exit; `await_termination` called
/// from inside a worker counts down an extra time for the caller, which the
/// saturation absorbs.
pub struct TerminationLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl TerminationLatch {
    pub fn new(count: usize) -> Self {
        TerminationLatch {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement the count, saturating at zero. Wakes all waiters when zero
    /// is reached.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn is_zero(&self) -> bool {
        self.count() == 0
    }

    /// Block until the count reaches zero or the timeout elapses. Returns
    /// true iff zero was reached in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.zero.wait_for(&mut count, deadline - now).timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for TerminationLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationLatch")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_down_to_zero() {
        let latch = TerminationLatch::new(3);
        assert_eq!(latch.count(), 3);
        latch.count_down();
        latch.count_down();
        assert!(!latch.is_zero());
        latch.count_down();
        assert!(latch.is_zero());
    }

    #[test]
    fn test_count_down_saturates() {
        let latch = TerminationLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = TerminationLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_released_by_other_thread() {
        let latch = Arc::new(TerminationLatch::new(2));
        let h = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || {
                latch.count_down();
                latch.count_down();
            })
        };
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        h.join().unwrap();
    }
}
