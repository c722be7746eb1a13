//! Lane-sharded task queue: an array of MPSC lanes keyed by producer
//! thread, with consumers stealing across lanes.
//!
//! A single MPSC queue under N producers contends on one head pointer.
//! Sharding by a stable per-thread token cuts that contention to roughly
//! N/L while keeping per-producer FIFO (a given thread always lands in the
//! same lane). Global FIFO across lanes is deliberately given up.

use crossbeam_utils::Backoff;

use crate::mpsc::{MpscQueue, TryPopError};

/// An array of `L` MPSC lanes, `L = floor_pow2(min(pool_size, CPUs))`.
pub struct MultiLaneQueue<T> {
    lanes: Box<[MpscQueue<T>]>,
    mask: usize,
}

impl<T> MultiLaneQueue<T> {
    /// Create a lane array sized for a pool of `pool_size` workers.
    ///
    /// Panics if `pool_size` is zero.
    pub fn new(pool_size: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be positive");
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let count = floor_pow2(pool_size.min(cpus));
        let lanes: Box<[MpscQueue<T>]> = (0..count).map(|_| MpscQueue::new()).collect();
        MultiLaneQueue {
            lanes,
            mask: count - 1,
        }
    }

    /// Number of lanes (a power of two).
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Enqueue into the producer's lane, `token & mask`.
    pub fn push(&self, token: usize, value: T) {
        self.lanes[token & self.mask].push(value);
    }

    /// Dequeue starting at the caller's own lane, then probing the others
    /// by XOR offset.
    ///
    /// A lane caught mid-enqueue gets a short bounded spin before the sweep
    /// moves on; a lane whose consumer side is busy is skipped immediately.
    /// Returns `None` after a full empty sweep. A subsequent poll restarts
    /// at the caller's own lane, which is what keeps a stealing worker
    /// local once its own lane refills.
    pub fn poll(&self, token: usize) -> Option<T> {
        let base = token & self.mask;
        for offset in 0..self.lanes.len() {
            let lane = &self.lanes[base ^ offset];
            let backoff = Backoff::new();
            loop {
                match lane.try_pop() {
                    Ok(value) => return Some(value),
                    Err(TryPopError::Inconsistent) if !backoff.is_completed() => {
                        backoff.spin();
                    }
                    Err(_) => break,
                }
            }
        }
        None
    }

    /// Whether every lane is observed empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_empty())
    }
}

impl<T> std::fmt::Debug for MultiLaneQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLaneQueue")
            .field("lanes", &self.lanes.len())
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

/// Largest power of two less than or equal to `n`.
fn floor_pow2(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
