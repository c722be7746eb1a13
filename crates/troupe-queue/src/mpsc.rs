//! Multi-producer, single-consumer linked queue with wait-free producers.
//!
//! The design follows Dmitry Vyukov's non-intrusive MPSC node queue:
//! enqueue is one atomic swap of `head` plus one release store that links
//! the previous head forward. Because the swap linearizes producers, only
//! the swapping producer ever writes the previous head's `next`, so no CAS
//! is needed on the hot path.
//!
//! ## Inconsistent states
//!
//! A consumer that runs between a producer's head swap and its link store
//! sees `tail.next == null` while `head != tail`. That window is bounded by
//! the single pending release store, so the consumer reports
//! [`TryPopError::Inconsistent`] and retries rather than treating the queue
//! as empty.
//!
//! ## Consumer exclusivity
//!
//! Advancing `tail` frees the node it leaves behind, so only one thread may
//! consume at a time. The `consumer` flag makes that exclusivity explicit:
//! stealing workers contest it with a CAS and back off on
//! [`TryPopError::Busy`]. This is what keeps cross-lane stealing sound
//! without a garbage collector: a consumer can only free a node it has
//! advanced past, and it can only advance past a node whose link store has
//! already landed.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::node::Node;

/// Errors returned by [`MpscQueue::try_pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryPopError {
    /// The queue holds no values.
    Empty,
    /// A producer has swapped the head but not yet linked its node; the
    /// value will be reachable after at most one release store.
    Inconsistent,
    /// Another thread currently holds the consumer side.
    Busy,
}

/// Multi-producer, single-consumer queue of heap-allocated [`Node`]s.
///
/// `head` is the most recently enqueued node and `tail` the oldest (the
/// already-consumed sentinel). Head and tail live on separate cache lines
/// so producer swaps do not bounce the consumer's line.
pub struct MpscQueue<T> {
    /// Most recently enqueued node. Swapped by producers.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// The consumed sentinel; the chain `tail.next ..= head` holds exactly
    /// the unread values. Advanced only by the thread holding `consumer`.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Single-consumer guard contested by stealing workers.
    consumer: CachePadded<AtomicBool>,
}

// Safety: nodes are only dereferenced under the ownership discipline
// described in the module docs; payloads cross threads by move.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    /// Create an empty queue (head and tail share a sentinel).
    pub fn new() -> Self {
        let stub = Node::alloc_stub();
        MpscQueue {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
            consumer: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a value. Wait-free: one XCHG and one release store.
    pub fn push(&self, value: T) {
        let node = Node::alloc(value);
        let prev = self.head.swap(node, Ordering::AcqRel);
        // The head swap made this producer the unique writer of prev.next.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Attempt to dequeue without blocking.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        if self
            .consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TryPopError::Busy);
        }
        // Safety: the consumer flag grants exclusive tail access.
        let res = unsafe { self.pop_exclusive() };
        self.consumer.store(false, Ordering::Release);
        res
    }

    /// Dequeue, spinning through transient `Busy`/`Inconsistent` states.
    ///
    /// Returns `None` only when the queue is observed empty.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            match self.try_pop() {
                Ok(value) => return Some(value),
                Err(TryPopError::Empty) => return None,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Whether the queue is observed empty. Pointer comparison only; never
    /// dereferences, so it is safe to call from any thread.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Detach and return every value enqueued before the walk started, in
    /// FIFO order.
    ///
    /// Takes the consumer side for the whole walk (spinning out any
    /// concurrent consumer), and spin-waits through in-flight link stores
    /// so a mid-enqueue producer cannot truncate the result.
    pub fn drain(&self) -> Vec<T> {
        let backoff = Backoff::new();
        while self
            .consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            backoff.snooze();
        }

        let mut out = Vec::new();
        unsafe {
            let mut tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            while tail != head {
                let mut next = (*tail).next.load(Ordering::Acquire);
                let spin = Backoff::new();
                while next.is_null() {
                    // Bounded by the racing producer's single link store.
                    spin.spin();
                    next = (*tail).next.load(Ordering::Acquire);
                }
                let value = (*next).value.take().expect("chain node carries a value");
                out.push(value);
                self.tail.store(next, Ordering::Release);
                drop(Box::from_raw(tail));
                tail = next;
            }
        }

        self.consumer.store(false, Ordering::Release);
        out
    }

    /// Dequeue with the consumer side already held.
    ///
    /// # Safety
    ///
    /// The caller must hold the `consumer` flag.
    unsafe fn pop_exclusive(&self) -> Result<T, TryPopError> {
        let tail = self.tail.load(Ordering::Acquire);
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return if self.head.load(Ordering::Acquire) == tail {
                Err(TryPopError::Empty)
            } else {
                Err(TryPopError::Inconsistent)
            };
        }
        let value = unsafe { (*next).value.take() }.expect("chain node carries a value");
        self.tail.store(next, Ordering::Release);
        // The old sentinel is unreachable: producers only touch the node
        // they swapped out, and its link store already landed.
        drop(unsafe { Box::from_raw(tail) });
        Ok(value)
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // &mut self: no other thread can touch the queue.
        let mut curr = *self.tail.get_mut();
        while !curr.is_null() {
            let mut node = unsafe { Box::from_raw(curr) };
            curr = *node.next.get_mut();
        }
    }
}

impl<T> std::fmt::Debug for MpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpscQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
