//! Bounded MPSC mailbox with a count-difference admission test.
//!
//! Drop-in message queue for an external actor framework: producers enqueue
//! from any thread, the owning dispatcher dequeues, and `clean_up` routes
//! leftovers to a dead-letter sink.
//!
//! Every node carries the sequence number assigned at admission. Producers
//! reserve a sequence slot through a CAS on the `pushed` counter before
//! publishing, checked against the consumer's release-stored `popped`;
//! reservations serialize through the CAS, so the number of admitted but
//! unconsumed messages can never exceed the bound. (The original design
//! read the sequence straight off the head node, which is only sound under
//! a garbage collector; the counters are the manual-memory rendition and
//! preserve `number_of_messages = head.count - tail.count` exactly.)

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::node::CountedNode;

/// Error carrying a message rejected by a full [`BoundedMailbox`].
pub struct MailboxFull<T> {
    message: T,
}

impl<T> MailboxFull<T> {
    fn new(message: T) -> Self {
        MailboxFull { message }
    }

    /// Recover the rejected message.
    pub fn into_message(self) -> T {
        self.message
    }
}

impl<T> fmt::Debug for MailboxFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxFull").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for MailboxFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bounded mailbox is full")
    }
}

impl<T> std::error::Error for MailboxFull<T> {}

/// MPSC mailbox that admits at most `bound` messages at a time.
pub struct BoundedMailbox<T> {
    /// Most recently enqueued node. Swapped by producers.
    head: CachePadded<AtomicPtr<CountedNode<T>>>,
    /// The consumed sentinel. Advanced only under the consumer flag.
    tail: CachePadded<AtomicPtr<CountedNode<T>>>,
    /// Sequence of the most recently admitted message.
    pushed: CachePadded<AtomicU64>,
    /// Sequence of the most recently consumed message.
    popped: CachePadded<AtomicU64>,
    /// Single-consumer guard.
    consumer: CachePadded<AtomicBool>,
    bound: u64,
}

// Safety: same node-ownership discipline as MpscQueue; payloads move.
unsafe impl<T: Send> Send for BoundedMailbox<T> {}
unsafe impl<T: Send> Sync for BoundedMailbox<T> {}

impl<T> BoundedMailbox<T> {
    /// Create a mailbox admitting at most `bound` messages.
    ///
    /// Panics if `bound` is zero.
    pub fn new(bound: usize) -> Self {
        assert!(bound > 0, "mailbox bound must be positive");
        let stub = CountedNode::alloc_stub();
        BoundedMailbox {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
            pushed: CachePadded::new(AtomicU64::new(0)),
            popped: CachePadded::new(AtomicU64::new(0)),
            consumer: CachePadded::new(AtomicBool::new(false)),
            bound: bound as u64,
        }
    }

    /// Enqueue a message, or hand it back inside [`MailboxFull`] when the
    /// bound is reached.
    pub fn enqueue(&self, message: T) -> Result<(), MailboxFull<T>> {
        // Reserve a sequence slot. The admission test may read a stale
        // (smaller) popped value, which only makes it stricter.
        let mut seq = self.pushed.load(Ordering::Relaxed);
        loop {
            if seq.wrapping_sub(self.popped.load(Ordering::Acquire)) >= self.bound {
                return Err(MailboxFull::new(message));
            }
            match self.pushed.compare_exchange_weak(
                seq,
                seq + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => seq = current,
            }
        }

        let node = CountedNode::alloc(message, seq + 1);
        let prev = self.head.swap(node, Ordering::AcqRel);
        unsafe { (*prev).next.store(node, Ordering::Release) };
        Ok(())
    }

    /// Dequeue the oldest message, spinning through transient mid-enqueue
    /// windows. Returns `None` when the mailbox is observed empty.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        while self
            .consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            backoff.snooze();
        }

        let result = unsafe { self.dequeue_exclusive() };
        self.consumer.store(false, Ordering::Release);
        result
    }

    /// Number of messages currently enqueued.
    pub fn number_of_messages(&self) -> u64 {
        // Load popped first so the difference never wraps: pushed can only
        // have grown since.
        let popped = self.popped.load(Ordering::Acquire);
        let pushed = self.pushed.load(Ordering::Acquire);
        pushed - popped
    }

    /// Whether any message is enqueued. Pointer comparison only.
    pub fn has_messages(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }

    /// Drain every message into the dead-letter sink.
    pub fn clean_up(&self, mut dead_letters: impl FnMut(T)) {
        while let Some(message) = self.dequeue() {
            dead_letters(message);
        }
    }

    /// # Safety
    ///
    /// The caller must hold the `consumer` flag.
    unsafe fn dequeue_exclusive(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                if self.head.load(Ordering::Acquire) == tail {
                    return None;
                }
                // Mid-enqueue window; bounded by one release store.
                backoff.spin();
                continue;
            }
            let value = unsafe { (*next).value.take() }.expect("mailbox node carries a message");
            self.popped.store(unsafe { (*next).count }, Ordering::Release);
            self.tail.store(next, Ordering::Release);
            drop(unsafe { Box::from_raw(tail) });
            return Some(value);
        }
    }
}

impl<T> Drop for BoundedMailbox<T> {
    fn drop(&mut self) {
        let mut curr = *self.tail.get_mut();
        while !curr.is_null() {
            let mut node = unsafe { Box::from_raw(curr) };
            curr = *node.next.get_mut();
        }
    }
}

impl<T> fmt::Debug for BoundedMailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedMailbox")
            .field("bound", &self.bound)
            .field("messages", &self.number_of_messages())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
