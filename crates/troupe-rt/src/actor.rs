//! Lock-free actor mailboxes.
//!
//! ## Protocol
//!
//! An actor is a chain of [`CountedNode`]s hanging off a single atomic
//! `head` pointer (most recent node; null while idle) plus a handler. The
//! head is the linearization point for everything:
//!
//! - `send` swaps the head with the new node. A producer that swapped out
//!   null found the actor idle and takes responsibility for scheduling the
//!   dispatch; any other producer release-stores the forward link of the
//!   node it swapped out and relies on the running dispatcher to follow it.
//! - The dispatcher walks the chain, invoking the handler once per node.
//!   At a null forward link it tries to park with `CAS(head, node, null)`.
//!   Success means no producer raced; the actor is idle again. Failure
//!   means a producer swapped the head after us and did NOT schedule (it
//!   saw our node, not null), so the dispatcher spins for the forward
//!   link, which is at most one release store away, and keeps going.
//!
//! This gives at most one dispatcher per actor at any time, which is the
//! exclusivity that makes the `UnsafeCell` around the handler sound, and
//! it is why a plain `FnMut` can accumulate state across invocations even
//! when consecutive dispatch closures land on different worker threads:
//! every hand-off goes through a release/acquire edge (the executor queue,
//! and for bounded actors the `processed` counter stored between handler
//! invocations).
//!
//! Yielding is explicit re-submission of the dispatch closure to the
//! strategy after `batch` messages, never a coroutine and never recursion.

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use troupe_queue::node::CountedNode;

use crate::pool::{ErrorHook, Panic};
use crate::strategy::Strategy;

/// Hook receiving each message a bounded actor rejects.
pub type OverflowHook<A> = Arc<dyn Fn(A) + Send + Sync>;

/// A cheaply cloneable handle to an actor mailbox.
///
/// All clones feed the same handler through the same queue.
pub struct Actor<A, H>
where
    A: Send + 'static,
    H: FnMut(A) + Send + 'static,
{
    core: Arc<Core<A, H>>,
}

impl<A, H> Clone for Actor<A, H>
where
    A: Send + 'static,
    H: FnMut(A) + Send + 'static,
{
    fn clone(&self) -> Self {
        Actor {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A, H> Actor<A, H>
where
    A: Send + 'static,
    H: FnMut(A) + Send + 'static,
{
    /// An actor that accepts every message.
    ///
    /// Handler panics are caught and forwarded to `on_error`; dispatch
    /// continues with the next message.
    pub fn unbounded(
        strategy: Strategy,
        handler: H,
        on_error: impl Fn(Panic) + Send + Sync + 'static,
    ) -> Self {
        Self::with_core(strategy, 0, handler, Arc::new(on_error), None)
    }

    /// An actor admitting at most `bound` unhandled messages, the one
    /// currently in the handler included. Rejected messages go to
    /// `on_overflow` and are dropped; the actor's state is unchanged.
    ///
    /// Panics if `bound` is zero.
    pub fn bounded(
        strategy: Strategy,
        bound: usize,
        handler: H,
        on_error: impl Fn(Panic) + Send + Sync + 'static,
        on_overflow: impl Fn(A) + Send + Sync + 'static,
    ) -> Self {
        assert!(bound > 0, "actor bound must be positive");
        Self::with_core(
            strategy,
            bound as u64,
            handler,
            Arc::new(on_error),
            Some(Arc::new(on_overflow) as OverflowHook<A>),
        )
    }

    fn with_core(
        strategy: Strategy,
        bound: u64,
        handler: H,
        on_error: ErrorHook,
        on_overflow: Option<OverflowHook<A>>,
    ) -> Self {
        Actor {
            core: Arc::new(Core {
                head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
                sent: CachePadded::new(AtomicU64::new(0)),
                processed: CachePadded::new(AtomicU64::new(0)),
                bound,
                handler: UnsafeCell::new(handler),
                on_error,
                on_overflow,
                strategy,
            }),
        }
    }

    /// Enqueue a message and, if the actor was idle, schedule its dispatch.
    pub fn send(&self, message: A) {
        if self.core.bound == 0 {
            self.core.send_unbounded(message);
        } else {
            self.core.send_bounded(message);
        }
    }

    /// Whether no dispatch is currently scheduled or running.
    pub fn is_idle(&self) -> bool {
        self.core.head.load(Ordering::Acquire).is_null()
    }

    /// Derive an actor accepting `B` by forwarding `f(b)` to this one.
    ///
    /// The wrapper is a full actor on the same strategy; the original's
    /// bound (and overflow hook) still applies at the forwarding hop.
    pub fn contramap<B, F>(&self, f: F) -> Actor<B, impl FnMut(B) + Send + 'static>
    where
        B: Send + 'static,
        F: Fn(B) -> A + Send + 'static,
    {
        let target = self.clone();
        let on_error = Arc::clone(&self.core.on_error);
        Actor::unbounded(
            self.core.strategy.clone(),
            move |b: B| target.send(f(b)),
            move |panic| on_error(panic),
        )
    }
}

impl<A, H> fmt::Debug for Actor<A, H>
where
    A: Send + 'static,
    H: FnMut(A) + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("bound", &self.core.bound)
            .field("idle", &self.is_idle())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct Core<A, H> {
    /// Most recently enqueued node; null while the actor is idle.
    head: CachePadded<AtomicPtr<CountedNode<A>>>,
    /// Sequence of the most recently admitted message (bounded only).
    sent: CachePadded<AtomicU64>,
    /// Sequence of the most recently handled message, release-stored
    /// between handler invocations (bounded only).
    processed: CachePadded<AtomicU64>,
    /// Admission bound; zero means unbounded.
    bound: u64,
    handler: UnsafeCell<H>,
    on_error: ErrorHook,
    on_overflow: Option<OverflowHook<A>>,
    strategy: Strategy,
}

// Safety: the handler cell is only touched by the single dispatcher the
// head protocol admits (a chain is claimed either by the producer that
// installed it onto a null head or by the dispatcher already draining it),
// and every dispatcher hand-off is a release/acquire edge. Messages and
// the handler itself are Send.
unsafe impl<A: Send, H: FnMut(A) + Send> Send for Core<A, H> {}
unsafe impl<A: Send, H: FnMut(A) + Send> Sync for Core<A, H> {}

/// Chain pointer smuggled into a dispatch closure.
struct NodePtr<A>(*mut CountedNode<A>);

// Safety: the pointed-to chain is owned by exactly one dispatch closure at
// a time; the runtime hands it off through executor queues.
unsafe impl<A: Send> Send for NodePtr<A> {}

impl<A, H> Core<A, H>
where
    A: Send + 'static,
    H: FnMut(A) + Send + 'static,
{
    fn send_unbounded(self: &Arc<Self>, message: A) {
        self.publish(CountedNode::alloc(message, 0));
    }

    fn send_bounded(self: &Arc<Self>, message: A) {
        // Reserve a sequence slot or reject. Reservations serialize
        // through the CAS, so admitted-but-unhandled messages never exceed
        // the bound; a stale (smaller) processed read only makes the test
        // stricter.
        let mut seq = self.sent.load(Ordering::Relaxed);
        loop {
            if seq.wrapping_sub(self.processed.load(Ordering::Acquire)) >= self.bound {
                if let Some(on_overflow) = &self.on_overflow {
                    on_overflow(message);
                }
                return;
            }
            match self
                .sent
                .compare_exchange_weak(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => seq = current,
            }
        }
        self.publish(CountedNode::alloc(message, seq + 1));
    }

    /// Two-phase publish: the head swap linearizes all producers.
    fn publish(self: &Arc<Self>, node: *mut CountedNode<A>) {
        let prev = self.head.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            // The actor was idle; scheduling is on us.
            self.schedule(node);
        } else {
            // The dispatcher draining `prev` will follow this link.
            unsafe { (*prev).next.store(node, Ordering::Release) };
        }
    }

    /// Hand the chain at `node` to the strategy: inline for sequential,
    /// or as a boxed closure on the executor.
    fn schedule(self: &Arc<Self>, node: *mut CountedNode<A>) {
        let quota = self.strategy.batch();
        let core = Arc::clone(self);
        let node = NodePtr(node);
        self.strategy.submit(move || {
            let node = node;
            core.dispatch(node.0, quota)
        });
    }

    /// Drain the chain starting at `node`, invoking the handler once per
    /// message, for at most `quota` messages before yielding.
    ///
    /// At most one thread runs this per actor at any time.
    fn dispatch(self: &Arc<Self>, node: *mut CountedNode<A>, quota: usize) {
        let mut node = node;
        let mut quota = quota;
        loop {
            let message =
                unsafe { (*node).value.take() }.expect("actor node carries a message");
            // Safety: dispatcher exclusivity (see module docs).
            let handler = self.handler.get();
            if let Err(panic) =
                panic::catch_unwind(AssertUnwindSafe(|| unsafe { (*handler)(message) }))
            {
                (self.on_error)(panic);
            }
            if self.bound > 0 {
                // Opens admission and republishes handler effects; pairs
                // with the Acquire in send_bounded and in the next
                // dispatcher's first load.
                self.processed
                    .store(unsafe { (*node).count }, Ordering::Release);
            }

            let mut next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Park: succeeds only if no producer swapped the head
                // after our node.
                if self
                    .head
                    .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    unsafe { drop(Box::from_raw(node)) };
                    return;
                }
                // A producer won the race and did not schedule; its link
                // store is at most one release away.
                let backoff = Backoff::new();
                loop {
                    next = unsafe { (*node).next.load(Ordering::Acquire) };
                    if !next.is_null() {
                        break;
                    }
                    backoff.spin();
                }
            }
            unsafe { drop(Box::from_raw(node)) };
            node = next;

            quota -= 1;
            if quota == 0 {
                // Yield the worker; the strategy picks the chain back up.
                self.schedule(node);
                return;
            }
        }
    }
}

// A chain handed to an executor that discards it (shutdown_now) is leaked,
// not freed: a racing producer may still be linking into it, exactly as in
// the original GC-reliant design. Core itself therefore has no Drop.

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
