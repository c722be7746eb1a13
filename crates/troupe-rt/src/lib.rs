//! Fixed worker-pool executor and lock-free actor mailboxes.
//!
//! ## Architecture
//!
//! Two coupled primitives, built on the queues in `troupe-queue`:
//!
//! - **Executor** ([`pool`]): a fixed set of eagerly started worker
//!   threads draining a lane-sharded task queue, coordinated through a
//!   counting [`gate::ParkGate`] and wound down by a monotonic
//!   `Running -> Shutdown -> Stop` state machine.
//! - **Actors** ([`actor`]): per-actor message chains hanging off one
//!   atomic head pointer, binding an `FnMut` handler. Dispatch runs
//!   wherever the [`strategy::Strategy`] says (inline, or batched onto
//!   any [`pool::Executor`]) with at most one dispatcher per actor at any
//!   time.
//!
//! Scheduling is preemptive OS threads only; "yielding" is always explicit
//! re-submission of a closure, never a coroutine. All asynchronous faults
//! funnel through injected hooks; the runtime itself never logs a fault and
//! never terminates the process.

pub mod actor;
pub mod gate;
pub mod latch;
pub mod pool;
pub mod strategy;

pub use actor::{Actor, OverflowHook};
pub use gate::ParkGate;
pub use latch::TerminationLatch;
pub use pool::{
    ErrorHook, Executor, FixedPool, Panic, PoolBuilder, RejectHook, SingleLanePool, Task,
    TaskQueue, ThreadPool,
};
pub use strategy::{Strategy, DEFAULT_ACTOR_BATCH};
