//! Lock-free node queues underpinning the troupe runtime.
//!
//! Everything here is built from one primitive: a heap-allocated
//! single-link node whose payload slot is emptied on consumption
//! ([`node`]). On top of it sit three queue layouts:
//!
//! - [`MpscQueue`]: multi-producer/single-consumer queue with wait-free
//!   producers (one XCHG plus one release store per enqueue) and an
//!   explicit consumer flag so workers can contest the consumer side.
//! - [`MultiLaneQueue`]: an array of MPSC lanes keyed by a stable
//!   per-producer token, with consumers stealing across lanes. Trades
//!   global FIFO for head-pointer contention relief.
//! - [`BoundedMailbox`]: counted-node MPSC mailbox with an exact
//!   count-difference admission test, usable as a drop-in mailbox by an
//!   external actor framework.

pub mod bounded;
pub mod mpsc;
pub mod multilane;
pub mod node;

pub use bounded::{BoundedMailbox, MailboxFull};
pub use mpsc::{MpscQueue, TryPopError};
pub use multilane::MultiLaneQueue;
