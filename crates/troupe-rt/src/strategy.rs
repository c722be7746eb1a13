//! Pluggable "run this closure somewhere" seam between actors and
//! executors.
//!
//! A strategy carries two things: where a dispatch closure runs, and the
//! batch, the maximum consecutive handler invocations before an actor
//! yields its worker. Batching keeps one actor's burst on one thread for
//! locality while bounding how long it can monopolize that thread.

use std::fmt;
use std::sync::Arc;

use crate::pool::{Executor, ThreadPool};

/// Default consecutive handler invocations before a pooled actor yields.
pub const DEFAULT_ACTOR_BATCH: usize = 1024;

/// Where (and how greedily) an actor's dispatch closures run.
#[derive(Clone)]
pub struct Strategy {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    /// Run dispatch inline on the sending thread; the batch is unlimited.
    Sequential,
    /// Submit dispatch to an executor, yielding after `batch` messages.
    Submit { exec: Arc<dyn Executor>, batch: usize },
}

impl Strategy {
    /// Dispatch inline on the caller's thread. The mailbox protocol still
    /// serializes handler invocations, so the actor doubles as a
    /// trampoline.
    pub fn sequential() -> Self {
        Strategy {
            kind: Kind::Sequential,
        }
    }

    /// Dispatch on the lane-stealing [`ThreadPool`] with the default batch.
    pub fn pooled(pool: Arc<ThreadPool>) -> Self {
        Self::executor(pool, DEFAULT_ACTOR_BATCH)
    }

    /// Dispatch on any [`Executor`] with an explicit batch.
    ///
    /// Panics if `batch` is zero.
    pub fn executor(exec: Arc<dyn Executor>, batch: usize) -> Self {
        assert!(batch > 0, "strategy batch must be positive");
        Strategy {
            kind: Kind::Submit { exec, batch },
        }
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self.kind, Kind::Sequential)
    }

    /// Handler invocations before a dispatcher yields.
    pub(crate) fn batch(&self) -> usize {
        match &self.kind {
            Kind::Sequential => usize::MAX,
            Kind::Submit { batch, .. } => *batch,
        }
    }

    /// Run `f` per this strategy: inline, or boxed onto the executor.
    pub(crate) fn submit(&self, f: impl FnOnce() + Send + 'static) {
        match &self.kind {
            Kind::Sequential => f(),
            Kind::Submit { exec, .. } => exec.execute(Box::new(f)),
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Sequential => f.write_str("Strategy::Sequential"),
            Kind::Submit { batch, .. } => {
                f.debug_struct("Strategy::Submit").field("batch", batch).finish()
            }
        }
    }
}
