//! Fixed-size worker pool executor.
//!
//! ## Design
//!
//! Workers are OS threads, spawned eagerly and named
//! `{pool}-worker-{i}`. Submission pushes the task into the producer's
//! queue lane and releases one gate permit; one permit corresponds to one
//! task, so a worker that wins a permit sweeps the lanes until the matching
//! task (or a sibling) turns up. After `batch` tasks a worker revisits the
//! gate so it cannot monopolize the permit supply.
//!
//! ## Shutdown
//!
//! The pool state is a monotonic integer: `Running -> Shutdown -> Stop`,
//! CAS-advanced, lower to higher only. `Shutdown` rejects new submissions
//! and lets queued tasks drain; `Stop` additionally interrupts workers
//! (every worker except the calling thread, so a task may stop its own
//! pool) and discards the queue. The interrupt is a per-worker flag used
//! purely as internal control flow; it is never surfaced through the error
//! hook. Exiting workers wake the gate so parked siblings re-check the
//! state, and count down the termination latch that backs
//! `await_termination`.
//!
//! Two queue layouts plug into the same core through [`TaskQueue`]:
//! [`ThreadPool`] (multi-lane, stealing) and [`SingleLanePool`] (the
//! drain-preserving single-queue variant).

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use tracing::{debug, trace};
use troupe_queue::{MpscQueue, MultiLaneQueue, TryPopError};

use crate::gate::ParkGate;
use crate::latch::TerminationLatch;

// ---------------------------------------------------------------------------
// Tasks and hooks
// ---------------------------------------------------------------------------

/// A unit of work accepted by an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Payload recovered from a panicking task or handler.
pub type Panic = Box<dyn Any + Send + 'static>;

/// Hook receiving the payload of every caught task panic.
pub type ErrorHook = Arc<dyn Fn(Panic) + Send + Sync>;

/// Hook receiving tasks submitted after shutdown.
pub type RejectHook = Arc<dyn Fn(Task) + Send + Sync>;

/// The one-method seam actors and other clients submit closures through.
pub trait Executor: Send + Sync {
    /// Submit a task for execution.
    fn execute(&self, task: Task);
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

const RUNNING: usize = 0;
const SHUTDOWN: usize = 1;
const STOP: usize = 2;

// ---------------------------------------------------------------------------
// Queue seam
// ---------------------------------------------------------------------------

/// Queue layout seam between the generic pool core and its two variants.
pub trait TaskQueue: Send + Sync + 'static {
    /// Build a queue sized for `pool_size` workers.
    fn for_pool(pool_size: usize) -> Self;
    /// Enqueue from the producer identified by `token`.
    fn push(&self, token: usize, task: Task);
    /// Dequeue, preferring the caller's own lane. Non-blocking.
    fn poll(&self, token: usize) -> Option<Task>;
    /// Whether the queue is observed empty.
    fn is_empty(&self) -> bool;
    /// Remove and return whatever pending tasks this layout can hand back
    /// in a meaningful order.
    fn drain(&self) -> Vec<Task>;
}

impl TaskQueue for MultiLaneQueue<Task> {
    fn for_pool(pool_size: usize) -> Self {
        MultiLaneQueue::new(pool_size)
    }

    fn push(&self, token: usize, task: Task) {
        MultiLaneQueue::push(self, token, task);
    }

    fn poll(&self, token: usize) -> Option<Task> {
        MultiLaneQueue::poll(self, token)
    }

    fn is_empty(&self) -> bool {
        MultiLaneQueue::is_empty(self)
    }

    /// Cross-lane drainage has no meaningful order; the multi-lane
    /// contract returns nothing and discards queued tasks on drop.
    fn drain(&self) -> Vec<Task> {
        Vec::new()
    }
}

impl TaskQueue for MpscQueue<Task> {
    fn for_pool(_pool_size: usize) -> Self {
        MpscQueue::new()
    }

    fn push(&self, _token: usize, task: Task) {
        MpscQueue::push(self, task);
    }

    fn poll(&self, _token: usize) -> Option<Task> {
        let backoff = Backoff::new();
        loop {
            match self.try_pop() {
                Ok(task) => return Some(task),
                Err(TryPopError::Empty) => return None,
                // Give transient states a bounded spin, then let the
                // caller's loop come back around.
                Err(_) if !backoff.is_completed() => backoff.spin(),
                Err(_) => return None,
            }
        }
    }

    fn is_empty(&self) -> bool {
        MpscQueue::is_empty(self)
    }

    fn drain(&self) -> Vec<Task> {
        MpscQueue::drain(self)
    }
}

// ---------------------------------------------------------------------------
// Lane tokens
// ---------------------------------------------------------------------------

/// Stable dense per-thread token for lane selection.
///
/// Assigned once per thread from a process-global counter, so a producer
/// always hits the same lane (per-producer FIFO) and tokens stay dense
/// enough to spread over the lane array.
pub(crate) fn thread_token() -> usize {
    static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static TOKEN: usize = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

fn default_pool_name() -> String {
    static POOL_SEQ: AtomicUsize = AtomicUsize::new(0);
    format!("troupe-pool-{}", POOL_SEQ.fetch_add(1, Ordering::Relaxed))
}

// ---------------------------------------------------------------------------
// FixedPool
// ---------------------------------------------------------------------------

struct WorkerHandle {
    thread: Thread,
    interrupt: Arc<AtomicBool>,
}

struct Inner<Q: TaskQueue> {
    name: String,
    queue: Q,
    gate: ParkGate,
    state: AtomicUsize,
    /// Accepted tasks not yet finished running. The graceful-shutdown exit
    /// check reads this instead of the queue's racy pointer-compare
    /// emptiness, so a queued-but-unclaimed task can never be stranded.
    pending: CachePadded<AtomicUsize>,
    terminations: TerminationLatch,
    workers: Mutex<Vec<WorkerHandle>>,
    on_error: ErrorHook,
    on_reject: RejectHook,
    batch: usize,
    spin: u32,
}

/// Fixed-size worker pool over a pluggable queue layout.
pub struct FixedPool<Q: TaskQueue> {
    inner: Arc<Inner<Q>>,
}

/// The multi-lane, lane-stealing pool. `shutdown_now` returns an empty
/// drain (cross-lane order is undefined).
pub type ThreadPool = FixedPool<MultiLaneQueue<Task>>;

/// Single-queue pool preserving the legacy `shutdown_now` contract: the
/// not-yet-executed tasks come back in submission order.
pub type SingleLanePool = FixedPool<MpscQueue<Task>>;

impl<Q: TaskQueue> Clone for FixedPool<Q> {
    fn clone(&self) -> Self {
        FixedPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: TaskQueue> FixedPool<Q> {
    /// Start configuring a pool.
    pub fn builder() -> PoolBuilder<Q> {
        PoolBuilder::new()
    }

    /// A pool of `pool_size` workers with default configuration.
    ///
    /// Panics if `pool_size` is zero.
    pub fn new(pool_size: usize) -> Self {
        Self::builder().pool_size(pool_size).build()
    }

    /// Submit a task.
    ///
    /// While the pool is running this enqueues into the caller's lane and
    /// releases one gate permit. After shutdown the task goes to the
    /// rejection hook instead.
    pub fn execute(&self, task: Task) {
        let inner = &self.inner;
        if inner.state.load(Ordering::Acquire) != RUNNING {
            (inner.on_reject)(task);
            return;
        }
        inner.pending.fetch_add(1, Ordering::Release);
        inner.queue.push(thread_token(), task);
        inner.gate.release(1);
    }

    /// Convenience wrapper boxing a closure into [`execute`](Self::execute).
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.execute(Box::new(f));
    }

    /// Transition to `Shutdown`: reject new submissions, let queued tasks
    /// drain, then terminate. Idempotent.
    pub fn shutdown(&self) {
        if self.advance_state(SHUTDOWN) {
            debug!(pool = %self.inner.name, "shutdown: draining queued tasks");
        }
        self.inner.gate.wake_all();
    }

    /// Transition to `Stop`: reject new submissions, interrupt every worker
    /// except the calling thread, and discard queued tasks.
    ///
    /// Returns the removed tasks when the queue layout preserves their
    /// order ([`SingleLanePool`]); the multi-lane variant returns an empty
    /// list.
    pub fn shutdown_now(&self) -> Vec<Task> {
        if self.advance_state(STOP) {
            debug!(pool = %self.inner.name, "shutdown now: interrupting workers");
        }
        let caller = thread::current().id();
        for worker in self.inner.workers.lock().iter() {
            // The caller may be one of our own workers; skipping it lets a
            // task stop its own pool and still return normally.
            if worker.thread.id() != caller {
                worker.interrupt.store(true, Ordering::Release);
            }
        }
        self.inner.gate.wake_all();
        self.inner.queue.drain()
    }

    /// Whether `shutdown` or `shutdown_now` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != RUNNING
    }

    /// Whether every worker has exited.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminations.is_zero()
    }

    /// Block until every worker has exited or the timeout elapses. Returns
    /// true iff the pool terminated in time.
    ///
    /// May be called from inside a pool task: the calling worker's latch
    /// slot is counted down first so the wait cannot deadlock on itself.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let caller = thread::current().id();
        let caller_is_worker = self
            .inner
            .workers
            .lock()
            .iter()
            .any(|worker| worker.thread.id() == caller);
        if caller_is_worker {
            self.inner.terminations.count_down();
        }
        self.inner.terminations.wait_timeout(timeout)
    }

    /// The pool's name, as used in worker thread names.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Monotonic state advance; lower to higher only. Returns true iff
    /// this call performed the transition.
    fn advance_state(&self, target: usize) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= target {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

impl<Q: TaskQueue> Executor for FixedPool<Q> {
    fn execute(&self, task: Task) {
        FixedPool::execute(self, task);
    }
}

impl<Q: TaskQueue> fmt::Debug for FixedPool<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedPool")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .field("terminations", &self.inner.terminations.count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configuration for a [`FixedPool`]. All knobs are injected here; the pool
/// reads no environment, files, or flags.
pub struct PoolBuilder<Q> {
    name: Option<String>,
    pool_size: usize,
    batch: usize,
    spin: u32,
    stack_size: Option<usize>,
    on_error: ErrorHook,
    on_reject: RejectHook,
    _queue: PhantomData<Q>,
}

impl<Q: TaskQueue> PoolBuilder<Q> {
    fn new() -> Self {
        PoolBuilder {
            name: None,
            pool_size: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            batch: 256,
            spin: 300,
            stack_size: None,
            on_error: Arc::new(|panic| {
                eprintln!("troupe: task panicked: {}", panic_message(&panic));
            }),
            on_reject: Arc::new(|_task| {
                panic!("troupe: task rejected: pool is shut down");
            }),
            _queue: PhantomData,
        }
    }

    /// Pool name; worker threads are named `{name}-worker-{i}`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of worker threads. Defaults to the available parallelism.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Tasks a worker runs between gate visits.
    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    /// Spin rounds before an idle worker parks. Trades wakeup latency for
    /// CPU; the right value is platform dependent.
    pub fn spin(mut self, spin: u32) -> Self {
        self.spin = spin;
        self
    }

    /// Stack size for worker threads.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Hook receiving the payload of every caught task panic.
    pub fn on_error(mut self, hook: impl Fn(Panic) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(hook);
        self
    }

    /// Hook receiving tasks submitted after shutdown.
    pub fn on_reject(mut self, hook: impl Fn(Task) + Send + Sync + 'static) -> Self {
        self.on_reject = Arc::new(hook);
        self
    }

    /// Spawn the workers and return the running pool.
    ///
    /// Panics if the pool size or batch is zero.
    pub fn build(self) -> FixedPool<Q> {
        assert!(self.pool_size > 0, "pool size must be positive");
        assert!(self.batch > 0, "batch must be positive");
        let pool_size = self.pool_size;
        let name = self.name.unwrap_or_else(default_pool_name);

        let inner = Arc::new(Inner {
            queue: Q::for_pool(pool_size),
            gate: ParkGate::new(),
            state: AtomicUsize::new(RUNNING),
            pending: CachePadded::new(AtomicUsize::new(0)),
            terminations: TerminationLatch::new(pool_size),
            workers: Mutex::new(Vec::with_capacity(pool_size)),
            on_error: self.on_error,
            on_reject: self.on_reject,
            batch: self.batch,
            spin: self.spin,
            name,
        });

        {
            let mut workers = inner.workers.lock();
            for i in 0..pool_size {
                let interrupt = Arc::new(AtomicBool::new(false));
                let mut builder =
                    thread::Builder::new().name(format!("{}-worker-{}", inner.name, i));
                if let Some(bytes) = self.stack_size {
                    builder = builder.stack_size(bytes);
                }
                let handle = {
                    let inner = Arc::clone(&inner);
                    let interrupt = Arc::clone(&interrupt);
                    builder
                        .spawn(move || worker_loop(inner, interrupt))
                        .expect("failed to spawn pool worker")
                };
                workers.push(WorkerHandle {
                    thread: handle.thread().clone(),
                    interrupt,
                });
                // The JoinHandle is dropped: workers are detached, and
                // termination is observed through the latch.
            }
        }

        debug!(pool = %inner.name, workers = pool_size, "thread pool started");
        FixedPool { inner }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop<Q: TaskQueue>(inner: Arc<Inner<Q>>, interrupt: Arc<AtomicBool>) {
    let token = thread_token();
    trace!(pool = %inner.name, "worker running");

    'main: loop {
        if interrupt.load(Ordering::Acquire) {
            break;
        }
        match inner.state.load(Ordering::Acquire) {
            STOP => break,
            SHUTDOWN if inner.pending.load(Ordering::Acquire) == 0 => break,
            _ => {}
        }

        // Run up to `batch` permit-paired tasks before revisiting the gate.
        let mut ran = 0;
        while ran < inner.batch && inner.gate.try_acquire() {
            // A permit means its task was enqueued before the release;
            // sweep until it (or a sibling task) turns up.
            let backoff = Backoff::new();
            loop {
                if let Some(task) = inner.queue.poll(token) {
                    run_task(task, &inner.on_error);
                    inner.pending.fetch_sub(1, Ordering::Release);
                    ran += 1;
                    break;
                }
                // Stop discards the queue, making the permit moot.
                if interrupt.load(Ordering::Acquire)
                    || inner.state.load(Ordering::Acquire) == STOP
                {
                    break 'main;
                }
                backoff.snooze();
            }
        }
        if ran > 0 {
            continue;
        }

        // Idle: spin briefly, then park until a release or shutdown wakeup.
        let mut spun = 0;
        while spun < inner.spin {
            if inner.gate.has_permits() || interrupt.load(Ordering::Acquire) {
                continue 'main;
            }
            match inner.state.load(Ordering::Acquire) {
                RUNNING => {}
                // Draining: stop spinning and go park; an exiting sibling
                // or a release will wake us.
                SHUTDOWN if inner.pending.load(Ordering::Acquire) > 0 => break,
                _ => continue 'main,
            }
            std::hint::spin_loop();
            spun += 1;
        }

        inner.gate.park(|| {
            if inner.gate.has_permits() || interrupt.load(Ordering::Acquire) {
                return false;
            }
            match inner.state.load(Ordering::Acquire) {
                STOP => false,
                SHUTDOWN => inner.pending.load(Ordering::Acquire) > 0,
                _ => true,
            }
        });
    }

    trace!(pool = %inner.name, "worker exiting");
    // Cascade the wakeup so parked siblings re-check the pool state.
    inner.gate.wake_all();
    inner.terminations.count_down();
}

fn run_task(task: Task, on_error: &ErrorHook) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        on_error(panic);
    }
}

fn panic_message(panic: &Panic) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
