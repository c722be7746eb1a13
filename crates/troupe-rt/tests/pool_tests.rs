//! End-to-end executor scenarios.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use troupe_rt::{SingleLanePool, ThreadPool};

/// S1: a submitted task runs and releases a waiting caller.
#[test]
fn async_execute_counts_down() {
    let pool = ThreadPool::builder().pool_size(2).name("s1").build();
    let (tx, rx) = crossbeam_channel::bounded(1);
    pool.submit(move || {
        tx.send(42u32).unwrap();
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(42));
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// S2: a panicking task reaches the error hook and the pool stays usable.
#[test]
fn fault_is_isolated_to_the_hook() {
    let errors = Arc::new(AtomicUsize::new(0));
    let errors2 = Arc::clone(&errors);
    let pool = ThreadPool::builder()
        .pool_size(1)
        .name("s2")
        .on_error(move |_| {
            errors2.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    pool.submit(|| panic!("task failure"));

    // A subsequent task still runs on the same worker.
    let (tx, rx) = crossbeam_channel::bounded(1);
    pool.submit(move || tx.send(()).unwrap());
    assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// S3: the single-lane pool hands back resubmitted tasks in submission
/// order from `shutdown_now`.
#[test]
fn single_lane_shutdown_now_drains_in_order() {
    let pool = SingleLanePool::builder().pool_size(1).name("s3").build();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    // Occupy the only worker, then queue two tagged tasks behind it.
    {
        let pool = pool.clone();
        let entered_tx = entered_tx.clone();
        pool.clone().submit(move || {
            pool.submit(|| TAG.store(1, Ordering::SeqCst));
            pool.submit(|| TAG.store(2, Ordering::SeqCst));
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
    }
    static TAG: AtomicUsize = AtomicUsize::new(0);

    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let drained = pool.shutdown_now();
    assert_eq!(drained.len(), 2);

    // Running the drained tasks in returned order yields tags 1 then 2.
    let mut tags = Vec::new();
    for task in drained {
        task();
        tags.push(TAG.load(Ordering::SeqCst));
    }
    assert_eq!(tags, vec![1, 2]);

    drop(release_tx);
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// The multi-lane variant documents the opposite contract: no drain.
#[test]
fn multi_lane_shutdown_now_returns_empty() {
    let pool = ThreadPool::builder().pool_size(1).name("s3b").build();
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    {
        let pool = pool.clone();
        pool.clone().submit(move || {
            pool.submit(|| {});
            pool.submit(|| {});
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
    }
    entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(pool.shutdown_now().is_empty());
    drop(release_tx);
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// S4: a task may stop its own pool; termination still completes.
#[test]
fn self_shutdown_is_safe() {
    let pool = ThreadPool::builder().pool_size(2).name("s4").build();
    {
        let pool = pool.clone();
        pool.clone().submit(move || {
            pool.shutdown_now();
        });
    }
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(pool.is_shutdown());
    assert!(pool.is_terminated());
}

/// A task may even await its own pool's termination without deadlocking.
#[test]
fn self_await_termination_does_not_deadlock() {
    let pool = ThreadPool::builder().pool_size(1).name("s4b").build();
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let pool = pool.clone();
        pool.clone().submit(move || {
            pool.shutdown_now();
            tx.send(pool.await_termination(Duration::from_secs(10))).unwrap();
        });
    }
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(true));
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// Property 3: shutdown flags are monotonic.
#[test]
fn shutdown_observability_is_monotonic() {
    let pool = ThreadPool::builder().pool_size(2).name("p3").build();
    assert!(!pool.is_shutdown());
    assert!(!pool.is_terminated());

    pool.shutdown();
    assert!(pool.is_shutdown());
    pool.shutdown(); // idempotent
    assert!(pool.is_shutdown());

    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(pool.is_terminated());
    assert!(pool.is_shutdown());
}

/// Submissions after shutdown go to the rejection hook.
#[test]
fn rejected_submission_reaches_hook() {
    let rejected = Arc::new(AtomicUsize::new(0));
    let rejected2 = Arc::clone(&rejected);
    let pool = ThreadPool::builder()
        .pool_size(1)
        .name("rej")
        .on_reject(move |_task| {
            rejected2.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    pool.shutdown();
    pool.submit(|| unreachable!("must not run"));
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert!(pool.await_termination(Duration::from_secs(10)));
}

/// Property 7: stopping a pool full of parked workers surfaces nothing
/// through the error hook.
#[test]
fn interrupt_is_internal_only() {
    let errored = Arc::new(AtomicBool::new(false));
    let errored2 = Arc::clone(&errored);
    let pool = ThreadPool::builder()
        .pool_size(4)
        .name("p7")
        .on_error(move |_| {
            errored2.store(true, Ordering::SeqCst);
        })
        .build();

    // Let the workers reach the parked state, then stop the pool.
    thread::sleep(Duration::from_millis(100));
    pool.shutdown_now();
    assert!(pool.await_termination(Duration::from_secs(10)));
    assert!(!errored.load(Ordering::SeqCst));
}

/// Per-producer submission order survives multi-producer enqueueing.
///
/// A single worker makes dequeue order observable as execution order;
/// with several workers the FIFO guarantee is about dequeue order only.
#[test]
fn per_producer_fifo_under_contention() {
    let pool = ThreadPool::builder().pool_size(1).name("fifo").build();
    let producers = 4;
    let per_producer = 1_000u64;
    let (tx, rx) = crossbeam_channel::unbounded();

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let pool = pool.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    let tx = tx.clone();
                    pool.submit(move || {
                        tx.send((p as u64, i)).unwrap();
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    drop(tx);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(30)));

    let mut last_seen = vec![None::<u64>; producers];
    let mut total = 0u64;
    for (p, i) in rx.iter() {
        if let Some(prev) = last_seen[p as usize] {
            assert!(i > prev, "producer {} ran out of order", p);
        }
        last_seen[p as usize] = Some(i);
        total += 1;
    }
    assert_eq!(total, producers as u64 * per_producer);
}

/// Every submitted task runs exactly once under many workers and
/// producers, whatever the interleaving.
#[test]
fn no_task_lost_under_many_workers() {
    let pool = ThreadPool::builder().pool_size(4).name("many").build();
    let producers = 8;
    let per_producer = 2_000u64;
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let pool = pool.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..per_producer {
                    let counter = Arc::clone(&counter);
                    pool.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(30)));
    assert_eq!(
        counter.load(Ordering::SeqCst) as u64,
        producers as u64 * per_producer
    );
}
