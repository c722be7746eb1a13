//! Cross-thread integration tests for the queue layouts.

use std::sync::Arc;
use std::thread;

use troupe_queue::{BoundedMailbox, MpscQueue, MultiLaneQueue};

#[test]
fn mpsc_drain_races_with_producers() {
    let q = Arc::new(MpscQueue::new());
    let producers = 4;
    let per_producer = 2_000u64;

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..per_producer {
                    q.push((p as u64, i));
                }
            })
        })
        .collect();

    // Drain repeatedly while producers are still pushing; nothing may be
    // lost or duplicated across the combined drains.
    let mut collected = Vec::new();
    for _ in 0..10 {
        collected.extend(q.drain());
    }
    for h in handles {
        h.join().unwrap();
    }
    collected.extend(q.drain());

    assert_eq!(collected.len() as u64, producers as u64 * per_producer);
    let mut last_seen = vec![None::<u64>; producers];
    for (p, i) in collected {
        if let Some(prev) = last_seen[p as usize] {
            assert!(i > prev, "producer {} out of order", p);
        }
        last_seen[p as usize] = Some(i);
    }
}

#[test]
fn multilane_stealing_consumers_share_the_load() {
    let q = Arc::new(MultiLaneQueue::new(8));
    let total = 8_000u64;
    for i in 0..total {
        q.push(i as usize, i);
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let consumers: Vec<_> = (0..4)
        .map(|c| {
            let q = Arc::clone(&q);
            let tx = tx.clone();
            thread::spawn(move || {
                while let Some(v) = q.poll(c) {
                    tx.send(v).unwrap();
                }
            })
        })
        .collect();
    for h in consumers {
        h.join().unwrap();
    }
    drop(tx);

    let mut seen: Vec<u64> = rx.iter().collect();
    seen.sort_unstable();
    assert_eq!(seen.len() as u64, total);
    seen.dedup();
    assert_eq!(seen.len() as u64, total, "a value was consumed twice");
}

#[test]
fn bounded_mailbox_single_consumer_many_producers() {
    let mb = Arc::new(BoundedMailbox::new(64));
    let producers = 4;
    let per_producer = 5_000u64;

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                let mut delivered = 0u64;
                for i in 0..per_producer {
                    // Retry rejected sends so every message eventually lands.
                    let mut msg = (p as u64, i);
                    loop {
                        match mb.enqueue(msg) {
                            Ok(()) => break,
                            Err(full) => {
                                msg = full.into_message();
                                thread::yield_now();
                            }
                        }
                    }
                    delivered += 1;
                }
                delivered
            })
        })
        .collect();

    let expected = producers as u64 * per_producer;
    let mut received = 0u64;
    let mut last_seen = vec![None::<u64>; producers];
    while received < expected {
        if let Some((p, i)) = mb.dequeue() {
            if let Some(prev) = last_seen[p as usize] {
                assert!(i > prev, "producer {} out of order", p);
            }
            last_seen[p as usize] = Some(i);
            received += 1;
        } else {
            thread::yield_now();
        }
    }

    for h in handles {
        assert_eq!(h.join().unwrap(), per_producer);
    }
    assert_eq!(mb.number_of_messages(), 0);
}
