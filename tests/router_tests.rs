use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use netcrawl_rs::router::TaskRouter;

const PRODUCERS: usize = 6;
const CONSUMERS: usize = 6;
const PER_PRODUCER: usize = 5_000;

#[test]
fn concurrent_producers_and_consumers_lose_and_duplicate_nothing() {
    let router = Arc::new(TaskRouter::<usize>::default());
    let producing = Arc::new(AtomicUsize::new(PRODUCERS));
    let start = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let router = Arc::clone(&router);
            let producing = Arc::clone(&producing);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..PER_PRODUCER {
                    let item = p * PER_PRODUCER + i;
                    if i % 10 == 0 {
                        router.add_todo_batch([item]);
                    } else {
                        router.add_todo(item);
                    }
                }
                producing.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let router = Arc::clone(&router);
            let producing = Arc::clone(&producing);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut got = Vec::new();
                loop {
                    match router.get_todo() {
                        Some(item) => got.push(item),
                        None if producing.load(Ordering::SeqCst) == 0 => {
                            // producers are done; one last look
                            match router.get_todo() {
                                Some(item) => got.push(item),
                                None => break,
                            }
                        }
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all: Vec<usize> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();

    let expected: Vec<usize> = (0..PRODUCERS * PER_PRODUCER).collect();
    assert_eq!(all, expected);
    assert_eq!(router.todo_count(), 0);
}

#[test]
fn per_producer_order_is_preserved() {
    let router = Arc::new(TaskRouter::<(usize, usize)>::default());
    let handles: Vec<_> = (0..4)
        .map(|p| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                for i in 0..1_000 {
                    router.add_todo((p, i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut last = [None; 4];
    while let Some((p, i)) = router.get_todo() {
        if let Some(prev) = last[p] {
            assert!(i > prev, "producer {p} out of order: {prev} then {i}");
        }
        last[p] = Some(i);
    }
    assert_eq!(last, [Some(999); 4]);
}

#[test]
fn concurrent_finished_and_drains_partition() {
    let router = Arc::new(TaskRouter::<usize>::default());
    let adders: Vec<_> = (0..4)
        .map(|p| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                for i in 0..2_000 {
                    router.add_finished(p * 2_000 + i);
                }
            })
        })
        .collect();
    let drainers: Vec<_> = (0..2)
        .map(|_| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..1_000 {
                    got.extend(router.drain_finished());
                    thread::yield_now();
                }
                got
            })
        })
        .collect();

    for a in adders {
        a.join().unwrap();
    }
    let mut drained: Vec<Vec<usize>> = drainers.into_iter().map(|d| d.join().unwrap()).collect();
    drained.push(router.drain_finished());

    let mut all: Vec<usize> = drained.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all, (0..8_000).collect::<Vec<_>>());
    assert_eq!(router.finished_count(), 0);
}
