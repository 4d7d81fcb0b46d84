//! S2: many outstanding `Await`s complete under a small worker pool with no deadlock or lost
//! results, and ordering of completion need not match submission order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corert::threadpool::{FiberQueueThreadPool, ThreadPoolConfig};

#[test]
fn many_awaits_complete_with_few_workers() {
    let pool = FiberQueueThreadPool::start(ThreadPoolConfig {
        workers: 8,
        queue_capacity: 2048,
        thread_name_prefix: "s2-offload".into(),
    })
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    futures::executor::block_on(async {
        let mut futures = Vec::new();
        for _ in 0..2000 {
            let completed = completed.clone();
            futures.push(pool.await_(move || {
                std::thread::sleep(Duration::from_millis(1));
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for f in futures {
            f.await;
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 2000);
    // 2000 one-ms jobs over 8 workers should finish in roughly 2000/8 = 250ms, with generous
    // scheduler slack.
    assert!(start.elapsed() < Duration::from_secs(5));

    pool.shutdown();
}
