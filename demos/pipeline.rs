//! Illustrative-only map-reduce-shaped driver: fan a "disk read" step across every reactor via
//! `ReactorPool::await_on_all`, with the blocking read offloaded to `FiberQueueThreadPool` so no
//! reactor thread ever blocks on I/O. Not part of the crate's public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use corert::reactor::pool::{ReactorPool, ReactorPoolConfig};
use corert::threadpool::{FiberQueueThreadPool, ThreadPoolConfig};

fn main() {
    env_logger::init();

    let pool = ReactorPool::start(ReactorPoolConfig {
        concurrency: 4,
        thread_name_prefix: "pipeline-reactor".into(),
    })
    .expect("failed to start reactor pool");

    let offload = FiberQueueThreadPool::start(ThreadPoolConfig {
        workers: 4,
        thread_name_prefix: "pipeline-offload".into(),
        ..Default::default()
    })
    .expect("failed to start offload pool");

    let rows_processed = Arc::new(AtomicUsize::new(0));

    // "Map" phase: every reactor offloads one (pretend) disk read to the thread pool, then folds
    // the result into a shared counter.
    let rows_processed_for_fanout = rows_processed.clone();
    let offload_for_fanout = offload.clone();
    pool.await_on_all(move || {
        let chunk = offload_for_fanout.await_blocking(read_fake_chunk);
        rows_processed_for_fanout.fetch_add(chunk.len(), Ordering::SeqCst);
    });

    println!(
        "pipeline processed {} rows across {} reactors",
        rows_processed.load(Ordering::SeqCst),
        pool.len()
    );

    offload.shutdown();
    pool.stop();
}

/// Stands in for a blocking disk read a real pipeline stage would perform.
fn read_fake_chunk() -> Vec<u8> {
    std::thread::sleep(std::time::Duration::from_millis(5));
    vec![0u8; 4096]
}
