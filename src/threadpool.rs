//! Offloads blocking closures from reactor threads to a pool of worker OS threads.
//!
//! A reactor thread must never block on a syscall that can take arbitrarily long (disk I/O being
//! the typical case): doing so would stall every fiber multiplexed on it. [`FiberQueueThreadPool`]
//! gives fibers an `await`-able escape hatch: package the blocking closure, hand it to a worker,
//! suspend on a [`Done`] until the worker finishes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::error::{Error, Result};
use crate::sync::done::Done;

/// Configuration for [`FiberQueueThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker OS threads.
    pub workers: usize,
    /// Capacity of the internal job queue; `Await` suspends the caller if it is full.
    pub queue_capacity: usize,
    /// Thread name prefix; workers are named `"{prefix}-{index}"`.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity: 256,
            thread_name_prefix: "offload".to_string(),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// A pool of `K` OS worker threads that run blocking closures submitted by fibers.
///
/// `Await` is the only operation that matters: it suspends the calling fiber (not the OS thread
/// it runs on) until a worker has produced a result. After [`FiberQueueThreadPool::shutdown`],
/// calling `await_` again is a programmer error, mirroring `Reactor::post` on a stopped reactor.
pub struct FiberQueueThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl FiberQueueThreadPool {
    pub fn start(config: ThreadPoolConfig) -> Result<Arc<FiberQueueThreadPool>> {
        let (tx, rx) = bounded::<Job>(config.queue_capacity.max(1));
        let mut joins = Vec::with_capacity(config.workers);
        for i in 0..config.workers.max(1) {
            let rx = rx.clone();
            let join = std::thread::Builder::new()
                .name(format!("{}-{i}", config.thread_name_prefix))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        run_job(job);
                    }
                })
                .map_err(Error::Transport)?;
            joins.push(join);
        }
        Ok(Arc::new(FiberQueueThreadPool {
            tx: Mutex::new(Some(tx)),
            joins: Mutex::new(joins),
        }))
    }

    fn send(&self, job: Job) {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .send(job)
                .expect("offload pool's job queue outlived its last worker"),
            None => panic!("Await called on a shut-down FiberQueueThreadPool"),
        }
    }

    /// Runs `f` on a worker thread and suspends the calling fiber until it completes, returning
    /// its result. Safe to call from a fiber or from a plain OS thread.
    pub async fn await_<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let done = Arc::new(Done::new());
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));

        let done2 = done.clone();
        let slot2 = slot.clone();
        let job: Job = Box::new(move || {
            let result = f();
            *slot2.lock().unwrap() = Some(result);
            done2.notify();
        });

        self.send(job);

        done.wait().await;
        slot.lock()
            .unwrap()
            .take()
            .expect("worker notified Done without storing a result")
    }

    /// Blocking-thread equivalent of [`FiberQueueThreadPool::await_`], for callers that are not
    /// fibers (e.g. synchronous `main` code driving a pipeline).
    pub fn await_blocking<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let done = Arc::new(Done::new());
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));

        let done2 = done.clone();
        let slot2 = slot.clone();
        let job: Job = Box::new(move || {
            let result = f();
            *slot2.lock().unwrap() = Some(result);
            done2.notify();
        });

        self.send(job);

        done.wait_blocking();
        slot.lock()
            .unwrap()
            .take()
            .expect("worker notified Done without storing a result")
    }

    /// Closes the job queue and joins every worker thread, blocking the caller until they exit.
    /// Workers finish any job already in flight before observing the closed channel.
    pub fn shutdown(&self) {
        // Dropping the sender closes the channel once every clone is gone; workers share only
        // the receiver, so this alone is enough to unblock their `recv` loops. `take` makes this
        // safe to call more than once.
        self.tx.lock().unwrap().take();
        let mut joins = self.joins.lock().unwrap();
        for join in joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn run_job(job: Job) {
    // A panicking worker closure is fatal: log then resume the unwind so the worker thread (and,
    // via the default panic hook, the process) terminates.
    let result = panic::catch_unwind(AssertUnwindSafe(job));
    if let Err(payload) = result {
        log::error!("offload worker panicked: {}", panic_message(&payload));
        panic::resume_unwind(payload);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn await_returns_closure_result() {
        let pool = FiberQueueThreadPool::start(ThreadPoolConfig {
            workers: 2,
            ..Default::default()
        })
        .unwrap();
        let result = block_on(pool.await_(|| 2 + 2));
        assert_eq!(result, 4);
        pool.shutdown();
    }

    #[test]
    fn many_awaits_all_complete_under_few_workers() {
        let pool = FiberQueueThreadPool::start(ThreadPoolConfig {
            workers: 2,
            queue_capacity: 64,
            ..Default::default()
        })
        .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        block_on(async {
            let mut futures = Vec::new();
            for _ in 0..32 {
                let counter = counter.clone();
                futures.push(pool.await_(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            for f in futures {
                f.await;
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        pool.shutdown();
    }

    #[test]
    fn await_blocking_works_off_a_fiber() {
        let pool = FiberQueueThreadPool::start(ThreadPoolConfig {
            workers: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pool.await_blocking(|| "ok"), "ok");
        pool.shutdown();
    }
}
