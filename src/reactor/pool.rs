//! Owns a fixed number of [`Reactor`]s and distributes work across them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::Result;
use crate::reactor::Reactor;
use crate::sync::done::Done;

/// Configuration for [`ReactorPool`].
#[derive(Debug, Clone)]
pub struct ReactorPoolConfig {
    /// Number of reactors to create. Defaults to [`std::thread::available_parallelism`].
    pub concurrency: usize,
    /// Thread name prefix; reactors are named `"{prefix}-{index}"`.
    pub thread_name_prefix: String,
}

impl Default for ReactorPoolConfig {
    fn default() -> Self {
        ReactorPoolConfig {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name_prefix: "reactor".to_string(),
        }
    }
}

/// A pool of `N` single-threaded reactors. Work is distributed round-robin via
/// [`ReactorPool::next`], or broadcast to every reactor via [`ReactorPool::await_on_all`].
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    cursor: AtomicUsize,
}

impl ReactorPool {
    /// Starts `config.concurrency` reactors, each on its own OS thread.
    pub fn start(config: ReactorPoolConfig) -> Result<Arc<ReactorPool>> {
        let mut reactors = Vec::with_capacity(config.concurrency);
        let mut joins = Vec::with_capacity(config.concurrency);
        for i in 0..config.concurrency.max(1) {
            let (reactor, join) =
                Reactor::spawn(format!("{}-{i}", config.thread_name_prefix))?;
            reactors.push(reactor);
            joins.push(join);
        }
        Ok(Arc::new(ReactorPool {
            reactors,
            joins: Mutex::new(joins),
            cursor: AtomicUsize::new(0),
        }))
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Returns the next reactor in round-robin order. The counter is a plain atomic increment;
    /// under concurrent callers the sequence may not be perfectly interleaved, which is fine,
    /// only approximate fairness is required.
    pub fn next(&self) -> &Reactor {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        &self.reactors[i]
    }

    pub fn reactors(&self) -> &[Reactor] {
        &self.reactors
    }

    /// Invokes `f` once on each reactor's thread, blocking the caller until every invocation has
    /// completed.
    pub fn await_on_all(&self, f: impl Fn() + Send + Sync + 'static) {
        let f = Arc::new(f);
        let dones: Vec<Arc<Done>> = (0..self.reactors.len()).map(|_| Arc::new(Done::new())).collect();
        for (reactor, done) in self.reactors.iter().zip(dones.iter().cloned()) {
            let f = f.clone();
            reactor.post(move |_ctx| {
                f();
                done.notify();
            });
        }
        for done in &dones {
            done.wait_blocking();
        }
    }

    /// Stops every reactor's event loop and joins its thread. Reactors finish their current tick
    /// (including draining any tasks already spawned) before exiting.
    pub fn stop(&self) {
        for reactor in &self.reactors {
            reactor.stop();
        }
        let mut joins = self.joins.lock().unwrap();
        for join in joins.drain(..) {
            let _ = join.join();
        }
    }
}
