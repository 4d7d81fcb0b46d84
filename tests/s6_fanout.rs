//! S6: `ReactorPool::await_on_all` runs its closure exactly once per reactor, and every
//! increment of a shared, mutex-guarded counter is observed before the call returns.

use std::sync::Arc;

use corert::reactor::pool::{ReactorPool, ReactorPoolConfig};
use corert::sync::mutex::Mutex;

#[test]
fn await_on_all_runs_once_per_reactor_before_returning() {
    let pool = ReactorPool::start(ReactorPoolConfig {
        concurrency: 6,
        thread_name_prefix: "s6-reactor".into(),
    })
    .unwrap();

    let counter = Arc::new(Mutex::new(0u32));
    let counter_for_fanout = counter.clone();

    pool.await_on_all(move || {
        let mut guard = futures::executor::block_on(counter_for_fanout.lock());
        *guard += 1;
    });

    assert_eq!(*futures::executor::block_on(counter.lock()), pool.len() as u32);

    pool.stop();
}
