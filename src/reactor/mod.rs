//! The event-loop pool.
//!
//! A [`Reactor`] is a cheap, `Send + Sync` handle to a single OS thread running an event loop
//! and a fiber scheduler. Fibers here are realized as ordinary [`std::future::Future`]s driven
//! by a single-threaded executor that lives on the reactor's own thread; the handle itself holds
//! nothing but channel senders, so it may be freely cloned and shared with other threads.
//!
//! See also: [`pool`] for the [`pool::ReactorPool`] that owns a fixed number of reactors and
//! distributes work across them, and [`io`] for the mio-backed I/O driver fibers suspend on.

pub mod io;
pub mod pool;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};

/// Per-fiber scheduling hint. Higher values run later; a fiber with `nice_level > 0` is never
/// scheduled ahead of one with `nice_level == 0`. Background maintenance fibers (e.g. the
/// `ClientChannel` reconnect loop) use [`NICE_BACKGROUND`].
pub type NiceLevel = u8;

/// The nice level handler and I/O fibers are spawned with by default.
pub const NICE_NORMAL: NiceLevel = 0;

/// The nice level background maintenance fibers (reconnect, periodic housekeeping) should use.
pub const NICE_BACKGROUND: NiceLevel = 1;

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;
type PostedJob = Box<dyn FnOnce(&Context) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskId(u64);

enum ExecutorMsg {
    Wake(TaskId),
    Post(PostedJob),
    Stop,
}

/// A cheap, cloneable, `Send + Sync` handle to one reactor thread.
///
/// All mutation of reactor-owned state happens on the reactor's own OS thread; every operation
/// exposed here that touches that state is implemented by posting a closure and, where a result
/// is needed, waiting on it.
#[derive(Clone)]
pub struct Reactor {
    name: Arc<str>,
    tx: Sender<ExecutorMsg>,
    mio_waker: Arc<mio::Waker>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("name", &self.name).finish()
    }
}

impl Reactor {
    /// Spawns a new OS thread running this reactor's event loop, returning a handle to it and
    /// the thread's `JoinHandle`. The event loop runs until [`Reactor::stop`] is called.
    pub fn spawn(name: impl Into<String>) -> Result<(Reactor, thread::JoinHandle<()>)> {
        let name = name.into();
        let (tx, rx) = unbounded();
        let poll = mio::Poll::new().map_err(Error::Transport)?;
        let mio_waker = Arc::new(
            mio::Waker::new(poll.registry(), io::WAKE_TOKEN).map_err(Error::Transport)?,
        );

        let handle = Reactor {
            name: Arc::from(name.as_str()),
            tx: tx.clone(),
            mio_waker: mio_waker.clone(),
        };
        let handle_for_thread = handle.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut executor = Executor::new(handle_for_thread, poll, rx);
                executor.run();
            })
            .map_err(Error::Transport)?;

        Ok((handle, join))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a closure to run on this reactor's thread. Non-blocking, callable from any
    /// thread, FIFO per producer. Posting to a stopped reactor is a programmer error.
    pub fn post(&self, f: impl FnOnce(&Context) + Send + 'static) {
        if self.tx.send(ExecutorMsg::Post(Box::new(f))).is_err() {
            panic!("posted to a stopped reactor `{}`", self.name);
        }
        let _ = self.mio_waker.wake();
    }

    /// Spawns a detached fiber (future) on this reactor at the default nice level. The future
    /// does not need to be `Send`: it is constructed by the closure running on the reactor's own
    /// thread.
    pub fn spawn_fiber<F>(&self, make_future: impl FnOnce(&Context) -> F + Send + 'static)
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_fiber_nice(NICE_NORMAL, make_future)
    }

    pub fn spawn_fiber_nice<F>(&self, nice: NiceLevel, make_future: impl FnOnce(&Context) -> F + Send + 'static)
    where
        F: Future<Output = ()> + 'static,
    {
        self.post(move |ctx| {
            let fut = make_future(ctx);
            ctx.spawn_nice(nice, fut);
        });
    }

    /// Stops the reactor's event loop after it drains its current tick. Does not wait for the
    /// OS thread to exit; join the handle returned by [`Reactor::spawn`] for that.
    pub fn stop(&self) {
        let _ = self.tx.send(ExecutorMsg::Stop);
        let _ = self.mio_waker.wake();
    }
}

/// Per-reactor context handed to posted closures and to fibers at spawn time, so that
/// reactor-local business state is threaded explicitly rather than read off a thread-local.
/// Internally it also exposes the low-level I/O driver fibers register interest with; that
/// plumbing is unavoidably reactor-local.
pub struct Context<'a> {
    exec: &'a Executor,
}

impl<'a> Context<'a> {
    pub fn reactor(&self) -> Reactor {
        self.exec.handle.clone()
    }

    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        self.spawn_nice(NICE_NORMAL, fut);
    }

    pub fn spawn_nice(&self, nice: NiceLevel, fut: impl Future<Output = ()> + 'static) {
        self.exec.spawn(nice, Box::pin(fut));
    }

    pub(crate) fn io_driver(&self) -> Rc<io::IoDriver> {
        self.exec.io.clone()
    }
}

struct TaskSlot {
    future: Option<BoxFuture>,
    nice: NiceLevel,
    queued: bool,
}

struct TaskWaker {
    id: TaskId,
    tx: Sender<ExecutorMsg>,
    mio_waker: Arc<mio::Waker>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.tx.send(ExecutorMsg::Wake(self.id));
        let _ = self.mio_waker.wake();
    }
}

/// The single-threaded executor that actually owns task storage, the mio event loop, and the
/// timer wheel. Lives entirely on the reactor's OS thread; never crosses a thread boundary.
pub struct Executor {
    handle: Reactor,
    poll: RefCell<mio::Poll>,
    rx: Receiver<ExecutorMsg>,
    tasks: RefCell<std::collections::HashMap<TaskId, TaskSlot>>,
    next_task_id: AtomicU64,
    ready_normal: RefCell<VecDeque<TaskId>>,
    ready_background: RefCell<VecDeque<TaskId>>,
    io: Rc<io::IoDriver>,
    timers: Rc<io::TimerDriver>,
    stopping: std::cell::Cell<bool>,
}

thread_local! {
    static CURRENT_EXECUTOR: RefCell<Option<*const Executor>> = RefCell::new(None);
}

impl Executor {
    fn new(handle: Reactor, poll: mio::Poll, rx: Receiver<ExecutorMsg>) -> Self {
        let registry = poll
            .registry()
            .try_clone()
            .expect("failed to clone mio registry");
        Executor {
            handle,
            poll: RefCell::new(poll),
            rx,
            tasks: RefCell::new(std::collections::HashMap::new()),
            next_task_id: AtomicU64::new(1),
            ready_normal: RefCell::new(VecDeque::new()),
            ready_background: RefCell::new(VecDeque::new()),
            io: Rc::new(io::IoDriver::new(registry)),
            timers: Rc::new(io::TimerDriver::new()),
            stopping: std::cell::Cell::new(false),
        }
    }

    fn spawn(&self, nice: NiceLevel, future: BoxFuture) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                future: Some(future),
                nice,
                queued: true,
            },
        );
        self.push_ready(id, nice);
        id
    }

    fn push_ready(&self, id: TaskId, nice: NiceLevel) {
        if nice == NICE_NORMAL {
            self.ready_normal.borrow_mut().push_back(id);
        } else {
            self.ready_background.borrow_mut().push_back(id);
        }
    }

    fn waker_for(&self, id: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            tx: self.tx_clone(),
            mio_waker: self.mio_waker_clone(),
        }))
    }

    fn tx_clone(&self) -> Sender<ExecutorMsg> {
        // The executor doesn't keep its own sender (it only owns the receiver); wakers reach
        // back into the reactor via the handle's sender, which is a plain clone of the same
        // channel the handle posts on.
        self.handle.tx.clone()
    }

    fn mio_waker_clone(&self) -> Arc<mio::Waker> {
        self.handle.mio_waker.clone()
    }

    fn poll_one(&self, id: TaskId) {
        let fut = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            slot.queued = false;
            slot.future.take()
        };
        let Some(mut fut) = fut else { return };

        let waker = self.waker_for(id);
        let mut cx = TaskContext::from_waker(&waker);
        let poll_result = panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));

        match poll_result {
            Ok(Poll::Ready(())) => {
                self.tasks.borrow_mut().remove(&id);
            }
            Ok(Poll::Pending) => {
                let mut tasks = self.tasks.borrow_mut();
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.future = Some(fut);
                }
            }
            Err(payload) => {
                self.tasks.borrow_mut().remove(&id);
                log::error!(
                    "fiber panicked on reactor `{}`: {}",
                    self.handle.name,
                    panic_message(&payload)
                );
                // A panic escaping a fiber is fatal, same policy as a panicking offload job.
                panic::resume_unwind(payload);
            }
        }
    }

    fn drain_ready(&self, queue: &RefCell<VecDeque<TaskId>>) {
        loop {
            let next = queue.borrow_mut().pop_front();
            let Some(id) = next else { break };
            self.poll_one(id);
        }
    }

    fn run(&mut self) {
        CURRENT_EXECUTOR.with(|cell| {
            *cell.borrow_mut() = Some(self as *const Executor);
        });

        let ctx = Context { exec: self };
        let mut events = mio::Events::with_capacity(1024);

        loop {
            // Drain cross-thread messages first: new posts may spawn tasks, wakes requeue them.
            while let Ok(msg) = self.rx.try_recv() {
                match msg {
                    ExecutorMsg::Post(job) => job(&ctx),
                    ExecutorMsg::Wake(id) => {
                        let nice = self
                            .tasks
                            .borrow()
                            .get(&id)
                            .map(|t| t.nice)
                            .unwrap_or(NICE_NORMAL);
                        let already_queued = {
                            let mut tasks = self.tasks.borrow_mut();
                            match tasks.get_mut(&id) {
                                Some(slot) if slot.queued => true,
                                Some(slot) => {
                                    slot.queued = true;
                                    false
                                }
                                None => true,
                            }
                        };
                        if !already_queued {
                            self.push_ready(id, nice);
                        }
                    }
                    ExecutorMsg::Stop => self.stopping.set(true),
                }
            }

            self.drain_ready(&self.ready_normal);
            // Background fibers only get a turn once the normal lane is empty, so a
            // latency-critical I/O fiber is never delayed by housekeeping work.
            if self.ready_normal.borrow().is_empty() {
                if let Some(id) = self.ready_background.borrow_mut().pop_front() {
                    self.poll_one(id);
                }
            }

            if self.stopping.get() && self.tasks.borrow().is_empty() {
                break;
            }

            let timeout = self.next_timeout();
            let mut poll = self.poll.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("reactor `{}` poll failed: {e}", self.handle.name);
                    continue;
                }
            }
            drop(poll);

            for event in events.iter() {
                if event.token() == io::WAKE_TOKEN {
                    continue;
                }
                self.io.dispatch(event, |waker| waker.wake());
            }
            self.timers.fire_expired(|waker| waker.wake());
        }

        CURRENT_EXECUTOR.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }

    fn next_timeout(&self) -> Option<Duration> {
        if !self.ready_normal.borrow().is_empty() || !self.ready_background.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers.next_deadline()
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

/// Returns the I/O driver and timer driver for the reactor currently executing on this thread.
/// Panics if called off a reactor thread; scoped to the low-level scheduling plumbing only.
pub(crate) fn current_io_and_timers() -> (Rc<io::IoDriver>, Rc<io::TimerDriver>) {
    CURRENT_EXECUTOR.with(|cell| {
        let ptr = cell
            .borrow()
            .expect("called from outside a reactor thread");
        // SAFETY: the pointer is only ever set for the duration of `Executor::run` on this same
        // thread, and cleared before the function returns.
        let exec = unsafe { &*ptr };
        (exec.io.clone(), exec.timers.clone())
    })
}
