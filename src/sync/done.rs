//! One-shot edge-triggered event, usable from both fibers and plain OS threads.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Condvar, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct Inner {
    set: bool,
    waker: Option<Waker>,
}

/// A one-shot event. Starts `Unset`; [`Done::notify`] moves it to `Set` and is idempotent.
/// [`Done::wait`] (for fibers) and [`Done::wait_blocking`] (for plain OS threads) both return
/// immediately if the event is already `Set`.
pub struct Done {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl Default for Done {
    fn default() -> Self {
        Self::new()
    }
}

impl Done {
    pub fn new() -> Self {
        Done {
            inner: Mutex::new(Inner::default()),
            condvar: Condvar::new(),
        }
    }

    /// Sets the event and wakes any waiters. Calling this more than once has no additional
    /// effect: `notify(); notify(); wait()` behaves identically to `notify(); wait()`.
    pub fn notify(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.set {
            return;
        }
        inner.set = true;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().unwrap().set
    }

    /// Returns the event to `Unset`. Calling this while a fiber or thread is in the middle of
    /// `wait`/`wait_blocking` is a race the caller must avoid, per the documented contract.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.set = false;
        inner.waker = None;
    }

    /// Suspends the current fiber until the event is set. Safe to call from any executor, not
    /// just this crate's: it only relies on the standard `Waker` contract.
    pub fn wait(&self) -> Wait<'_> {
        Wait { done: self }
    }

    /// Blocks the calling OS thread (not a fiber) until the event is set. Used by code that runs
    /// outside a reactor, e.g. `ClientChannel::connect` or `ReactorPool::await_on_all`.
    pub fn wait_blocking(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.set {
            inner = self.condvar.wait(inner).unwrap();
        }
    }
}

pub struct Wait<'a> {
    done: &'a Done,
}

impl<'a> Future for Wait<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.done.inner.lock().unwrap();
        if inner.set {
            return Poll::Ready(());
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_then_wait_blocking_returns_promptly() {
        let done = Done::new();
        done.notify();
        done.wait_blocking();
    }

    #[test]
    fn double_notify_is_idempotent() {
        let done = Done::new();
        done.notify();
        done.notify();
        assert!(done.is_set());
    }

    #[test]
    fn wait_blocking_wakes_on_cross_thread_notify() {
        let done = Arc::new(Done::new());
        let d2 = done.clone();
        let notifier = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            d2.notify();
        });
        done.wait_blocking();
        notifier.join().unwrap();
    }

    #[test]
    fn reset_allows_reuse() {
        let done = Done::new();
        done.notify();
        assert!(done.is_set());
        done.reset();
        assert!(!done.is_set());
    }
}
