//! A fiber-aware mutex and condition variable.
//!
//! Unlike `std::sync::Mutex`, contention here suspends the calling fiber rather than blocking
//! the OS thread it runs on, the same requirement a `fiber::Mutex` places on itself, just
//! realized with an async wait queue instead of a fiber-scheduler latch.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::task::{Context, Poll, Waker};

struct Inner {
    locked: AtomicBool,
    waiters: StdMutex<VecDeque<Waker>>,
}

/// A mutual-exclusion lock usable from fiber context. `lock()` suspends the caller instead of
/// blocking the reactor thread while the lock is held elsewhere.
pub struct Mutex<T: ?Sized> {
    inner: Inner,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: Inner {
                locked: AtomicBool::new(false),
                waiters: StdMutex::new(VecDeque::new()),
            },
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> Lock<'_, T> {
        Lock { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .inner
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        self.inner.locked.store(false, Ordering::Release);
        if let Some(waker) = self.inner.waiters.lock().unwrap().pop_front() {
            waker.wake();
        }
    }
}

pub struct Lock<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(guard) = self.mutex.try_lock() {
            return Poll::Ready(guard);
        }
        self.mutex.inner.waiters.lock().unwrap().push_back(cx.waker().clone());
        // Re-check after registering the waker: the lock may have been released between the
        // failed `try_lock` above and the waiter registration.
        if let Some(guard) = self.mutex.try_lock() {
            return Poll::Ready(guard);
        }
        Poll::Pending
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A condition variable for fiber-context code, in the pthread `cond_wait`/`cond_signal` style.
/// `wait` must be called while holding the paired [`Mutex`]'s guard, which it consumes and
/// returns a fresh guard for upon waking, the same contract as `std::sync::Condvar`.
pub struct Condvar {
    waiters: StdMutex<VecDeque<Waker>>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn notify_one(&self) {
        if let Some(w) = self.waiters.lock().unwrap().pop_front() {
            w.wake();
        }
    }

    pub fn notify_all(&self) {
        for w in self.waiters.lock().unwrap().drain(..) {
            w.wake();
        }
    }

    /// Releases `guard`'s lock, suspends until notified, then reacquires it.
    pub async fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        drop(guard);
        CondWait { cond: self, registered: false }.await;
        mutex.lock().await
    }
}

struct CondWait<'a> {
    cond: &'a Condvar,
    registered: bool,
}

impl<'a> Future for CondWait<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered {
            return Poll::Ready(());
        }
        this.registered = true;
        this.cond.waiters.lock().unwrap().push_back(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Arc;

    #[test]
    fn lock_excludes_concurrent_access() {
        let mutex = Arc::new(Mutex::new(0));
        block_on(async {
            {
                let mut guard = mutex.lock().await;
                *guard += 1;
            }
            assert_eq!(*mutex.lock().await, 1);
        });
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new(0);
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }
}
