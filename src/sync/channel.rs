//! A bounded MPMC FIFO channel shared across fibers and OS threads.
//!
//! `push` suspends the caller while the channel is full; `pop` suspends while it is empty.
//! Closing the channel wakes every waiter: pending pushes fail, and pops drain whatever remains
//! before reporting `Closed`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct State<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    send_wakers: VecDeque<Waker>,
    recv_wakers: VecDeque<Waker>,
    tx_count: usize,
    rx_count: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// A bounded MPMC channel of capacity `capacity`. Returns a `(Sender, Receiver)` pair; both ends
/// are `Clone` to support multiple producers/consumers.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Channel<T> {
    pub fn bounded(capacity: usize) -> (Sender<T>, Receiver<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                closed: false,
                send_wakers: VecDeque::new(),
                recv_wakers: VecDeque::new(),
                tx_count: 1,
                rx_count: 1,
            }),
        });
        (
            Sender {
                shared: shared.clone(),
            },
            Receiver { shared },
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(t) | TrySendError::Closed(t) => t,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    Closed,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Closed,
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Suspends the calling fiber until there is room in the channel or it is closed.
    pub fn push(&self, value: T) -> Push<'_, T> {
        Push {
            shared: &self.shared,
            value: Some(value),
        }
    }

    pub fn try_push(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if state.queue.len() >= state.capacity {
            return Err(TrySendError::Full(value));
        }
        state.queue.push_back(value);
        if let Some(w) = state.recv_wakers.pop_front() {
            w.wake();
        }
        Ok(())
    }

    pub fn close(&self) {
        close(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().unwrap().tx_count += 1;
        Sender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.tx_count -= 1;
        if state.tx_count == 0 {
            state.closed = true;
            drain_recv_wakers(&mut state);
        }
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Suspends the calling fiber until an item is available or the channel is closed and
    /// drained.
    pub fn pop(&self) -> Pop<'_, T> {
        Pop { shared: &self.shared }
    }

    pub fn try_pop(&self) -> Result<T, TryRecvError> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(v) = state.queue.pop_front() {
            if let Some(w) = state.send_wakers.pop_front() {
                w.wake();
            }
            return Ok(v);
        }
        if state.closed {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    pub fn close(&self) {
        close(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.closed && state.queue.is_empty()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().unwrap().rx_count += 1;
        Receiver {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.rx_count -= 1;
        if state.rx_count == 0 {
            state.closed = true;
            drain_send_wakers(&mut state);
        }
    }
}

fn close<T>(shared: &Arc<Shared<T>>) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }
    state.closed = true;
    drain_send_wakers(&mut state);
    drain_recv_wakers(&mut state);
}

fn drain_send_wakers<T>(state: &mut State<T>) {
    for w in state.send_wakers.drain(..) {
        w.wake();
    }
}

fn drain_recv_wakers<T>(state: &mut State<T>) {
    for w in state.recv_wakers.drain(..) {
        w.wake();
    }
}

pub struct Push<'a, T> {
    shared: &'a Arc<Shared<T>>,
    value: Option<T>,
}

impl<'a, T> Future for Push<'a, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        if state.closed {
            return Poll::Ready(Err(SendError::Closed(this.value.take().expect(
                "Push polled after completion",
            ))));
        }
        if state.queue.len() < state.capacity {
            state.queue.push_back(this.value.take().expect("Push polled after completion"));
            if let Some(w) = state.recv_wakers.pop_front() {
                w.wake();
            }
            return Poll::Ready(Ok(()));
        }
        state.send_wakers.push_back(cx.waker().clone());
        Poll::Pending
    }
}

pub struct Pop<'a, T> {
    shared: &'a Arc<Shared<T>>,
}

impl<'a, T> Future for Pop<'a, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        if let Some(v) = state.queue.pop_front() {
            if let Some(w) = state.send_wakers.pop_front() {
                w.wake();
            }
            return Poll::Ready(Ok(v));
        }
        if state.closed {
            return Poll::Ready(Err(RecvError::Closed));
        }
        state.recv_wakers.push_back(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn push_then_pop_in_order() {
        let (tx, rx) = Channel::bounded(4);
        block_on(async {
            tx.push(1).await.unwrap();
            tx.push(2).await.unwrap();
            tx.push(3).await.unwrap();
            assert_eq!(rx.pop().await, Ok(1));
            assert_eq!(rx.pop().await, Ok(2));
            assert_eq!(rx.pop().await, Ok(3));
        });
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (tx, rx) = Channel::bounded(4);
        block_on(async {
            tx.push(1).await.unwrap();
            tx.push(2).await.unwrap();
            tx.close();
            assert_eq!(rx.pop().await, Ok(1));
            assert_eq!(rx.pop().await, Ok(2));
            assert_eq!(rx.pop().await, Err(RecvError::Closed));
        });
    }

    #[test]
    fn try_push_reports_full() {
        let (tx, _rx) = Channel::bounded(1);
        tx.try_push(1).unwrap();
        assert_eq!(tx.try_push(2), Err(TrySendError::Full(2)));
    }

    #[test]
    fn dropping_all_senders_closes_channel() {
        let (tx, rx) = Channel::bounded(1);
        drop(tx);
        assert!(rx.is_closed());
    }
}
