//! The mio-backed I/O driver and timer wheel a reactor's fibers suspend on.
//!
//! Every socket a fiber touches is registered with the owning reactor's [`mio::Poll`] exactly
//! once and is driven only from that reactor's thread (the Reactor isolation invariant). A
//! [`Waker`] is stashed per (token, interest) pair; when the reactor's poll loop observes
//! readiness it wakes the stashed waker, which reschedules the fiber.

use std::cell::RefCell;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::cmp::Reverse;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use crate::error::{Error, Result};

/// Reserved token the cross-thread waker (`Post`/fiber wakeups) is registered under.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// The listen backlog `AcceptServer` binds with.
pub const LISTEN_BACKLOG: i32 = 64;

#[derive(Default)]
struct Registration {
    read: Option<Waker>,
    write: Option<Waker>,
}

/// Owns the mio `Registry` clone and the token → waker bookkeeping for one reactor.
pub struct IoDriver {
    registry: Registry,
    next_token: AtomicUsize,
    registrations: RefCell<HashMap<Token, Registration>>,
}

impl IoDriver {
    pub(crate) fn new(registry: Registry) -> Self {
        IoDriver {
            registry,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            registrations: RefCell::new(HashMap::new()),
        }
    }

    fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, source: &mut impl mio::event::Source, token: Token) -> io::Result<()> {
        self.registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        self.registrations
            .borrow_mut()
            .insert(token, Registration::default());
        Ok(())
    }

    fn deregister(&self, source: &mut impl mio::event::Source, token: Token) {
        let _ = self.registry.deregister(source);
        self.registrations.borrow_mut().remove(&token);
    }

    fn want(&self, token: Token, readable: bool, writable: bool, waker: &Waker) {
        let mut regs = self.registrations.borrow_mut();
        let reg = regs.entry(token).or_default();
        if readable {
            reg.read = Some(waker.clone());
        }
        if writable {
            reg.write = Some(waker.clone());
        }
    }

    /// Called by the reactor's poll loop for every readiness event it observes.
    pub(crate) fn dispatch(&self, event: &Event, wake: impl Fn(Waker)) {
        let token = event.token();
        let mut regs = self.registrations.borrow_mut();
        let Some(reg) = regs.get_mut(&token) else {
            return;
        };
        if event.is_readable() {
            if let Some(w) = reg.read.take() {
                wake(w);
            }
        }
        if event.is_writable() {
            if let Some(w) = reg.write.take() {
                wake(w);
            }
        }
    }
}

/// A timer wheel backed by a min-heap of (deadline, id) pairs.
pub struct TimerDriver {
    heap: RefCell<BinaryHeap<Reverse<(Instant, u64)>>>,
    wakers: RefCell<HashMap<u64, Waker>>,
    next_id: AtomicUsize,
}

impl TimerDriver {
    pub(crate) fn new() -> Self {
        TimerDriver {
            heap: RefCell::new(BinaryHeap::new()),
            wakers: RefCell::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    fn register(&self, deadline: Instant, waker: &Waker) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        self.heap.borrow_mut().push(Reverse((deadline, id)));
        self.wakers.borrow_mut().insert(id, waker.clone());
        id
    }

    fn cancel(&self, id: u64) {
        self.wakers.borrow_mut().remove(&id);
    }

    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        let heap = self.heap.borrow();
        heap.peek().map(|Reverse((deadline, _))| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    pub(crate) fn fire_expired(&self, wake: impl Fn(Waker)) {
        let now = Instant::now();
        loop {
            let due = {
                let mut heap = self.heap.borrow_mut();
                match heap.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(Reverse((_, id))) = due else { break };
            if let Some(waker) = self.wakers.borrow_mut().remove(&id) {
                wake(waker);
            }
        }
    }
}

/// A future that resolves once, after `duration` has elapsed, driven by the current reactor's
/// timer wheel.
pub struct Sleep {
    deadline: Instant,
    timer_id: Option<u64>,
    timers: std::rc::Rc<TimerDriver>,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        let (_, timers) = super::current_io_and_timers();
        Sleep {
            deadline: Instant::now() + duration,
            timer_id: None,
            timers,
        }
    }

    pub fn until(deadline: Instant) -> Self {
        let (_, timers) = super::current_io_and_timers();
        Sleep {
            deadline,
            timer_id: None,
            timers,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            if let Some(id) = this.timer_id.take() {
                this.timers.cancel(id);
            }
            return Poll::Ready(());
        }
        this.timer_id = Some(this.timers.register(this.deadline, cx.waker()));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer_id.take() {
            self.timers.cancel(id);
        }
    }
}

pub async fn sleep(duration: Duration) {
    Sleep::new(duration).await
}

/// A non-blocking TCP listener registered with the current reactor, exposing a blocking-style
/// `async fn accept`.
pub struct AsyncTcpListener {
    inner: RefCell<TcpListener>,
    token: Token,
    io: std::rc::Rc<IoDriver>,
}

impl AsyncTcpListener {
    /// Binds with `SO_REUSEADDR` and a listen backlog of [`LISTEN_BACKLOG`], per the
    /// `AcceptServer` construction contract.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        use socket2::{Domain, Socket, Type};

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::Transport)?;
        socket.set_reuse_address(true).map_err(Error::Transport)?;
        socket.set_nonblocking(true).map_err(Error::Transport)?;
        socket.bind(&addr.into()).map_err(Error::Transport)?;
        socket.listen(LISTEN_BACKLOG).map_err(Error::Transport)?;

        let mut mio_listener = TcpListener::from_std(socket.into());
        let (io, _) = super::current_io_and_timers();
        let token = io.alloc_token();
        io.register(&mut mio_listener, token)
            .map_err(Error::Transport)?;
        Ok(AsyncTcpListener {
            inner: RefCell::new(mio_listener),
            token,
            io,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.borrow().local_addr().map_err(Error::Transport)
    }

    /// Suspends the calling fiber until a connection arrives, or the listener is closed from
    /// another fiber/thread (via `Drop` or `close`).
    pub async fn accept(&self) -> Result<(AsyncTcpStream, SocketAddr)> {
        std::future::poll_fn(|cx| {
            match self.inner.borrow_mut().accept() {
                Ok((stream, addr)) => Poll::Ready(Ok((AsyncTcpStream::from_mio(stream)?, addr))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.io.want(self.token, true, false, cx.waker());
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(Error::Transport(e))),
            }
        })
        .await
    }
}

impl Drop for AsyncTcpListener {
    fn drop(&mut self) {
        self.io.deregister(&mut *self.inner.borrow_mut(), self.token);
    }
}

/// A non-blocking TCP stream registered with the current reactor, exposing blocking-style
/// `async fn connect` / `read` / `write`.
pub struct AsyncTcpStream {
    inner: RefCell<TcpStream>,
    token: Token,
    io: std::rc::Rc<IoDriver>,
}

impl AsyncTcpStream {
    pub(crate) fn from_mio(mut stream: TcpStream) -> Result<Self> {
        let (io, _) = super::current_io_and_timers();
        let token = io.alloc_token();
        io.register(&mut stream, token).map_err(Error::Transport)?;
        Ok(AsyncTcpStream {
            inner: RefCell::new(stream),
            token,
            io,
        })
    }

    /// Deregisters from this reactor's `IoDriver` and hands back the raw mio stream so it can be
    /// moved to a different reactor thread and re-registered there via `from_mio`. `AsyncTcpStream`
    /// itself is not `Send` (it holds an `Rc<IoDriver>` confined to one thread); the underlying
    /// `mio::net::TcpStream` is.
    pub(crate) fn into_raw(self) -> TcpStream {
        let mut this = std::mem::ManuallyDrop::new(self);
        this.io.deregister(&mut *this.inner.borrow_mut(), this.token);
        // SAFETY: `this` is `ManuallyDrop`, so none of its fields run their destructor when it
        // goes out of scope; reading `inner` out here is the only remaining access to it.
        unsafe { std::ptr::read(&this.inner) }.into_inner()
    }

    /// Name resolution is assumed already done by the caller (see
    /// [`crate::net::client_channel::ClientChannel`]); this starts a non-blocking connect and
    /// suspends until it completes or fails. A connect attempt resolves, successfully or not,
    /// the first time the socket becomes writable.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let mio_stream = TcpStream::connect(addr).map_err(Error::Transport)?;
        let this = Self::from_mio(mio_stream)?;
        let mut first_poll = true;
        std::future::poll_fn(|cx| {
            if first_poll {
                first_poll = false;
            } else {
                match this.inner.borrow().take_error() {
                    Ok(None) => {}
                    Ok(Some(e)) => return Poll::Ready(Err(Error::Transport(e))),
                    Err(e) => return Poll::Ready(Err(Error::Transport(e))),
                }
                return Poll::Ready(Ok(()));
            }
            this.io.want(this.token, false, true, cx.waker());
            Poll::Pending
        })
        .await?;
        Ok(this)
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        std::future::poll_fn(|cx| match self.inner.borrow_mut().read(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.io.want(self.token, true, false, cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(Error::Transport(e))),
        })
        .await
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        std::future::poll_fn(|cx| match self.inner.borrow_mut().write(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.io.want(self.token, false, true, cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(Error::Transport(e))),
        })
        .await
    }

    pub fn shutdown(&self) -> Result<()> {
        self.inner
            .borrow()
            .shutdown(std::net::Shutdown::Both)
            .or_else(|e| {
                // Already-disconnected sockets report `NotConnected`; shutdown is idempotent
                // from the caller's point of view.
                if e.kind() == io::ErrorKind::NotConnected {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(Error::Transport)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.borrow().peer_addr().map_err(Error::Transport)
    }
}

impl Drop for AsyncTcpStream {
    fn drop(&mut self) {
        self.io.deregister(&mut *self.inner.borrow_mut(), self.token);
    }
}
