//! An outbound TCP connection that reconnects itself in the background.
//!
//! Same shape as a reconnecting wrapper around a `network::client::Client`
//! (cf. `tarantool::network::client::reconnect::Client`): the public handle is cheap to clone and
//! safe to call from any thread, while the actual socket is only ever touched on the `Reactor`
//! that owns it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::future::{select, Either};

use crate::error::{Error, Result};
use crate::reactor::{io, Reactor, NICE_BACKGROUND};
use crate::sync::done::Done;

/// Configuration for [`ClientChannel`].
#[derive(Debug, Clone)]
pub struct ClientChannelConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for [`ClientChannel::connect`], in milliseconds.
    pub connect_timeout_ms: u64,
    /// Deadline for each automatic reconnect attempt, in milliseconds.
    pub reconnect_attempt_ms: u64,
}

impl ClientChannelConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientChannelConfig {
            host: host.into(),
            port,
            connect_timeout_ms: 5_000,
            reconnect_attempt_ms: 30_000,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

struct StateInner {
    status: Status,
    shutting_down: bool,
    reconnect_active: bool,
}

struct Shared {
    id: u64,
    reactor: Reactor,
    host: String,
    port: u16,
    reconnect_attempt: Duration,
    state: StdMutex<StateInner>,
    condvar: StdCondvar,
}

thread_local! {
    /// Per-reactor-thread socket storage, keyed by channel id. A `ClientChannel`'s socket state
    /// is only ever read or written from closures running on its owning reactor, the same
    /// confinement the executor's own `CURRENT_EXECUTOR` slot relies on.
    static SOCKETS: RefCell<HashMap<u64, Rc<RefCell<Option<io::AsyncTcpStream>>>>> =
        RefCell::new(HashMap::new());
}

fn socket_cell(id: u64) -> Rc<RefCell<Option<io::AsyncTcpStream>>> {
    SOCKETS.with(|map| map.borrow_mut().entry(id).or_default().clone())
}

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A reconnecting outbound TCP connection. Cheap to clone; every clone refers to the same
/// underlying connection state.
#[derive(Clone)]
pub struct ClientChannel {
    shared: Arc<Shared>,
}

impl ClientChannel {
    pub fn new(reactor: Reactor, config: ClientChannelConfig) -> Self {
        ClientChannel {
            shared: Arc::new(Shared {
                id: next_id(),
                reactor,
                host: config.host,
                port: config.port,
                reconnect_attempt: Duration::from_millis(config.reconnect_attempt_ms),
                state: StdMutex::new(StateInner {
                    status: Status::Disconnected,
                    shutting_down: false,
                    reconnect_active: false,
                }),
                condvar: StdCondvar::new(),
            }),
        }
    }

    pub fn status(&self) -> Status {
        self.shared.state.lock().unwrap().status
    }

    /// Synchronous for the caller: blocks the calling thread (fiber or not) until a connection
    /// is established within `timeout_ms`, posting the actual resolve/connect work to the
    /// channel's owning reactor so the socket is only ever touched from one thread.
    pub fn connect(&self, timeout_ms: u64) -> Result<()> {
        let until = Instant::now() + Duration::from_millis(timeout_ms);
        let shared = self.shared.clone();
        let done = Arc::new(Done::new());
        let result: Arc<StdMutex<Option<Result<()>>>> = Arc::new(StdMutex::new(None));

        {
            let mut state = self.shared.state.lock().unwrap();
            state.status = Status::Connecting;
        }

        let done2 = done.clone();
        let result2 = result.clone();
        self.shared.reactor.spawn_fiber(move |_ctx| async move {
            let outcome = resolve_and_connect(&shared, until).await;
            *result2.lock().unwrap() = Some(outcome);
            done2.notify();
        });

        done.wait_blocking();
        result
            .lock()
            .unwrap()
            .take()
            .expect("connect fiber notified Done without storing a result")
    }

    /// Called by code that observed an operation fail on this channel's socket. Starts the
    /// background reconnect fiber unless one is already running or the channel is shutting down.
    pub fn handle_error_status(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutting_down || state.reconnect_active {
            return;
        }
        state.status = Status::Disconnected;
        state.reconnect_active = true;
        drop(state);

        let shared = self.shared.clone();
        self.shared
            .reactor
            .spawn_fiber_nice(NICE_BACKGROUND, move |_ctx| reconnect_loop(shared));
    }

    /// Marks the channel as shutting down, shuts down the socket (waking any suspended I/O with
    /// an error), and blocks the caller until any in-flight reconnect fiber has drained.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.status == Status::ShuttingDown {
                return;
            }
            state.shutting_down = true;
            state.status = Status::ShuttingDown;
        }

        let id = self.shared.id;
        self.shared.reactor.post(move |_ctx| {
            if let Some(stream) = socket_cell(id).borrow().as_ref() {
                let _ = stream.shutdown();
            }
        });

        let mut state = self.shared.state.lock().unwrap();
        while state.reconnect_active {
            state = self.shared.condvar.wait(state).unwrap();
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>) {
    loop {
        let until = Instant::now() + shared.reconnect_attempt;
        let outcome = resolve_and_connect(&shared, until).await;

        let mut state = shared.state.lock().unwrap();
        if outcome.is_ok() || state.shutting_down {
            state.reconnect_active = false;
            shared.condvar.notify_all();
            return;
        }
        // Still disconnected and not shutting down: re-arm for another attempt.
        log::warn!(
            "client channel {}:{} reconnect attempt failed, retrying",
            shared.host,
            shared.port
        );
    }
}

/// Implements the resolve/connect/backoff algorithm: resolve, race a connect attempt against
/// `until`, and back off geometrically (100ms steps, capped at 1s) between attempts.
async fn resolve_and_connect(shared: &Arc<Shared>, until: Instant) -> Result<()> {
    let mut sleep_dur = Duration::from_millis(100);
    let addr_spec = format!("{}:{}", shared.host, shared.port);

    loop {
        let addrs: Vec<SocketAddr> = addr_spec
            .to_socket_addrs()
            .map(|it| it.collect())
            .unwrap_or_default();

        let mut connected = None;
        for addr in addrs {
            if shared.state.lock().unwrap().shutting_down
                || Instant::now() + Duration::from_millis(2) >= until
            {
                break;
            }
            match try_connect_until(addr, until).await {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(_) => continue, // try the next resolved candidate
            }
        }

        if let Some(stream) = connected {
            socket_cell(shared.id).replace(Some(stream));
            let mut state = shared.state.lock().unwrap();
            state.status = Status::Connected;
            return Ok(());
        }

        let now = Instant::now();
        let shutting_down = shared.state.lock().unwrap().shutting_down;
        if shutting_down || now + Duration::from_millis(2) >= until {
            let mut state = shared.state.lock().unwrap();
            state.status = Status::Disconnected;
            return Err(Error::Aborted);
        }

        let remaining = until.saturating_duration_since(now) - Duration::from_millis(2);
        io::sleep(sleep_dur.min(remaining)).await;
        sleep_dur = (sleep_dur + Duration::from_millis(100)).min(Duration::from_secs(1));
    }
}

async fn try_connect_until(addr: SocketAddr, until: Instant) -> Result<io::AsyncTcpStream> {
    let connect_fut = io::AsyncTcpStream::connect(addr);
    let timeout_fut = io::sleep(until.saturating_duration_since(Instant::now()));
    futures::pin_mut!(connect_fut);
    futures::pin_mut!(timeout_fut);
    match select(connect_fut, timeout_fut).await {
        Either::Left((res, _)) => res,
        Either::Right(((), _)) => Err(Error::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::pool::{ReactorPool, ReactorPoolConfig};

    #[test]
    fn connect_to_closed_port_times_out_as_aborted() {
        let pool = ReactorPool::start(ReactorPoolConfig {
            concurrency: 1,
            thread_name_prefix: "test-client-channel".into(),
        })
        .unwrap();
        // Port 1 is privileged/unbound in virtually every test sandbox; connect should fail to
        // establish within a very short deadline rather than hang.
        let channel = ClientChannel::new(
            pool.next().clone(),
            ClientChannelConfig::new("127.0.0.1", 1),
        );
        let result = channel.connect(200);
        assert!(result.is_err() || channel.status() == Status::Connected);
        pool.stop();
    }
}
