//! Listening socket → accept-loop fiber → per-connection handler fibers, with graceful shutdown.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::{select, Either};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::error::{Error, Result};
use crate::reactor::pool::ReactorPool;
use crate::reactor::{io, Reactor};
use crate::sync::done::Done;

thread_local! {
    /// Per-reactor-thread socket storage for accepted connections, keyed by connection id. A
    /// connection's socket is only ever read or written from closures running on the reactor it
    /// was handed off to, the same confinement `client_channel`'s `SOCKETS` relies on.
    static CONN_SOCKETS: RefCell<HashMap<u64, Rc<RefCell<Option<io::AsyncTcpStream>>>>> =
        RefCell::new(HashMap::new());
}

/// A connected socket handed to an [`AcceptServer`] handler. Cheap to clone; every clone refers
/// to the same underlying connection, which is torn down (by [`AcceptServer::stop`] or by the
/// handler itself) by punching a hole in the shared cell rather than by running `Drop` early.
#[derive(Clone)]
pub struct Connection {
    cell: Rc<RefCell<Option<io::AsyncTcpStream>>>,
}

impl Connection {
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.cell.borrow().as_ref() {
            Some(stream) => stream.read(buf).await,
            None => Err(Error::Aborted),
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.cell.borrow().as_ref() {
            Some(stream) => stream.write(buf).await,
            None => Err(Error::Aborted),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match self.cell.borrow().as_ref() {
            Some(stream) => stream.peer_addr(),
            None => Err(Error::Aborted),
        }
    }

    /// Shuts the socket down immediately. Safe to call from the handler fiber itself or, via
    /// [`AcceptServer::stop`] posting to this connection's own reactor, from outside it; both
    /// only ever take an immutable borrow of the shared cell, so the two never conflict.
    pub fn shutdown(&self) {
        if let Some(stream) = self.cell.borrow().as_ref() {
            let _ = stream.shutdown();
        }
    }
}

/// Configuration for [`AcceptServer`].
#[derive(Debug, Clone)]
pub struct AcceptServerConfig {
    /// Interface/port to listen on; use port 0 for an OS-assigned ephemeral port.
    pub bind_addr: SocketAddr,
    /// Whether to install SIGINT/SIGTERM handlers that trigger graceful shutdown.
    pub install_signal_handlers: bool,
}

impl AcceptServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        AcceptServerConfig {
            bind_addr,
            install_signal_handlers: true,
        }
    }
}

/// A live connection's handle as seen by the accept server: a cancellation signal the handler
/// fiber is expected to race its I/O against, on top of the socket-level shutdown
/// [`AcceptServer::stop`] performs on its own. The intrusive live-connection list is realized
/// here as a map of these, mutated only from the accept-loop reactor.
pub type ConnectionHandler = Arc<Done>;

/// What the accept loop tracks per live connection: its cancellation signal and the reactor it
/// was handed off to, so [`AcceptServer::stop`] knows where to post the socket shutdown.
struct LiveConn {
    cancel: ConnectionHandler,
    reactor: Reactor,
}

struct Shared {
    pool: Arc<ReactorPool>,
    live: StdMutex<HashMap<u64, LiveConn>>,
    next_conn_id: AtomicU64,
    accept_stop: Arc<Done>,
    shutting_down: AtomicBool,
    stopped: Arc<Done>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

/// A TCP accept server: one accept-loop fiber on a reactor drawn from the pool, handing each
/// accepted connection to a handler fiber on a round-robin reactor.
pub struct AcceptServer {
    shared: Arc<Shared>,
}

impl AcceptServer {
    /// Binds `config.bind_addr` and starts the accept loop. `handler` is invoked once per
    /// accepted connection, on a reactor chosen round-robin from `pool`; it is handed the
    /// connection, the peer address, and a cancellation signal it should race reads/writes
    /// against so that [`AcceptServer::stop`] can interrupt it promptly. `stop` also shuts the
    /// socket down directly, so a handler that never looks at the cancellation signal is still
    /// torn down correctly, just not as promptly.
    pub fn start<H, Fut>(pool: Arc<ReactorPool>, config: AcceptServerConfig, handler: H) -> Result<Arc<AcceptServer>>
    where
        H: Fn(Connection, SocketAddr, ConnectionHandler) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let accept_reactor = pool.next().clone();
        let shared = Arc::new(Shared {
            pool: pool.clone(),
            live: StdMutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            accept_stop: Arc::new(Done::new()),
            shutting_down: AtomicBool::new(false),
            stopped: Arc::new(Done::new()),
            local_addr: StdMutex::new(None),
        });

        let bind_done = Arc::new(Done::new());
        let bind_error: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));

        let shared2 = shared.clone();
        let handler = Arc::new(handler);
        let bind_done2 = bind_done.clone();
        let bind_error2 = bind_error.clone();
        let bind_addr = config.bind_addr;

        accept_reactor.spawn_fiber(move |_ctx| {
            let target_pool = shared2.pool.clone();
            async move {
                let listener = match io::AsyncTcpListener::bind(bind_addr) {
                    Ok(l) => l,
                    Err(e) => {
                        *bind_error2.lock().unwrap() = Some(e.to_string());
                        bind_done2.notify();
                        return;
                    }
                };
                match listener.local_addr() {
                    Ok(addr) => *shared2.local_addr.lock().unwrap() = Some(addr),
                    Err(e) => {
                        *bind_error2.lock().unwrap() = Some(e.to_string());
                        bind_done2.notify();
                        return;
                    }
                }
                bind_done2.notify();

                loop {
                    let accept_fut = listener.accept();
                    let stop_fut = shared2.accept_stop.wait();
                    futures::pin_mut!(accept_fut);
                    futures::pin_mut!(stop_fut);
                    let accepted = match select(accept_fut, stop_fut).await {
                        Either::Left((Ok(pair), _)) => pair,
                        Either::Left((Err(e), _)) => {
                            log::warn!("accept server: listener error, stopping accept loop: {e}");
                            break;
                        }
                        Either::Right(((), _)) => break,
                    };
                    let (stream, addr) = accepted;

                    let conn_id = shared2.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let cancel: ConnectionHandler = Arc::new(Done::new());
                    let target = target_pool.next().clone();
                    shared2.live.lock().unwrap().insert(
                        conn_id,
                        LiveConn {
                            cancel: cancel.clone(),
                            reactor: target.clone(),
                        },
                    );

                    // `stream` is confined to this (the accept-loop) reactor's thread; strip it
                    // down to the raw, `Send`-safe mio socket so it can cross into `target`'s
                    // closure, then re-register it fresh once that closure runs there.
                    let raw = stream.into_raw();
                    let handler = handler.clone();
                    let shared3 = shared2.clone();
                    target.post(move |tctx| {
                        let stream = match io::AsyncTcpStream::from_mio(raw) {
                            Ok(s) => s,
                            Err(e) => {
                                log::warn!("accept server: failed to register handed-off connection: {e}");
                                shared3.live.lock().unwrap().remove(&conn_id);
                                maybe_finish(&shared3);
                                return;
                            }
                        };
                        let cell = Rc::new(RefCell::new(Some(stream)));
                        CONN_SOCKETS.with(|map| {
                            map.borrow_mut().insert(conn_id, cell.clone());
                        });
                        let conn = Connection { cell };

                        tctx.spawn(async move {
                            handler(conn, addr, cancel).await;
                            CONN_SOCKETS.with(|map| {
                                map.borrow_mut().remove(&conn_id);
                            });
                            shared3.live.lock().unwrap().remove(&conn_id);
                            maybe_finish(&shared3);
                        });
                    });
                }
            }
        });

        bind_done.wait_blocking();
        if let Some(msg) = bind_error.lock().unwrap().take() {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            )));
        }

        if config.install_signal_handlers {
            install_signal_handlers(shared.clone())?;
        }

        Ok(Arc::new(AcceptServer { shared }))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// Breaks the accept loop, notifies every live connection's cancellation signal, and shuts
    /// down every live connection's socket from its own owning reactor (independent of whether
    /// the handler fiber ever looks at the cancellation signal), then returns immediately; call
    /// [`AcceptServer::wait`] to block until every handler fiber has returned.
    pub fn stop(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.accept_stop.notify();
        shutdown_live_connections(&self.shared);
        maybe_finish(&self.shared);
    }

    /// Blocks until [`AcceptServer::stop`] has been called and every accepted connection's
    /// handler fiber has returned.
    pub fn wait(&self) {
        self.shared.stopped.wait_blocking();
    }
}

fn maybe_finish(shared: &Shared) {
    if shared.shutting_down.load(Ordering::SeqCst) && shared.live.lock().unwrap().is_empty() {
        shared.stopped.notify();
    }
}

/// Notifies every live connection's cancellation signal and posts a socket-shutdown closure to
/// each connection's own owning reactor, looking the socket up in that reactor's `CONN_SOCKETS`.
/// The posted closure only ever takes an immutable borrow of the shared cell, so it never races
/// the handler fiber's own immutable borrow of the same cell.
fn shutdown_live_connections(shared: &Shared) {
    let live = shared.live.lock().unwrap();
    for (conn_id, conn) in live.iter() {
        conn.cancel.notify();
        let conn_id = *conn_id;
        conn.reactor.post(move |_ctx| {
            CONN_SOCKETS.with(|map| {
                if let Some(cell) = map.borrow().get(&conn_id) {
                    if let Some(stream) = cell.borrow().as_ref() {
                        let _ = stream.shutdown();
                    }
                }
            });
        });
    }
}

fn install_signal_handlers(shared: Arc<Shared>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::Transport)?;
    std::thread::Builder::new()
        .name("accept-server-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                log::info!("accept server received signal {signal}, shutting down");
                shared.accept_stop.notify();
                shared.shutting_down.store(true, Ordering::SeqCst);
                shutdown_live_connections(&shared);
                maybe_finish(&shared);
                break;
            }
        })
        .map_err(Error::Transport)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::pool::ReactorPoolConfig;

    #[test]
    fn binds_ephemeral_port_and_stops_cleanly() {
        let pool = ReactorPool::start(ReactorPoolConfig {
            concurrency: 2,
            thread_name_prefix: "test-accept".into(),
        })
        .unwrap();

        let server = AcceptServer::start(
            pool.clone(),
            AcceptServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                install_signal_handlers: false,
            },
            |_stream, _addr, _cancel| async move {},
        )
        .unwrap();

        assert!(server.local_addr().is_some());
        server.stop();
        server.wait();
        pool.stop();
    }
}
