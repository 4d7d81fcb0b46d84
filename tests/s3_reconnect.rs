//! S3: a `ClientChannel` pointed at a server that disappears and reappears eventually observes
//! `Connected` again, and `shutdown` completes promptly even while disconnected.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corert::net::{ClientChannel, ClientChannelConfig};
use corert::net::ClientChannelStatus;
use corert::reactor::pool::{ReactorPool, ReactorPoolConfig};

#[test]
fn client_channel_reconnects_after_server_returns() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stop_accepting = Arc::new(AtomicBool::new(false));
    let stop_accepting2 = stop_accepting.clone();

    // A plain-blocking accept loop standing in for "a server that accepts for a while, stops,
    // then accepts again", rebinding the same address in the gap.
    let server = std::thread::spawn(move || {
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_millis(300);
        while std::time::Instant::now() < deadline {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(listener);
        std::thread::sleep(Duration::from_millis(400));

        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        while !stop_accepting2.load(Ordering::SeqCst) {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let pool = ReactorPool::start(ReactorPoolConfig {
        concurrency: 1,
        thread_name_prefix: "s3-reactor".into(),
    })
    .unwrap();

    let channel = ClientChannel::new(pool.next().clone(), ClientChannelConfig::new("127.0.0.1", addr.port()));

    // First attempt lands in the gap where nothing is listening; expect it to fail within its
    // deadline rather than hang.
    let _ = channel.connect(500);

    // Let the background reconnect (triggered below) have a chance once the server is back.
    channel.handle_error_status();
    std::thread::sleep(Duration::from_millis(900));
    let reconnected = channel.connect(2_000);
    assert!(reconnected.is_ok() || channel.status() == ClientChannelStatus::Connected);

    let shutdown_start = std::time::Instant::now();
    channel.shutdown();
    assert!(shutdown_start.elapsed() < Duration::from_secs(1));

    stop_accepting.store(true, Ordering::SeqCst);
    server.join().unwrap();
    pool.stop();
}
