//! S1: an `AcceptServer` running an echo handler serves many concurrent clients cleanly and
//! stops on request.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use corert::net::{AcceptServer, AcceptServerConfig};
use corert::reactor::pool::{ReactorPool, ReactorPoolConfig};

#[test]
fn echo_server_serves_many_clients_then_stops_cleanly() {
    let pool = ReactorPool::start(ReactorPoolConfig {
        concurrency: 4,
        thread_name_prefix: "s1-reactor".into(),
    })
    .unwrap();

    let server = AcceptServer::start(
        pool.clone(),
        AcceptServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            install_signal_handlers: false,
        },
        |stream, _addr, cancel| async move {
            let mut buf = [0u8; 1024];
            loop {
                let read_fut = stream.read(&mut buf);
                let cancel_fut = cancel.wait();
                futures::pin_mut!(read_fut);
                futures::pin_mut!(cancel_fut);
                let n = match futures::future::select(read_fut, cancel_fut).await {
                    futures::future::Either::Left((Ok(n), _)) => n,
                    _ => break,
                };
                if n == 0 {
                    break;
                }
                if stream.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        },
    )
    .unwrap();

    let addr = server.local_addr().unwrap();

    let clients: Vec<_> = (0..20)
        .map(|_| {
            std::thread::spawn(move || {
                let mut socket = TcpStream::connect(addr).unwrap();
                for _ in 0..50 {
                    socket.write_all(b"hello\n").unwrap();
                    let mut buf = [0u8; 6];
                    socket.read_exact(&mut buf).unwrap();
                    assert_eq!(&buf, b"hello\n");
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    server.stop();
    server.wait();
    pool.stop();
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn accept_server_handle_is_send_sync() {
    assert_send_sync::<Arc<AcceptServer>>();
}
