//! S4: a `RangeReader` reading an object from a server that truncates the stream partway
//! through recovers by reopening with a `Range` header, and the caller observes exactly the
//! original bytes, no loss, no duplication.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use corert::net::range_reader::{RangeReader, RangeReaderConfig};
use corert::net::StaticToken;
use corert::threadpool::{FiberQueueThreadPool, ThreadPoolConfig};

const OBJECT_LEN: usize = 200_000;
const TRUNCATE_AT: usize = 50_000;

fn object_bytes() -> Vec<u8> {
    (0..OBJECT_LEN).map(|i| (i % 256) as u8).collect()
}

/// Parses just enough of an HTTP/1.1 request to find a `Range: bytes=N-` start offset.
fn parse_range_start(request: &str) -> usize {
    for line in request.lines() {
        if let Some(rest) = line.strip_prefix("Range: bytes=") {
            if let Some(start) = rest.trim_end_matches('-').split('-').next() {
                return start.parse().unwrap_or(0);
            }
        }
    }
    0
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).unwrap() == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn run_server(listener: TcpListener, body: Arc<Vec<u8>>) {
    let mut connection_count = 0;
    loop {
        let Ok((mut stream, _)) = listener.accept() else {
            break;
        };
        connection_count += 1;
        let request = read_request(&mut stream);
        if request.is_empty() {
            break;
        }
        let start = parse_range_start(&request);
        if start >= body.len() {
            break;
        }
        let remaining = &body[start..];
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            remaining.len()
        );
        let _ = stream.write_all(header.as_bytes());

        if connection_count == 1 {
            // Truncate partway through the very first response, then drop the connection.
            let cut = TRUNCATE_AT.saturating_sub(start).min(remaining.len());
            let _ = stream.write_all(&remaining[..cut]);
            drop(stream);
        } else {
            let _ = stream.write_all(remaining);
            drop(stream);
            break;
        }
    }
}

#[test]
fn range_reader_resumes_after_mid_stream_truncation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(object_bytes());
    let body_for_server = body.clone();

    let server = std::thread::spawn(move || run_server(listener, body_for_server));

    let offload = FiberQueueThreadPool::start(ThreadPoolConfig {
        workers: 2,
        thread_name_prefix: "s4-offload".into(),
        ..Default::default()
    })
    .unwrap();

    let config = RangeReaderConfig::new(format!("http://{addr}"), "test-bucket", "test-object.bin");
    let reader = RangeReader::new(offload.clone(), config, Arc::new(StaticToken("test-token".into()))).unwrap();

    let mut collected = Vec::with_capacity(OBJECT_LEN);
    let mut buf = vec![0u8; 16 * 1024];

    futures::executor::block_on(async {
        loop {
            let offset = collected.len() as u64;
            let n = reader.read(offset, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
    });

    assert_eq!(collected.len(), body.len());
    assert_eq!(collected, *body);

    offload.shutdown();
    server.join().unwrap();
}
