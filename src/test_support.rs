//! Helpers for end-to-end tests: a live server on an ephemeral port and a
//! minimal HTTP origin.

use crate::config::Config;
use crate::server::{CacheServer, ServerContext};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const SECRET: &str = "test-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub context: Arc<ServerContext>,
    _root: TempDir,
}

/// Start a server with the given hot tier budget and unsafe-read policy
pub fn spawn_server(hot_tier_capacity: u64, allow_unsafe_reads: bool) -> TestServer {
    spawn_server_with(|config| {
        config.server.hot_tier_capacity = hot_tier_capacity;
        config.server.allow_unsafe_reads = allow_unsafe_reads;
    })
}

/// Start a server after letting the caller adjust its configuration
pub fn spawn_server_with(adjust: impl FnOnce(&mut Config)) -> TestServer {
    let root = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.storage_root = root.path().to_path_buf();
    config.server.secret = SECRET.to_string();
    adjust(&mut config);

    let server = CacheServer::new(&config).unwrap();
    let addr = server.local_addr().unwrap();
    let context = Arc::clone(server.context());
    thread::spawn(move || server.run());

    TestServer {
        addr,
        context,
        _root: root,
    }
}

/// Poll `condition` for up to five seconds
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// How the test origin answers every request
#[derive(Clone)]
pub enum OriginReply {
    /// 200 with a Content-Length header
    Sized(Vec<u8>),
    /// 200 with chunked transfer encoding, no length
    Chunked(Vec<u8>),
    /// 404 with an empty body
    NotFound,
}

/// Serve `reply` to every request; returns the URL to fetch
pub fn spawn_origin(reply: OriginReply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let reply = reply.clone();
            thread::spawn(move || answer(stream, &reply));
        }
    });
    format!("http://{}/artifact", addr)
}

fn answer(mut stream: TcpStream, reply: &OriginReply) {
    // Consume the request head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }

    let mut response = Vec::new();
    match reply {
        OriginReply::Sized(body) => {
            response.extend_from_slice(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .as_bytes(),
            );
            response.extend_from_slice(body);
        }
        OriginReply::Chunked(body) => {
            response.extend_from_slice(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            );
            response.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
            response.extend_from_slice(body);
            response.extend_from_slice(b"\r\n0\r\n\r\n");
        }
        OriginReply::NotFound => {
            response.extend_from_slice(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
    }
    let _ = stream.write_all(&response);
}
