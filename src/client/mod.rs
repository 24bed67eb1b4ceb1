//! Cache client engine
//!
//! One blocking TCP connection speaking the cache protocol. Gets can be
//! pipelined with [`ClientEngine::send_get`] / [`ClientEngine::recv_get`];
//! responses arrive in the order the requests were sent.

pub mod workload;

use crate::protocol::{ArtifactKey, ProtocolError, ResponseHeader, Status, KEY_LEN};
use crate::stream::{copy_exact, read_string, write_full, write_string};
use byteorder::{BigEndian, ByteOrder};
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use thiserror::Error;

pub use workload::{download, stress, upload, DownloadReport, Entity, StressOptions, StressReport};

/// Transfer buffer size
const CLIENT_BUF: usize = 32 << 10;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("namespace not echoed: sent {sent:?}, got {echoed:?}")]
    VersionMismatch { sent: String, echoed: String },

    #[error("response for {actual} while waiting for {expected}")]
    KeyMismatch {
        expected: ArtifactKey,
        actual: ArtifactKey,
    },

    #[error("integrity check failed for {key}: {detail}")]
    Integrity { key: ArtifactKey, detail: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connected cache client
pub struct ClientEngine {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    namespace: String,
    buf: Vec<u8>,
}

impl ClientEngine {
    /// Connect and complete the handshake
    pub fn connect<A: ToSocketAddrs>(addr: A, secret: &str, namespace: &str) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut engine = Self {
            reader: BufReader::with_capacity(CLIENT_BUF, stream.try_clone()?),
            writer: stream,
            namespace: namespace.to_string(),
            buf: vec![0u8; CLIENT_BUF],
        };

        write_string(&mut engine.writer, &mut engine.buf, secret)?;
        write_string(&mut engine.writer, &mut engine.buf, namespace)?;
        let echoed = read_string(&mut engine.reader, &mut engine.buf)?;
        if echoed != namespace {
            return Err(ClientError::VersionMismatch {
                sent: namespace.to_string(),
                echoed,
            });
        }

        log::debug!("connected to {} namespace={}", engine.peer_addr()?, namespace);
        Ok(engine)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.writer.peer_addr()
    }

    /// Fetch one artifact into `out`; `None` on a miss
    pub fn get<W: Write + ?Sized>(&mut self, key: &ArtifactKey, out: &mut W) -> ClientResult<Option<u64>> {
        self.send_get(key)?;
        self.recv_get(key, out)
    }

    /// Queue a get without waiting for its response
    pub fn send_get(&mut self, key: &ArtifactKey) -> ClientResult<()> {
        let mut frame = [0u8; 1 + KEY_LEN];
        frame[0] = b'g';
        key.encode(&mut frame[1..]);
        write_full(&mut self.writer, &frame)?;
        Ok(())
    }

    /// Read the next get response, which must be for `key`
    pub fn recv_get<W: Write + ?Sized>(&mut self, key: &ArtifactKey, out: &mut W) -> ClientResult<Option<u64>> {
        let header = ResponseHeader::read_from(&mut self.reader)?;
        if header.key != *key {
            return Err(ClientError::KeyMismatch {
                expected: *key,
                actual: header.key,
            });
        }
        match header.status {
            Status::Miss => Ok(None),
            Status::Hit => {
                let received = copy_exact(&mut self.reader, out, header.size, &mut self.buf)?;
                Ok(Some(received))
            }
        }
    }

    /// Upload exactly `size` bytes read from `body`
    pub fn put<R: Read + ?Sized>(&mut self, key: &ArtifactKey, size: u64, body: &mut R) -> ClientResult<()> {
        let mut frame = [0u8; 1 + KEY_LEN + 8];
        frame[0] = b'p';
        key.encode(&mut frame[1..]);
        BigEndian::write_u64(&mut frame[1 + KEY_LEN..], size);
        write_full(&mut self.writer, &frame)?;
        copy_exact(body, &mut self.writer, size, &mut self.buf)?;
        Ok(())
    }

    /// Get through the server's origin bridge
    pub fn pull_get<W: Write + ?Sized>(
        &mut self,
        key: &ArtifactKey,
        url: &str,
        out: &mut W,
    ) -> ClientResult<Option<u64>> {
        self.send_pull(key, b'g', url)?;
        self.recv_get(key, out)
    }

    /// Ask the server to fetch and store `url` in the background
    pub fn pull_put(&mut self, key: &ArtifactKey, url: &str) -> ClientResult<()> {
        self.send_pull(key, b'p', url)
    }

    fn send_pull(&mut self, key: &ArtifactKey, mode: u8, url: &str) -> ClientResult<()> {
        let mut frame = [0u8; 2 + KEY_LEN];
        frame[0] = b'u';
        key.encode(&mut frame[1..]);
        frame[1 + KEY_LEN] = mode;
        write_full(&mut self.writer, &frame)?;
        write_string(&mut self.writer, &mut self.buf, url)?;
        Ok(())
    }

    /// Request a sweep of files not read for `days` days
    pub fn clean(&mut self, days: u16) -> ClientResult<()> {
        let mut frame = [0u8; 3];
        frame[0] = b'c';
        BigEndian::write_u16(&mut frame[1..], days);
        write_full(&mut self.writer, &frame)?;
        Ok(())
    }

    /// Close both directions of the connection
    pub fn close(self) -> ClientResult<()> {
        match self.writer.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Digest;
    use crate::test_support::{spawn_origin, spawn_server, wait_until, OriginReply, SECRET};
    use std::io::Cursor;

    const NAMESPACE: &str = "cliv2.0";

    fn key(fill: u8, slot: u32) -> ArtifactKey {
        ArtifactKey::new(Digest::from_bytes([fill; 32]), slot)
    }

    #[test]
    fn test_put_get_round_trip() {
        let server = spawn_server(0, true);
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();
        let body = vec![0x5A; 70_000];

        engine.put(&key(1, 0), body.len() as u64, &mut Cursor::new(&body)).unwrap();
        let mut out = Vec::new();
        assert_eq!(engine.get(&key(1, 0), &mut out).unwrap(), Some(70_000));
        assert_eq!(out, body);
        assert_eq!(engine.namespace(), NAMESPACE);
    }

    #[test]
    fn test_get_miss_writes_nothing() {
        let server = spawn_server(0, true);
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();
        let mut out = Vec::new();
        assert_eq!(engine.get(&key(0xFF, 0), &mut out).unwrap(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn test_pipelined_gets() {
        let server = spawn_server(0, true);
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();
        engine.put(&key(2, 0), 3, &mut &b"one"[..]).unwrap();
        engine.put(&key(2, 1), 3, &mut &b"two"[..]).unwrap();

        engine.send_get(&key(2, 0)).unwrap();
        engine.send_get(&key(2, 1)).unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        engine.recv_get(&key(2, 0), &mut first).unwrap();
        engine.recv_get(&key(2, 1), &mut second).unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"two");
    }

    #[test]
    fn test_out_of_order_receive_is_key_mismatch() {
        let server = spawn_server(0, true);
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();
        engine.send_get(&key(3, 0)).unwrap();

        let result = engine.recv_get(&key(4, 0), &mut io::sink());
        assert!(matches!(result, Err(ClientError::KeyMismatch { .. })));
    }

    #[test]
    fn test_pull_get_and_pull_put() {
        let server = spawn_server(0, true);
        let url = spawn_origin(OriginReply::Sized(b"from origin".to_vec()));
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();

        let mut out = Vec::new();
        assert_eq!(engine.pull_get(&key(5, 0), &url, &mut out).unwrap(), Some(11));
        assert_eq!(out, b"from origin");

        engine.pull_put(&key(5, 1), &url).unwrap();
        let location = server.context.storage.location(NAMESPACE, &key(5, 1));
        assert!(wait_until(|| location.exists()));
    }

    #[test]
    fn test_clean_is_fire_and_forget() {
        let server = spawn_server(0, true);
        let mut engine = ClientEngine::connect(server.addr, SECRET, NAMESPACE).unwrap();
        engine.clean(30).unwrap();
        // The connection keeps working after a clean
        assert_eq!(engine.get(&key(6, 0), &mut io::sink()).unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn test_rejected_secret_fails_handshake() {
        let server = spawn_server(0, false);
        let result = ClientEngine::connect(server.addr, "wrong", NAMESPACE);
        assert!(result.is_err());
    }
}
