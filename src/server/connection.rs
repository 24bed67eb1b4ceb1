//! Per-connection receiver
//!
//! Performs the handshake, then reads commands until the peer goes away.
//! Gets are handed to the paired sender thread through a rendezvous
//! channel; puts are consumed inline so the next command is only read once
//! the body is fully received.

use super::sender;
use super::ServerContext;
use crate::protocol::{validate_namespace, ArtifactKey, Command, ProtocolError, PullMode, KEY_LEN};
use crate::storage::{ArtifactSink, NullHandle, ReadHandle};
use crate::stream::{copy_exact, read_full, read_string, write_string};
use byteorder::{BigEndian, ByteOrder};
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Receive buffer size
const RECV_BUF: usize = 16 << 10;

/// What a connection may do, decided once at handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// Secret matched: full access
    ReadWrite,
    /// Secret mismatched: put bodies are drained and dropped
    ReadOnly,
}

/// Connection state fixed by the handshake
#[derive(Debug, Clone)]
pub struct Session {
    pub policy: SessionPolicy,
    pub namespace: String,
}

impl Session {
    pub fn writable(&self) -> bool {
        self.policy == SessionPolicy::ReadWrite
    }
}

/// A get waiting for the sender.
///
/// `source` is only filled in by pull-through gets that already opened an
/// origin body; otherwise the sender looks the artifact up itself.
pub struct GetRequest {
    pub key: ArtifactKey,
    pub source: Option<ReadHandle>,
}

/// Handle a client connection from handshake to close
pub(super) fn handle_client(stream: TcpStream, context: Arc<ServerContext>) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            log::warn!("Dropping connection without peer address: {}", e);
            return;
        }
    };
    log::info!("connected {}", peer);

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed for {}: {}", peer, e);
    }

    match serve(stream, peer, &context) {
        Ok(stats) => log_closed(peer, &stats),
        Err(e) if e.is_disconnect() => log::info!("closed r {} ({})", peer, e),
        Err(e) => log::warn!("closed r {}: {}", peer, e),
    }
}

struct ReceiveStats {
    incoming: u64,
    started: Instant,
}

fn log_closed(peer: SocketAddr, stats: &ReceiveStats) {
    let elapsed = stats.started.elapsed().as_secs_f64();
    if stats.incoming > 0 && elapsed > 0.0 {
        log::info!(
            "closed r {} size={} elapsed={:.3}s speed={:.0}B/s",
            peer,
            stats.incoming,
            elapsed,
            stats.incoming as f64 / elapsed
        );
    } else {
        log::info!("closed r {}", peer);
    }
}

fn serve(stream: TcpStream, peer: SocketAddr, context: &Arc<ServerContext>) -> Result<ReceiveStats, ProtocolError> {
    let mut reader = BufReader::with_capacity(RECV_BUF, stream.try_clone()?);
    let mut writer = stream.try_clone()?;
    let mut buf = vec![0u8; RECV_BUF];

    let session = handshake(&mut reader, &mut writer, &mut buf, context)?;
    log::debug!(
        "handshake {} namespace={} policy={:?}",
        peer,
        session.namespace,
        session.policy
    );

    // Ready: from here on only the sender writes to the socket
    drop(writer);
    let (requests, queue) = mpsc::sync_channel::<GetRequest>(0);
    let sender = {
        let context = Arc::clone(context);
        let namespace = session.namespace.clone();
        thread::Builder::new()
            .name(format!("send {}", peer))
            .spawn(move || sender::run(stream, queue, &namespace, &context))?
    };

    let mut stats = ReceiveStats {
        incoming: 0,
        started: Instant::now(),
    };
    let result = receive_loop(&mut reader, &session, &requests, context, &mut buf, &mut stats);

    // Closing the channel lets the sender drain and shut the socket down
    drop(requests);
    if sender.join().is_err() {
        log::error!("sender thread for {} panicked", peer);
    }
    result.map(|()| stats)
}

/// Read the secret and namespace, echo the namespace back
fn handshake<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    context: &ServerContext,
) -> Result<Session, ProtocolError> {
    let secret = read_string(reader, buf)?;
    let policy = if secret == context.secret {
        SessionPolicy::ReadWrite
    } else if context.allow_unsafe_reads {
        SessionPolicy::ReadOnly
    } else {
        return Err(ProtocolError::SecretRejected);
    };

    let namespace = read_string(reader, buf)?;
    validate_namespace(&namespace)?;
    write_string(writer, buf, &namespace)?;

    Ok(Session { policy, namespace })
}

fn receive_loop<R: Read>(
    reader: &mut R,
    session: &Session,
    requests: &SyncSender<GetRequest>,
    context: &Arc<ServerContext>,
    buf: &mut [u8],
    stats: &mut ReceiveStats,
) -> Result<(), ProtocolError> {
    loop {
        let mut command = [0u8; 1];
        match reader.read(&mut command) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        stats.incoming += 1;

        match Command::try_from(command[0])? {
            Command::Clean => {
                let mut days = [0u8; 2];
                read_full(reader, &mut days)?;
                stats.incoming += 2;
                let days = BigEndian::read_u16(&days);
                log::debug!("clean {} days={}", session.namespace, days);
                context.sweeper.trigger(&session.namespace, days);
            }
            Command::Get => {
                let key = ArtifactKey::read_from(reader)?;
                stats.incoming += KEY_LEN as u64;
                log::debug!("get {}", key);
                requests
                    .send(GetRequest { key, source: None })
                    .map_err(|_| ProtocolError::ChannelClosed)?;
            }
            Command::Put => {
                let key = ArtifactKey::read_from(reader)?;
                let mut size = [0u8; 8];
                read_full(reader, &mut size)?;
                let size = BigEndian::read_u64(&size);
                stats.incoming += KEY_LEN as u64 + 8;
                receive_put(reader, session, context, &key, size, buf)?;
                stats.incoming += size;
            }
            Command::Pull => {
                let key = ArtifactKey::read_from(reader)?;
                let mut mode = [0u8; 1];
                read_full(reader, &mut mode)?;
                let mode = PullMode::try_from(mode[0])?;
                let url = read_string(reader, buf)?;
                stats.incoming += KEY_LEN as u64 + 3 + url.len() as u64;
                match mode {
                    PullMode::Get => {
                        log::debug!("pull get {} from {}", key, url);
                        let source = open_pull_source(session, context, &key, &url);
                        requests
                            .send(GetRequest { key, source })
                            .map_err(|_| ProtocolError::ChannelClosed)?;
                    }
                    PullMode::Put => {
                        log::debug!("pull put {} from {}", key, url);
                        spawn_pull_put(session, context, key, url);
                    }
                }
            }
        }
    }
}

/// Stream a put body into storage, or drain it when it must not be kept
fn receive_put<R: Read>(
    reader: &mut R,
    session: &Session,
    context: &ServerContext,
    key: &ArtifactKey,
    size: u64,
    buf: &mut [u8],
) -> Result<(), ProtocolError> {
    log::debug!("put {} size={}", key, size);

    let mut sink = if !session.writable() || context.dry_run || size == 0 {
        ArtifactSink::Null(NullHandle::default())
    } else {
        ArtifactSink::Disk(context.storage.create(&session.namespace, key, size)?)
    };

    copy_exact(reader, &mut sink, size, buf)?;

    if let Some(written) = sink.commit()? {
        log::debug!("put success {} size={}", key, written);
    }
    Ok(())
}

/// Open an origin body for a pull-through get, if the artifact is missing
fn open_pull_source(
    session: &Session,
    context: &ServerContext,
    key: &ArtifactKey,
    url: &str,
) -> Option<ReadHandle> {
    if context.dry_run || context.storage.contains(&session.namespace, key) {
        return None;
    }
    match context.origin.passthrough(&context.storage, &session.namespace, key, url) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::debug!("pull get {} from {} not admitted: {}", key, url, e);
            None
        }
    }
}

/// Persist an origin body in the background
fn spawn_pull_put(session: &Session, context: &Arc<ServerContext>, key: ArtifactKey, url: String) {
    if context.dry_run {
        log::debug!("pull put {} ignored in dry run", key);
        return;
    }

    let context = Arc::clone(context);
    let namespace = session.namespace.clone();
    let spawned = thread::Builder::new()
        .name("pull".to_string())
        .spawn(move || {
            match context.origin.persist(&context.storage, &namespace, &key, &url) {
                Ok(size) => log::debug!("pull put success {} size={} from {}", key, size, url),
                Err(e) => log::warn!("pull put {} from {} failed: {}", key, url, e),
            }
        });
    if let Err(e) = spawned {
        log::error!("failed to start pull thread: {}", e);
    }
}
