//! Per-connection sender
//!
//! Answers queued gets strictly in the order the receiver read them. This
//! is the only writer on the socket once the handshake is done.

use super::connection::GetRequest;
use super::ServerContext;
use crate::protocol::{ProtocolError, ResponseHeader, BODY_CHUNK, RESPONSE_HEADER_LEN};
use crate::storage::{NullHandle, ReadHandle};
use crate::stream::{copy_exact, write_full};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::Receiver;
use std::time::Instant;

/// Body size served for every get in dry-run mode
pub const DRY_RUN_SIZE: u64 = 2 << 20;

/// Drain `queue` until the receiver hangs up or a write fails
pub(super) fn run(mut stream: TcpStream, queue: Receiver<GetRequest>, namespace: &str, context: &ServerContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let started = Instant::now();
    let mut outgoing = 0u64;
    let mut buf = vec![0u8; BODY_CHUNK];

    for request in queue.iter() {
        match respond(&mut stream, request, namespace, context, &mut buf) {
            Ok(sent) => outgoing += sent,
            Err(e) => {
                if e.is_disconnect() {
                    log::debug!("send to {} stopped: {}", peer, e);
                } else {
                    log::error!("send to {} failed: {}", peer, e);
                }
                break;
            }
        }
    }

    // Unblocks the receiver if it is still reading
    let _ = stream.shutdown(Shutdown::Both);

    let elapsed = started.elapsed().as_secs_f64();
    if outgoing > 0 && elapsed > 0.0 {
        log::info!(
            "closed w {} size={} elapsed={:.3}s speed={:.0}B/s",
            peer,
            outgoing,
            elapsed,
            outgoing as f64 / elapsed
        );
    } else {
        log::info!("closed w {}", peer);
    }
}

/// Write one get response, returning the bytes sent
fn respond<W: Write>(
    writer: &mut W,
    request: GetRequest,
    namespace: &str,
    context: &ServerContext,
    buf: &mut [u8],
) -> Result<u64, ProtocolError> {
    let key = request.key;
    let source = match request.source {
        Some(source) => Some(source),
        None if context.dry_run => Some(ReadHandle::Null(NullHandle::new(DRY_RUN_SIZE))),
        None => match context.storage.open_artifact(namespace, &key) {
            Ok(source) => source,
            Err(e) => {
                log::warn!("get {} lookup failed, answering miss: {}", key, e);
                None
            }
        },
    };

    let Some(mut source) = source else {
        log::debug!("mis --- {}", key);
        ResponseHeader::miss(key).write_to(writer)?;
        return Ok(RESPONSE_HEADER_LEN as u64);
    };

    let size = source.size();
    ResponseHeader::hit(key, size).write_to(writer)?;

    match source {
        ReadHandle::Memory(ref memory) => write_full(writer, memory.remaining())?,
        ref mut streamed => {
            copy_exact(streamed, writer, size, buf)?;
        }
    }

    let kind = source.kind();
    match source.finish() {
        Ok(true) => log::debug!("get {} committed pull-through copy", key),
        Ok(false) => {}
        Err(e) => log::warn!("get {} pull-through copy discarded: {}", key, e),
    }
    log::debug!("get success {} size={} source={}", key, size, kind);

    Ok(RESPONSE_HEADER_LEN as u64 + size)
}
