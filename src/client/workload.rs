//! Synthetic upload/download workload
//!
//! Random artifacts are generated on a producer thread and hashed with
//! SHA-256 while they stream to the server, so memory use does not depend
//! on artifact size. Downloads can be verified against those hashes.

use super::{ClientEngine, ClientError, ClientResult};
use crate::protocol::{ArtifactKey, Digest, BODY_CHUNK};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Instant;

/// Smallest primary payload
pub const MIN_PAYLOAD: u64 = 16 << 10;

/// Width of the primary payload size range
pub const PAYLOAD_SPAN: u64 = 2 << 20;

/// Chunks buffered between the producer and the socket
const PIPE_DEPTH: usize = 4;

/// An artifact written by [`upload`], with what is needed to verify it
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: Digest,
    /// SHA-256 of the slot 0 payload
    pub checksum0: [u8; 32],
    /// SHA-256 of the slot 1 payload, when one was written
    pub checksum1: Option<[u8; 32]>,
    /// Size of the slot 0 payload; slot 1 holds a tenth of it
    pub size: u64,
}

impl Entity {
    pub fn secondary_size(&self) -> u64 {
        self.size / 10
    }

    /// Slots present with their sizes and checksums
    fn slots(&self) -> Vec<(u32, u64, [u8; 32])> {
        let mut slots = vec![(0, self.size, self.checksum0)];
        if let Some(checksum) = self.checksum1 {
            slots.push((1, self.secondary_size(), checksum));
        }
        slots
    }
}

/// Outcome of a [`download`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub bytes: u64,
    pub hits: u32,
    pub misses: u32,
}

/// Read side of the producer pipe
struct PipeReader {
    chunks: Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn finish(hasher: Sha256) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Put `size` random bytes under `key`, returning their SHA-256
fn put_random(engine: &mut ClientEngine, key: &ArtifactKey, size: u64, seed: u64) -> ClientResult<[u8; 32]> {
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(PIPE_DEPTH);
    let producer = thread::Builder::new()
        .name("payload".to_string())
        .spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut hasher = Sha256::new();
            let mut remaining = size;
            while remaining > 0 {
                let mut chunk = vec![0u8; remaining.min(BODY_CHUNK as u64) as usize];
                rng.fill_bytes(&mut chunk);
                hasher.update(&chunk);
                remaining -= chunk.len() as u64;
                if tx.send(chunk).is_err() {
                    return None;
                }
            }
            Some(finish(hasher))
        })?;

    let mut pipe = PipeReader {
        chunks: rx,
        current: Vec::new(),
        offset: 0,
    };
    let sent = engine.put(key, size, &mut pipe);
    // Unblocks the producer if the put stopped early
    drop(pipe);

    let checksum = producer
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "payload producer panicked"))?;
    sent?;
    checksum.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "payload producer stopped early").into())
}

/// Upload a random entity: a primary payload and, two times in three, a
/// secondary payload a tenth of its size in slot 1.
pub fn upload<G: Rng>(engine: &mut ClientEngine, rng: &mut G) -> ClientResult<Entity> {
    let id = Digest::from_bytes(rng.gen());
    let size = MIN_PAYLOAD + rng.gen_range(0..PAYLOAD_SPAN);

    let checksum0 = put_random(engine, &ArtifactKey::new(id, 0), size, rng.gen())?;
    let checksum1 = if rng.gen_ratio(2, 3) {
        Some(put_random(engine, &ArtifactKey::new(id, 1), size / 10, rng.gen())?)
    } else {
        None
    };

    log::debug!("uploaded {} size={} secondary={}", id, size, checksum1.is_some());
    Ok(Entity {
        id,
        checksum0,
        checksum1,
        size,
    })
}

/// Byte counter with an optional running hash
struct Tally {
    count: u64,
    hasher: Option<Sha256>,
}

impl Write for Tally {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += buf.len() as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Fetch every slot of `entity`, checking size and SHA-256 when `verify`.
///
/// A miss is counted in the report; only corrupt content is an error.
pub fn download(engine: &mut ClientEngine, entity: &Entity, verify: bool) -> ClientResult<DownloadReport> {
    let mut report = DownloadReport::default();

    for (slot, size, checksum) in entity.slots() {
        let key = ArtifactKey::new(entity.id, slot);
        let mut tally = Tally {
            count: 0,
            hasher: verify.then(Sha256::new),
        };
        if engine.get(&key, &mut tally)?.is_none() {
            report.misses += 1;
            continue;
        }
        report.hits += 1;
        report.bytes += tally.count;

        let Some(hasher) = tally.hasher else { continue };
        if tally.count != size {
            return Err(ClientError::Integrity {
                key,
                detail: format!("size {} != {}", tally.count, size),
            });
        }
        let actual = finish(hasher);
        if actual != checksum {
            return Err(ClientError::Integrity {
                key,
                detail: format!("sha256 {} != {}", hex::encode(actual), hex::encode(checksum)),
            });
        }
    }
    Ok(report)
}

/// Parameters for [`stress`]
#[derive(Debug, Clone)]
pub struct StressOptions {
    pub addr: SocketAddr,
    pub secret: String,
    pub namespace: String,
    pub connections: usize,
    pub entities: usize,
    pub verify: bool,
}

/// Totals across all [`stress`] connections
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StressReport {
    pub uploaded: u64,
    pub entities: u64,
    pub downloaded: DownloadReport,
}

/// Upload `entities` entities on each of `connections` connections, then
/// download them back on the same connection.
pub fn stress(options: &StressOptions) -> ClientResult<StressReport> {
    let started = Instant::now();
    let workers: Vec<_> = (0..options.connections)
        .map(|n| {
            let options = options.clone();
            thread::Builder::new()
                .name(format!("stress-{}", n))
                .spawn(move || stress_connection(&options))
        })
        .collect::<Result<_, _>>()?;

    let mut total = StressReport::default();
    let mut failure = None;
    for worker in workers {
        let outcome = worker
            .join()
            .map_err(|_| ClientError::Io(io::Error::new(io::ErrorKind::Other, "stress worker panicked")))
            .and_then(|r| r);
        match outcome {
            Ok(report) => {
                total.uploaded += report.uploaded;
                total.entities += report.entities;
                total.downloaded.bytes += report.downloaded.bytes;
                total.downloaded.hits += report.downloaded.hits;
                total.downloaded.misses += report.downloaded.misses;
            }
            Err(e) => {
                log::error!("stress connection failed: {}", e);
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    let elapsed = started.elapsed().as_secs_f64();
    let moved = total.uploaded + total.downloaded.bytes;
    log::info!(
        "stress entities={} up={} down={} misses={} elapsed={:.3}s speed={:.0}B/s",
        total.entities,
        total.uploaded,
        total.downloaded.bytes,
        total.downloaded.misses,
        elapsed,
        if elapsed > 0.0 { moved as f64 / elapsed } else { 0.0 }
    );
    Ok(total)
}

fn stress_connection(options: &StressOptions) -> ClientResult<StressReport> {
    let mut engine = ClientEngine::connect(options.addr, &options.secret, &options.namespace)?;
    let mut rng = rand::thread_rng();
    let mut report = StressReport::default();

    let mut uploaded = Vec::with_capacity(options.entities);
    for _ in 0..options.entities {
        let entity = upload(&mut engine, &mut rng)?;
        report.uploaded += entity.size + entity.checksum1.map_or(0, |_| entity.secondary_size());
        uploaded.push(entity);
    }
    for entity in &uploaded {
        let downloaded = download(&mut engine, entity, options.verify)?;
        report.downloaded.bytes += downloaded.bytes;
        report.downloaded.hits += downloaded.hits;
        report.downloaded.misses += downloaded.misses;
    }
    report.entities = uploaded.len() as u64;
    engine.close()?;
    Ok(report)
}
