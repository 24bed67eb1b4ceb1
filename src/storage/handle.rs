//! Artifact handles
//!
//! Every artifact body moves through one of these. Readers come from disk,
//! the hot tier, a live origin response, or nowhere at all (dry runs);
//! writers either land on disk through a temp file or are discarded.

use super::hot::HotTier;
use super::{StorageError, StorageResult};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reads an artifact stored on disk
pub struct DiskHandle {
    file: File,
    size: u64,
}

impl DiskHandle {
    pub(crate) fn new(file: File, size: u64) -> Self {
        Self { file, size }
    }
}

/// Reads an artifact held by the hot tier
pub struct MemoryHandle {
    data: Arc<[u8]>,
    pos: usize,
}

impl MemoryHandle {
    pub fn new(data: Arc<[u8]>) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet read
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }
}

/// Relays an origin response body while persisting it.
///
/// Bytes read from this handle are also written to a pending write. If the
/// write fails the pending write is dropped and its temp file removed, but
/// reading continues so the waiting client still receives the body.
pub struct HttpPassthroughHandle {
    body: Box<dyn Read + Send>,
    sink: Option<PendingWrite>,
    size: u64,
    relayed: u64,
}

impl HttpPassthroughHandle {
    pub fn new(body: Box<dyn Read + Send>, sink: PendingWrite) -> Self {
        let size = sink.expected();
        Self {
            body,
            sink: Some(sink),
            size,
            relayed: 0,
        }
    }

    /// Commit the persisted copy if the whole body went through
    fn finish(mut self) -> StorageResult<bool> {
        match self.sink.take() {
            Some(sink) if self.relayed == self.size => {
                sink.commit()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Reads zeros for a declared length and swallows writes
#[derive(Debug, Default)]
pub struct NullHandle {
    remaining: u64,
    size: u64,
}

impl NullHandle {
    pub fn new(size: u64) -> Self {
        Self { remaining: size, size }
    }
}

impl Read for NullHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (buf.len() as u64).min(self.remaining) as usize;
        buf[..n].fill(0);
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl Write for NullHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Source of a get response body
pub enum ReadHandle {
    Disk(DiskHandle),
    Memory(MemoryHandle),
    HttpPassthrough(HttpPassthroughHandle),
    Null(NullHandle),
}

impl ReadHandle {
    /// Total body length announced in the response header
    pub fn size(&self) -> u64 {
        match self {
            ReadHandle::Disk(h) => h.size,
            ReadHandle::Memory(h) => h.data.len() as u64,
            ReadHandle::HttpPassthrough(h) => h.size,
            ReadHandle::Null(h) => h.size,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ReadHandle::Disk(_) => "disk",
            ReadHandle::Memory(_) => "memory",
            ReadHandle::HttpPassthrough(_) => "origin",
            ReadHandle::Null(_) => "null",
        }
    }

    /// Complete the read.
    ///
    /// For an origin passthrough this commits the persisted copy when the
    /// full body was relayed; returns whether anything was committed.
    pub fn finish(self) -> StorageResult<bool> {
        match self {
            ReadHandle::HttpPassthrough(h) => h.finish(),
            _ => Ok(false),
        }
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHandle::Disk(h) => h.file.read(buf),
            ReadHandle::Memory(h) => {
                let rest = &h.data[h.pos..];
                let n = rest.len().min(buf.len());
                buf[..n].copy_from_slice(&rest[..n]);
                h.pos += n;
                Ok(n)
            }
            ReadHandle::HttpPassthrough(h) => {
                let n = h.body.read(buf)?;
                h.relayed += n as u64;
                if n > 0 {
                    if let Some(sink) = h.sink.as_mut() {
                        if let Err(e) = sink.write_all(&buf[..n]) {
                            log::warn!(
                                "dropping pull-through copy of {:?}: {}",
                                sink.final_path(),
                                e
                            );
                            h.sink = None;
                        }
                    }
                }
                Ok(n)
            }
            ReadHandle::Null(h) => h.read(buf),
        }
    }
}

/// An artifact being written through a temp file.
///
/// The temp file is renamed onto the final location only by `commit`; a
/// handle dropped without committing removes its temp file.
pub struct PendingWrite {
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    expected: u64,
    written: u64,
    /// Copy kept for hot tier admission
    memory: Option<Vec<u8>>,
    hot: Arc<HotTier>,
    committed: bool,
}

impl PendingWrite {
    pub(crate) fn create(
        temp_path: PathBuf,
        final_path: PathBuf,
        expected: u64,
        hot: Arc<HotTier>,
    ) -> StorageResult<Self> {
        let file = File::create(&temp_path)?;
        let memory = hot
            .accepts(expected)
            .then(|| Vec::with_capacity(expected as usize));
        Ok(Self {
            file: Some(file),
            temp_path,
            final_path,
            expected,
            written: 0,
            memory,
            hot,
            committed: false,
        })
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Make the artifact visible at its final location.
    ///
    /// Fails without touching the final location unless exactly the declared
    /// number of bytes was written.
    pub fn commit(mut self) -> StorageResult<u64> {
        if self.written != self.expected {
            return Err(StorageError::SizeMismatch {
                expected: self.expected,
                written: self.written,
            });
        }

        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&self.temp_path, &self.final_path)?;
        self.committed = true;

        // Rename first, so the hot tier never serves something the disk lacks
        match self.memory.take() {
            Some(bytes) => {
                self.hot.admit(self.final_path.clone(), bytes.into());
            }
            None => {
                self.hot.evict(&self.final_path);
            }
        }

        Ok(self.written)
    }
}

impl Write for PendingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes past declared size {} (already {})",
                    buf.len(),
                    self.expected,
                    self.written
                ),
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pending write already closed"))?;
        let n = file.write(buf)?;
        if let Some(memory) = self.memory.as_mut() {
            memory.extend_from_slice(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        match fs::remove_file(&self.temp_path) {
            Ok(()) => log::debug!(
                "discarded partial write {:?} ({} of {} bytes)",
                self.temp_path,
                self.written,
                self.expected
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove temp file {:?}: {}", self.temp_path, e),
        }
    }
}

/// Destination of a put body
pub enum ArtifactSink {
    Disk(PendingWrite),
    Null(NullHandle),
}

impl ArtifactSink {
    /// Commit a disk write, returning its size; discarding sinks return `None`
    pub fn commit(self) -> StorageResult<Option<u64>> {
        match self {
            ArtifactSink::Disk(pending) => pending.commit().map(Some),
            ArtifactSink::Null(_) => Ok(None),
        }
    }
}

impl Write for ArtifactSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArtifactSink::Disk(h) => h.write(buf),
            ArtifactSink::Null(h) => h.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArtifactSink::Disk(h) => h.flush(),
            ArtifactSink::Null(h) => h.flush(),
        }
    }
}
