//! Cache wire protocol
//!
//! Handshake:
//! [u16 len][secret] [u16 len][namespace]  ->  [u16 len][namespace]
//!
//! Commands, one byte each, followed by their fixed-layout arguments:
//! - `g` [32 digest][u32 slot]
//! - `p` [32 digest][u32 slot][u64 size][size bytes]
//! - `u` [32 digest][u32 slot][1 sub-op 'g'|'p'][u16 len][url]
//! - `c` [u16 days]
//!
//! Get responses: [1 status '+'|'-'][32 digest][u32 slot][u64 size][body]

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::storage::StorageError;
use crate::stream::{read_full, write_full};

/// Digest length in bytes
pub const DIGEST_LEN: usize = 32;

/// Encoded artifact key: digest + slot
pub const KEY_LEN: usize = DIGEST_LEN + 4;

/// Encoded get response header: status + key + size
pub const RESPONSE_HEADER_LEN: usize = 1 + KEY_LEN + 8;

/// Body chunk size used when streaming artifacts
pub const BODY_CHUNK: usize = 64 << 10;

/// Namespace directory reserved for pending writes
pub const TEMP_NAMESPACE: &str = "temp";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("unknown pull-through mode: {0:#04x}")]
    UnknownPullMode(u8),

    #[error("invalid response status: {0:#04x}")]
    BadStatus(u8),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("secret rejected")]
    SecretRejected,

    #[error("invalid namespace: {0:?}")]
    InvalidNamespace(String),

    #[error("response channel closed")]
    ChannelClosed,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ProtocolError {
    /// True when the peer simply went away between frames
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
        ))
    }
}

/// 32-byte artifact digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Create a digest from raw bytes
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    /// Parse from a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Digest(bytes))
    }

    /// Convert to lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity of a stored artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub digest: Digest,
    pub slot: u32,
}

impl ArtifactKey {
    pub fn new(digest: Digest, slot: u32) -> Self {
        Self { digest, slot }
    }

    /// Encode into the first `KEY_LEN` bytes of `out`
    pub fn encode(&self, out: &mut [u8]) {
        out[..DIGEST_LEN].copy_from_slice(self.digest.as_bytes());
        BigEndian::write_u32(&mut out[DIGEST_LEN..KEY_LEN], self.slot);
    }

    /// Decode from the first `KEY_LEN` bytes of `buf`
    pub fn decode(buf: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[..DIGEST_LEN]);
        Self {
            digest: Digest(digest),
            slot: BigEndian::read_u32(&buf[DIGEST_LEN..KEY_LEN]),
        }
    }

    /// Read an encoded key from the stream
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; KEY_LEN];
        read_full(reader, &mut buf)?;
        Ok(Self::decode(&buf))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.digest, self.slot)
    }
}

/// Command bytes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fetch an artifact
    Get = b'g',
    /// Store an artifact streamed inline
    Put = b'p',
    /// Pull-through from an HTTP origin
    Pull = b'u',
    /// Trigger a retention sweep
    Clean = b'c',
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'g' => Ok(Command::Get),
            b'p' => Ok(Command::Put),
            b'u' => Ok(Command::Pull),
            b'c' => Ok(Command::Clean),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// Sub-operation following a pull-through command
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Serve from the origin when missing, persisting on the way
    Get = b'g',
    /// Persist from the origin in the background, no response
    Put = b'p',
}

impl TryFrom<u8> for PullMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'g' => Ok(PullMode::Get),
            b'p' => Ok(PullMode::Put),
            _ => Err(ProtocolError::UnknownPullMode(value)),
        }
    }
}

/// Get response status
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Hit = b'+',
    Miss = b'-',
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'+' => Ok(Status::Hit),
            b'-' => Ok(Status::Miss),
            _ => Err(ProtocolError::BadStatus(value)),
        }
    }
}

/// Header preceding every get response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
    pub key: ArtifactKey,
    pub size: u64,
}

impl ResponseHeader {
    pub fn hit(key: ArtifactKey, size: u64) -> Self {
        Self { status: Status::Hit, key, size }
    }

    pub fn miss(key: ArtifactKey) -> Self {
        Self { status: Status::Miss, key, size: 0 }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0] = self.status as u8;
        self.key.encode(&mut buf[1..1 + KEY_LEN]);
        let size = match self.status {
            Status::Hit => self.size,
            Status::Miss => 0,
        };
        BigEndian::write_u64(&mut buf[1 + KEY_LEN..], size);
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let status = Status::try_from(buf[0])?;
        let key = ArtifactKey::decode(&buf[1..1 + KEY_LEN]);
        let size = BigEndian::read_u64(&buf[1 + KEY_LEN..]);
        if status == Status::Miss && size != 0 {
            return Err(ProtocolError::Malformed(format!(
                "miss for {} carries size {}",
                key, size
            )));
        }
        Ok(Self { status, key, size })
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        read_full(reader, &mut buf)?;
        Self::decode(&buf)
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_full(writer, &self.encode())
    }
}

/// Check that a client-supplied namespace is usable as one directory name.
pub fn validate_namespace(namespace: &str) -> Result<(), ProtocolError> {
    let bad = namespace.is_empty()
        || namespace == "."
        || namespace == ".."
        || namespace == TEMP_NAMESPACE
        || namespace.contains(&['/', '\\', '\0'][..]);
    if bad {
        return Err(ProtocolError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}
