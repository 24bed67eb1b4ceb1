//! Networked artifact cache
//!
//! A TCP server that stores immutable build artifacts keyed by a 32-byte
//! digest plus a slot number, with an optional in-memory hot tier, an
//! HTTP pull-through origin and an age-based sweeper. The matching client
//! engine speaks the same pipelined binary protocol.

pub mod client;
pub mod config;
pub mod origin;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod stream;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ClientEngine, ClientError};
pub use config::Config;
pub use protocol::{ArtifactKey, Digest, ProtocolError};
pub use server::CacheServer;
pub use storage::{Storage, StorageError};
