//! HTTP origin pull-through
//!
//! Fetches missing artifacts from an HTTP origin with a plain GET. Only
//! successful responses announcing a positive `Content-Length` are admitted;
//! anything else leaves storage untouched.

use crate::protocol::{ArtifactKey, BODY_CHUNK};
use crate::storage::{HttpPassthroughHandle, ReadHandle, Storage, StorageError};
use crate::stream::copy_exact;
use reqwest::blocking::{Client, Response};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Origin fetch errors
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin answered with status {0}")]
    Status(u16),

    #[error("origin response has no usable content length")]
    UnknownLength,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Blocking HTTP client for pull-through requests
#[derive(Clone)]
pub struct OriginFetcher {
    client: Client,
}

impl OriginFetcher {
    /// Build a fetcher; `timeout` bounds each whole request, `None` waits forever
    pub fn new(timeout: Option<Duration>) -> Result<Self, OriginError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Issue the GET and return the response with its announced length
    pub fn fetch(&self, url: &str) -> Result<(Response, u64), OriginError> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(OriginError::Status(status.as_u16()));
        }
        match response.content_length() {
            Some(len) if len > 0 => Ok((response, len)),
            _ => Err(OriginError::UnknownLength),
        }
    }

    /// Open a body that serves one client while persisting under `key`
    pub fn passthrough(
        &self,
        storage: &Storage,
        namespace: &str,
        key: &ArtifactKey,
        url: &str,
    ) -> Result<ReadHandle, OriginError> {
        let (response, len) = self.fetch(url)?;
        let pending = storage.create(namespace, key, len)?;
        log::debug!("pull-through {} streaming {} bytes from {}", key, len, url);
        Ok(ReadHandle::HttpPassthrough(HttpPassthroughHandle::new(
            Box::new(response),
            pending,
        )))
    }

    /// Download the full body into storage under `key`
    pub fn persist(
        &self,
        storage: &Storage,
        namespace: &str,
        key: &ArtifactKey,
        url: &str,
    ) -> Result<u64, OriginError> {
        let (mut response, len) = self.fetch(url)?;
        let mut pending = storage.create(namespace, key, len)?;
        let mut buf = vec![0u8; BODY_CHUNK];
        copy_exact(&mut response, &mut pending, len, &mut buf)?;
        Ok(pending.commit()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Digest;
    use crate::test_support::{spawn_origin, OriginReply};
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn key(fill: u8) -> ArtifactKey {
        ArtifactKey::new(Digest::from_bytes([fill; 32]), 0)
    }

    #[test]
    fn test_persist_known_length() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let url = spawn_origin(OriginReply::Sized(b"from origin".to_vec()));

        let fetcher = OriginFetcher::new(None).unwrap();
        let written = fetcher.persist(&storage, "v1", &key(1), &url).unwrap();
        assert_eq!(written, 11);
        assert_eq!(fs::read(storage.location("v1", &key(1))).unwrap(), b"from origin");
    }

    #[test]
    fn test_chunked_response_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let url = spawn_origin(OriginReply::Chunked(b"no length".to_vec()));

        let fetcher = OriginFetcher::new(None).unwrap();
        let result = fetcher.persist(&storage, "v1", &key(2), &url);
        assert!(matches!(result, Err(OriginError::UnknownLength)));
        assert!(!storage.location("v1", &key(2)).exists());
    }

    #[test]
    fn test_error_status_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let url = spawn_origin(OriginReply::NotFound);

        let fetcher = OriginFetcher::new(None).unwrap();
        let result = fetcher.persist(&storage, "v1", &key(3), &url);
        assert!(matches!(result, Err(OriginError::Status(404))));
    }

    #[test]
    fn test_passthrough_tees_into_storage() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let body = vec![0x5A; 200_000];
        let url = spawn_origin(OriginReply::Sized(body.clone()));

        let fetcher = OriginFetcher::new(None).unwrap();
        let mut handle = fetcher.passthrough(&storage, "v1", &key(4), &url).unwrap();
        assert_eq!(handle.size(), body.len() as u64);

        let mut relayed = Vec::new();
        handle.read_to_end(&mut relayed).unwrap();
        assert_eq!(relayed, body);
        // Not visible until the handle is finished
        assert!(!storage.location("v1", &key(4)).exists());
        assert!(handle.finish().unwrap());
        assert_eq!(fs::read(storage.location("v1", &key(4))).unwrap(), body);
    }
}
