//! Cache TCP server
//!
//! Accepts client connections and runs one receiver thread plus one paired
//! sender thread per connection.

mod connection;
mod sender;

pub use connection::{GetRequest, Session, SessionPolicy};

use crate::config::Config;
use crate::origin::{OriginError, OriginFetcher};
use crate::storage::{Storage, StorageError};
use crate::sweeper::Sweeper;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("origin client error: {0}")]
    Origin(#[from] OriginError),
}

/// Process-wide state shared by every connection
pub struct ServerContext {
    pub storage: Arc<Storage>,
    pub sweeper: Arc<Sweeper>,
    pub origin: OriginFetcher,
    pub secret: String,
    pub allow_unsafe_reads: bool,
    pub dry_run: bool,
}

impl ServerContext {
    /// Build the shared state described by `config`
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let server = &config.server;
        let storage = Arc::new(Storage::open(&server.storage_root, server.hot_tier_capacity)?);
        Ok(Self {
            sweeper: Arc::new(Sweeper::new(Arc::clone(&storage))),
            storage,
            origin: OriginFetcher::new(config.origin.timeout())?,
            secret: server.secret.clone(),
            allow_unsafe_reads: server.allow_unsafe_reads,
            dry_run: server.dry_run,
        })
    }
}

/// Cache TCP server
pub struct CacheServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl CacheServer {
    /// Bind the listener and open storage
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let context = Arc::new(ServerContext::from_config(config)?);
        let listener = TcpListener::bind(config.server.listen_addr())?;
        Ok(Self { listener, context })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Run the accept loop
    pub fn run(&self) -> io::Result<()> {
        log::info!("Cache server listening on {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let context = Arc::clone(&self.context);
                    let spawned = thread::Builder::new()
                        .name("recv".to_string())
                        .spawn(move || connection::handle_client(stream, context));
                    if let Err(e) = spawned {
                        log::error!("Failed to spawn connection thread: {}", e);
                    }
                }
                Err(e) => {
                    log::error!("Connection error: {}", e);
                }
            }
        }

        Ok(())
    }
}
