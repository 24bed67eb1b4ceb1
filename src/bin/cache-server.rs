//! Artifact cache server binary
//!
//! Settings come from an optional TOML file; command-line flags override it.

use artifact_cache::{CacheServer, Config};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "cache-server")]
#[command(about = "Networked build artifact cache", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Storage root directory
    #[arg(long)]
    path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,

    /// In-memory hot tier budget in bytes; 0 disables it
    #[arg(long)]
    hot_tier_capacity: Option<u64>,

    /// Shared secret granting write access
    #[arg(long)]
    secret: Option<String>,

    /// Serve clients with a wrong secret read-only
    #[arg(long, conflicts_with = "deny_unsafe_reads")]
    allow_unsafe_reads: bool,

    /// Drop clients with a wrong secret
    #[arg(long)]
    deny_unsafe_reads: bool,

    /// Serve synthetic bodies and discard uploads
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        let server = &mut config.server;
        if let Some(bind) = self.bind {
            server.bind = bind;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(path) = self.path {
            server.storage_root = path;
        }
        if let Some(level) = self.log_level {
            server.log_level = level;
        }
        if let Some(capacity) = self.hot_tier_capacity {
            server.hot_tier_capacity = capacity;
        }
        if let Some(secret) = self.secret {
            server.secret = secret;
        }
        if self.allow_unsafe_reads {
            server.allow_unsafe_reads = true;
        }
        if self.deny_unsafe_reads {
            server.allow_unsafe_reads = false;
        }
        if self.dry_run {
            server.dry_run = true;
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        process::exit(1);
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str())).init();

    log::info!("Starting artifact cache server");
    log::info!("  Listen address: {}", config.server.listen_addr());
    log::info!("  Storage root: {}", config.server.storage_root.display());
    log::info!("  Hot tier capacity: {} bytes", config.server.hot_tier_capacity);
    log::info!("  Unsafe reads: {}", config.server.allow_unsafe_reads);
    if config.server.dry_run {
        log::warn!("  Dry run: uploads are discarded");
    }

    let server = match CacheServer::new(&config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to create server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        log::error!("Server error: {}", e);
        process::exit(1);
    }
}
