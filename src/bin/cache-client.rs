//! Artifact cache command-line client
//!
//! Commands:
//! - get / put: transfer one artifact to or from a file
//! - pull-get / pull-put: go through the server's origin bridge
//! - clean: ask the server to sweep old artifacts
//! - stress: concurrent random upload/download workload

use anyhow::{bail, Context, Result};
use artifact_cache::client::{stress, StressOptions};
use artifact_cache::protocol::DIGEST_LEN;
use artifact_cache::{ArtifactKey, ClientEngine, Digest};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::fs::{self, File};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cache-client")]
#[command(about = "Artifact cache client", long_about = None)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    /// Server port
    #[arg(short, long, default_value_t = 9966)]
    port: u16,

    /// Shared secret
    #[arg(long, default_value = "artifact-cache")]
    secret: String,

    /// Cache namespace
    #[arg(short, long, default_value = "cliv2.0")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an artifact into a file
    Get {
        /// Artifact id: 64 hex chars, or text padded to 32 bytes
        id: String,

        /// Slot number
        #[arg(short, long, default_value_t = 0)]
        slot: u32,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Upload a file as an artifact
    Put {
        /// Artifact id: 64 hex chars, or text padded to 32 bytes
        id: String,

        /// File to upload
        path: PathBuf,

        /// Slot number
        #[arg(short, long, default_value_t = 0)]
        slot: u32,
    },

    /// Download an artifact, fetching it from an origin URL when missing
    PullGet {
        /// Artifact id: 64 hex chars, or text padded to 32 bytes
        id: String,

        /// Origin URL
        url: String,

        /// Slot number
        #[arg(short, long, default_value_t = 0)]
        slot: u32,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Ask the server to fetch an origin URL in the background
    PullPut {
        /// Artifact id: 64 hex chars, or text padded to 32 bytes
        id: String,

        /// Origin URL
        url: String,

        /// Slot number
        #[arg(short, long, default_value_t = 0)]
        slot: u32,
    },

    /// Remove artifacts not read for a number of days
    Clean {
        /// Age threshold in days
        #[arg(short, long, default_value_t = 30)]
        days: u16,
    },

    /// Upload random artifacts and read them back
    Stress {
        /// Concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,

        /// Entities per connection
        #[arg(short, long, default_value_t = 16)]
        entities: usize,

        /// Check sizes and SHA-256 of everything downloaded
        #[arg(long)]
        verify: bool,
    },
}

/// Parse an artifact id: 64 hex chars, else raw bytes padded or truncated
fn parse_digest(id: &str) -> Digest {
    if let Ok(digest) = Digest::from_hex(id) {
        return digest;
    }
    let mut bytes = [0u8; DIGEST_LEN];
    let raw = id.as_bytes();
    let n = raw.len().min(DIGEST_LEN);
    bytes[..n].copy_from_slice(&raw[..n]);
    Digest::from_bytes(bytes)
}

fn output_file(dir: &Path, key: &ArtifactKey) -> Result<(PathBuf, File)> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", key.digest.to_hex(), key.slot));
    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok((path, file))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let addr = (cli.addr.as_str(), cli.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", cli.addr, cli.port))?
        .next()
        .with_context(|| format!("No address for {}:{}", cli.addr, cli.port))?;

    let connect = || {
        ClientEngine::connect(addr, &cli.secret, &cli.namespace)
            .with_context(|| format!("Failed to connect to {}", addr))
    };

    match cli.command {
        Commands::Get { ref id, slot, ref output } => {
            let key = ArtifactKey::new(parse_digest(id), slot);
            let mut engine = connect()?;
            let (path, mut file) = output_file(output, &key)?;
            match engine.get(&key, &mut file).context("Get failed")? {
                Some(size) => println!("{} -> {} ({} bytes)", key, path.display(), size),
                None => {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    bail!("{} not found", key);
                }
            }
            engine.close()?;
        }

        Commands::Put { ref id, ref path, slot } => {
            let key = ArtifactKey::new(parse_digest(id), slot);
            let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
            let size = file.metadata()?.len();
            let mut engine = connect()?;
            engine.put(&key, size, &mut file).context("Put failed")?;
            engine.close()?;
            println!("{} <- {} ({} bytes)", key, path.display(), size);
        }

        Commands::PullGet {
            ref id,
            ref url,
            slot,
            ref output,
        } => {
            let key = ArtifactKey::new(parse_digest(id), slot);
            let mut engine = connect()?;
            let (path, mut file) = output_file(output, &key)?;
            match engine.pull_get(&key, url, &mut file).context("Pull get failed")? {
                Some(size) => println!("{} -> {} ({} bytes)", key, path.display(), size),
                None => {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    bail!("{} not found and not fetched from {}", key, url);
                }
            }
            engine.close()?;
        }

        Commands::PullPut { ref id, ref url, slot } => {
            let key = ArtifactKey::new(parse_digest(id), slot);
            let mut engine = connect()?;
            engine.pull_put(&key, url).context("Pull put failed")?;
            engine.close()?;
            println!("{} queued from {}", key, url);
        }

        Commands::Clean { days } => {
            let mut engine = connect()?;
            engine.clean(days).context("Clean failed")?;
            engine.close()?;
            println!("Requested sweep of files older than {} days", days);
        }

        Commands::Stress {
            connections,
            entities,
            verify,
        } => {
            let report = stress(&StressOptions {
                addr,
                secret: cli.secret.clone(),
                namespace: cli.namespace.clone(),
                connections,
                entities,
                verify,
            })
            .context("Stress run failed")?;
            println!(
                "{} entities, {} bytes up, {} bytes down, {} misses",
                report.entities, report.uploaded, report.downloaded.bytes, report.downloaded.misses
            );
        }
    }

    Ok(())
}
