//! meshfs-csi — CSI driver daemon for MeshFS volumes.
//!
//! Parses startup flags, initializes tracing, constructs the storage
//! backend and [`Driver`], recovers state from a previous run, and serves
//! the CSI endpoint until interrupted.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use libcsi::backend::StorageBackend;
use libcsi::backend::memory::MemoryBackend;
use libcsi::backend::meshfs::MeshFsBackend;
use libcsi::transport::CsiServer;
use libcsi::{Driver, DriverConfig};

/// Which storage backend serves the volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Disk-backed MeshFS volumes under `--data-root`.
    Meshfs,
    /// In-memory volumes; for development only.
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "meshfs-csi", about = "CSI driver for MeshFS volumes", version)]
struct Cli {
    /// Driver name advertised to the orchestrator.
    #[arg(long, default_value = "meshfs-csi")]
    name: String,

    /// Unique identifier of this node.
    #[arg(long)]
    node_id: String,

    /// Address the CSI endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:9809")]
    endpoint: SocketAddr,

    /// Storage backend to serve volumes from.
    #[arg(long, value_enum, default_value_t = BackendKind::Meshfs)]
    backend: BackendKind,

    /// Data root for MeshFS volume object stores.
    #[arg(long, default_value = "/var/lib/meshfs-csi")]
    data_root: PathBuf,

    /// PEM-encoded server certificate chain.
    #[arg(long)]
    cert: PathBuf,

    /// PEM-encoded private key.
    #[arg(long)]
    key: PathBuf,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_tls(cert: &Path, key: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert).with_context(|| format!("open certificate {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse certificate chain")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key).with_context(|| format!("open key {}", key.display()))?,
    ))
    .context("parse private key")?
    .context("no private key found in key file")?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate or key")
}

async fn run<B: StorageBackend>(cli: Cli, backend: Arc<B>) -> anyhow::Result<()> {
    let tls = load_tls(&cli.cert, &cli.key)?;

    let driver = Arc::new(Driver::new(
        DriverConfig {
            name: cli.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: cli.node_id.clone(),
            endpoint: cli.endpoint,
        },
        backend,
    ));
    driver.initialize().await?;

    let server = CsiServer::new(cli.endpoint, tls, Arc::clone(&driver))?;

    tokio::select! {
        res = server.serve() => res.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            server.endpoint().close(0u32.into(), b"shutdown");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.backend {
        BackendKind::Meshfs => {
            let backend = Arc::new(MeshFsBackend::new(&cli.data_root).await?);
            run(cli, backend).await
        }
        BackendKind::Memory => run(cli, Arc::new(MemoryBackend::new())).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_requires_node_id() {
        let err = Cli::try_parse_from(["meshfs-csi", "--cert", "c.pem", "--key", "k.pem"]);
        assert!(err.is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from([
            "meshfs-csi",
            "--node-id",
            "node-01",
            "--cert",
            "c.pem",
            "--key",
            "k.pem",
        ])
        .unwrap();
        assert_eq!(cli.name, "meshfs-csi");
        assert_eq!(cli.backend, BackendKind::Meshfs);
        assert_eq!(cli.endpoint, "0.0.0.0:9809".parse().unwrap());
        assert_eq!(cli.data_root, PathBuf::from("/var/lib/meshfs-csi"));
        assert!(!cli.log_json);
    }
}
