//! warpmeshd — the warpmesh daemon.
//!
//! Single binary that runs one cluster's side of the mesh:
//! - State store (redb) holding what this cluster publishes
//! - Store API that peers mirror from
//! - Cluster mesh connecting to every peer in the descriptor directory
//! - Mesh diagnostics
//!
//! # Usage
//!
//! ```text
//! warpmeshd run --config /etc/warpmesh/warpmeshd.toml
//! warpmeshd run --cluster-name east --cluster-id 1 --descriptors-dir ./clusters
//! ```

mod config;
mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use warpmesh_clustermesh::{ClusterMesh, ConfigDirectory, HttpDialer, ObjectCache};
use warpmesh_state::{ClusterCapabilities, ClusterConfig, StateStore, Subsystem, SyncStore};

use crate::config::{DaemonConfig, Settings};

#[derive(Parser)]
#[command(name = "warpmeshd", about = "warpmesh daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the local store and connect to every configured peer.
    Run {
        /// Path to warpmeshd.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Name of the local cluster.
        #[arg(long)]
        cluster_name: Option<String>,

        /// ID of the local cluster (0 for none).
        #[arg(long)]
        cluster_id: Option<u32>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Directory holding one descriptor file per remote cluster.
        #[arg(long)]
        descriptors_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warpmesh=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            cluster_name,
            cluster_id,
            port,
            data_dir,
            descriptors_dir,
        } => {
            let file = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            let overrides = DaemonConfig {
                cluster_name,
                cluster_id,
                port,
                data_dir,
                descriptors_dir,
                ..Default::default()
            };
            run(file.merge(overrides).resolve()?).await
        }
    }
}

/// Advertise the local cluster to peers. The store is the complete local
/// snapshot once opened, so every subsystem is certified synced.
fn publish_local(store: &StateStore, settings: &Settings) -> anyhow::Result<()> {
    let mesh = &settings.mesh;
    let config = ClusterConfig {
        id: mesh.cluster_id,
        capabilities: ClusterCapabilities {
            synced_canaries: true,
            max_connected_clusters: mesh.max_connected_clusters,
        },
    };
    store.set_cluster_config(&mesh.cluster_name, &config)?;
    for subsystem in Subsystem::ALL {
        SyncStore::new(store.clone(), &mesh.cluster_name, subsystem).synced()?;
    }
    info!(cluster = %mesh.cluster_name, cluster_id = mesh.cluster_id, "local cluster config published");
    Ok(())
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(cluster = %settings.mesh.cluster_name, "warpmesh daemon starting");

    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.data_dir.join("warpmesh.redb");

    // ── Local store ────────────────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    publish_local(&store, &settings)?;

    // ── Cluster mesh ───────────────────────────────────────────

    let cache = ObjectCache::new();
    let dialer = HttpDialer::new(settings.mesh.connect_timeout);
    let mesh = Arc::new(ClusterMesh::new(
        settings.mesh.clone(),
        Arc::new(dialer),
        cache.observers(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let descriptors = ConfigDirectory::new(&settings.descriptors_dir)
        .with_poll_interval(settings.poll_interval);
    let events = descriptors.watch(shutdown_rx.clone());

    let mesh_handle = tokio::spawn({
        let mesh = Arc::clone(&mesh);
        async move {
            mesh.run(events, shutdown_rx).await;
        }
    });

    // ── API server ─────────────────────────────────────────────

    let router = warpmesh_api::build_router(store).merge(status::router(Arc::clone(&mesh)));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for CTRL+C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Closing the mesh retracts every mirrored object and releases IDs.
    if let Err(e) = mesh_handle.await {
        warn!(error = %e, "cluster mesh task failed");
    }
    info!(mirrored = cache.len(), "warpmesh daemon stopped");
    Ok(())
}
