//! Grove MDS server binary: one metadata server rank.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use grove_core::MdsId;
use grove_server::{Journal, MdsConfig, MdsMap, MdsMapHandle, MdsNode, QueueTransport};

#[derive(Debug, Parser)]
#[command(name = "grove-mds", about = "Grove metadata server")]
struct Args {
    /// Rank of this MDS within the cluster.
    #[arg(long, env = "GROVE_MDS_RANK", default_value_t = 0)]
    rank: u16,

    /// Path to the migration journal. In-memory when omitted.
    #[arg(long, env = "GROVE_MDS_JOURNAL")]
    journal: Option<PathBuf>,

    /// Interval between liveness beacons (ms).
    #[arg(long, default_value_t = 4000)]
    beacon_interval_ms: u64,

    /// Grace period without a beacon before a peer is declared failed (ms).
    #[arg(long, default_value_t = 15_000)]
    beacon_grace_ms: u64,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = MdsConfig {
        rank: MdsId(args.rank),
        beacon_interval_ms: args.beacon_interval_ms,
        beacon_grace_ms: args.beacon_grace_ms,
        ..MdsConfig::default()
    };

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let journal = match &args.journal {
        Some(path) => Journal::open(path)?,
        None => Journal::in_memory(),
    };
    let replayed = journal.replay();
    if !replayed.is_empty() {
        tracing::info!(subtrees = replayed.len(), "recovered journal outcomes");
    }

    let mdsmap = Arc::new(MdsMapHandle::new(MdsMap::with_active([config.rank])));
    let transport = Arc::new(QueueTransport::new());
    let mut node = MdsNode::new(config, journal, mdsmap, transport);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(rank = %node.rank(), "grove-mds starting");
    node.run(shutdown_rx).await
}
