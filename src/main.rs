use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::lookup_host;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use bitdht::{Dht, DhtSettings, DhtState};

const DEFAULT_ROUTERS: [&str; 2] = ["router.bittorrent.com:6881", "dht.transmissionbt.com:6881"];

#[derive(Parser, Debug)]
#[command(name = "bitdht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// Bootstrap router as HOST:PORT. Defaults to the public routers.
    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Vec<String>,

    /// Node ID and routing table, loaded at start and saved on exit.
    #[arg(short, long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Never answer queries and mark our queries read-only (BEP 43).
    #[arg(long)]
    read_only: bool,

    /// Drop nodes whose ID does not match their IP (BEP 42).
    #[arg(long)]
    enforce_node_id: bool,

    /// Upload rate limit for queries in bytes per second; 0 disables it.
    #[arg(long, default_value = "8000")]
    upload_rate_limit: usize,

    #[arg(short = 'i', long, default_value = "60")]
    status_interval: u64,
}

async fn resolve(hosts: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in hosts {
        match lookup_host(host.as_str()).await {
            Ok(addrs) => out.extend(addrs),
            Err(e) => warn!(host = %host, error = %e, "failed to resolve bootstrap router"),
        }
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let state = match &args.state {
        Some(path) if path.exists() => match DhtState::load(path).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable state file");
                None
            }
        },
        _ => None,
    };

    let settings = DhtSettings {
        read_only: args.read_only,
        enforce_node_id: args.enforce_node_id,
        upload_rate_limit: args.upload_rate_limit,
        ..DhtSettings::default()
    };

    let saved_nodes: Vec<SocketAddr> = state
        .as_ref()
        .map(|s| s.bootstrap_nodes().collect())
        .unwrap_or_default();

    let dht = Dht::bind(args.bind, settings, state)
        .await
        .context("failed to start DHT node")?;
    info!(id = %dht.node_id().await?, addr = %dht.local_addr(), "DHT node started");

    let hosts: Vec<String> = if args.bootstrap.is_empty() {
        DEFAULT_ROUTERS.iter().map(|s| s.to_string()).collect()
    } else {
        args.bootstrap.clone()
    };
    let want_v6 = dht.local_addr().is_ipv6();
    for router in resolve(&hosts).await {
        if router.is_ipv6() == want_v6 {
            dht.add_router(router).await?;
        }
    }

    info!(saved = saved_nodes.len(), "bootstrapping");
    let bootstrap = {
        let dht = dht.clone();
        tokio::spawn(async move {
            match dht.bootstrap(saved_nodes).await {
                Ok(nodes) => info!(closest = nodes.len(), "bootstrap complete"),
                Err(e) => warn!(error = %e, "bootstrap failed"),
            }
        })
    };

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = dht.status().await?;
                info!(
                    live = status.live_nodes,
                    replacements = status.replacement_nodes,
                    confirmed = status.confirmed_nodes,
                    buckets = status.buckets,
                    global_estimate = status.estimated_global_nodes,
                    outstanding = status.outstanding_queries,
                    traversals = status.running_traversals,
                    torrents = status.storage.torrents,
                    peers = status.storage.peers,
                    items = status.storage.immutable_data + status.storage.mutable_data,
                    external = ?status.external_address,
                    "status"
                );
            }
        }
    }

    if let Some(path) = &args.state {
        let state = dht.save_state().await?;
        state.save(path).await?;
        info!(path = %path.display(), nodes = state.nodes.len() + state.nodes6.len(), "saved state");
    }
    dht.quit().await;
    bootstrap.abort();

    Ok(())
}
