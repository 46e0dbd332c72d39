use clap::Parser;
use node_lib::{Connection, NodeConfig};
use serde::Deserialize;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_chrome::{ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::prelude::*;

/// Serve the addax content store and action cache over gRPC.
#[derive(Parser, Debug)]
#[command(name = "addax-node", version, long_about = None)]
struct Args {
    /// Node configuration, see `addax.toml`
    #[arg(long, default_value = "addax.toml")]
    config: PathBuf,

    /// Listen here instead of the configured address
    #[arg(long)]
    address: Option<SocketAddr>,

    /// Write a chrome trace (open it in https://ui.perfetto.dev)
    #[arg(long)]
    trace: bool,
}

#[derive(Debug, Deserialize)]
struct Config {
    node: NodeConfig,
}

impl Config {
    async fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("reading {}: {e}", path.display()))?;
        Ok(toml::from_str(&text)?)
    }
}

/// The guard flushes the trace file when dropped, keep it until exit.
fn init_tracing(trace: bool) -> Option<FlushGuard> {
    if !trace {
        tracing_subscriber::fmt::init();
        return None;
    }
    let (chrome_layer, guard) = ChromeLayerBuilder::new()
        .include_args(true)
        .trace_style(TraceStyle::Async)
        .build();
    tracing_subscriber::registry().with(chrome_layer).init();
    Some(guard)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _guard = init_tracing(args.trace);

    let Config { node } = Config::load(&args.config).await?;
    let address = args.address.unwrap_or(node.address);
    info!(%address, backend = ?node.storage_backend, "starting addax node");

    tokio::select! {
        served = node_lib::start_addax(Connection::Tcp(address), node.storage_backend, node.service) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!("interrupted, shutting down");
        }
    }
    Ok(())
}
