//! Switchboard Broker
//!
//! Relays JSON frames between WebSocket connections that share a channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use switchboard_broker::{BrokerError, ChannelBroker};
use switchboard_core::config::load_config;
use switchboard_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "switchboard-broker")]
#[command(version, about = "Switchboard broker - WebSocket fan-out by named channel")]
struct Args {
    /// Address to listen on. Overrides the configured `broker.addr`.
    #[arg(long, env = "SWITCHBOARD_ADDR")]
    addr: Option<SocketAddr>,

    /// Extra JSON config file layered over global and project settings.
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().ok();
    let config = load_config(cwd.as_deref(), args.config.as_deref()).map_err(BrokerError::from)?;

    init_tracing(
        &format!("switchboard_broker={}", config.broker.log_level),
        args.log_json,
    );

    let addr = match args.addr {
        Some(addr) => addr,
        None => config
            .broker
            .addr
            .parse()
            .map_err(|source| BrokerError::InvalidAddr {
                addr: config.broker.addr.clone(),
                source,
            })?,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting switchboard-broker"
    );

    let broker = Arc::new(ChannelBroker::new());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = switchboard_broker::serve(listener, Arc::clone(&broker)) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let stats = broker.status().stats;
    info!(
        total_connections = stats.total_connections,
        messages_received = stats.messages_received,
        "Broker stopped"
    );
    Ok(())
}
