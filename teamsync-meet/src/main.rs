mod config;
mod logging;
mod server;
mod websocket;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use teamsync_conference::SignalingRelay;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "teamsync-meet")]
#[command(about = "TeamSync meeting signaling relay", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(short, long, env = "TEAMSYNC_CONFIG_PATH")]
    config: Option<String>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    logging::init_logging(&config.logging)?;
    info!("TeamSync meet server starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        max_participants = config.relay.max_participants_per_room,
        stun_servers = config.conference.stun_servers.len(),
        "Relay configured"
    );

    let relay = Arc::new(SignalingRelay::new(config.relay.clone()));
    server::serve(config, relay).await
}
