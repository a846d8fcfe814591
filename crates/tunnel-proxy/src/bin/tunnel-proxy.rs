//! SOCKS5 server process
//!
//! Runs a server from a TOML configuration file and/or command line flags
//! until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tunnel_proxy::{DnsStrategy, ServerConfig, ServerEvent, SocksServer};

#[derive(Parser)]
#[command(name = "tunnel-proxy")]
#[command(about = "SOCKS5 proxy server with upstream chaining", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Resolve destinations with the system resolver
    #[arg(long)]
    system_dns: bool,

    /// Upstream SOCKS5 proxy URL, may be repeated to build a chain
    #[arg(short, long = "forward", value_name = "URL")]
    forward: Vec<String>,
}

impl Cli {
    async fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load_from_file(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if self.system_dns {
            config.dns = DnsStrategy::System;
        }
        if !self.forward.is_empty() {
            config.forward_chain = Some(self.forward.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunnel_proxy=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.server_config().await?;

    let mut server = SocksServer::new(config);
    let mut events = server.subscribe();
    let addr = server.start().await?;
    info!("Listening on {}", addr);

    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} server events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;
    watcher.abort();
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::Connection { peer } => debug!("Connection from {}", peer),
        ServerEvent::Request { peer, host, port } => info!("{} requested {}:{}", peer, host, port),
        ServerEvent::Connected { peer } => debug!("{} connected", peer),
        ServerEvent::ConnectError { peer, reason } => warn!("{} failed: {}", peer, reason),
    }
}
