//! Veil proxy node binary.
//!
//! Accepts newline-delimited JSON client requests over TCP and delivers
//! responses to each client's registered listening address.

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use veil_proxy::{net, Proxy, ProxyConfig, TcpResponseSink};

/// Veil - transactional proxy for oblivious storage
#[derive(Parser)]
#[command(name = "veil-proxy", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address, overrides the configuration file
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Listening port, overrides the configuration file
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let responses = Arc::new(TcpResponseSink::new());
    let proxy = Arc::new(Proxy::new(config.clone(), responses)?);

    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    info!(
        "veil proxy starting on {}:{}",
        config.bind_address, config.port
    );
    net::serve(proxy, listener).await?;
    Ok(())
}
