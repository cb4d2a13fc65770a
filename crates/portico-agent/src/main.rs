//! portico-agent: runs next to the private service and dials the gateway.

use anyhow::{Context, Result};
use clap::Parser;
use portico_agent::config::{AgentConfig, Overrides};
use portico_agent::ControlChannel;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Publish a local service through a portico gateway.
#[derive(Parser, Debug)]
#[command(name = "portico-agent", version, about = "Private-side portico tunnel agent")]
struct Cli {
    /// Gateway host[:port]
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Gateway protocol (http or https)
    #[arg(long, env = "REMOTE_PROTOCOL")]
    remote_protocol: Option<String>,

    /// Local service host[:port]
    #[arg(long = "local-host", env = "LOCALHOST")]
    local_host: Option<String>,

    /// Local service protocol (http or https)
    #[arg(long, env = "LOCAL_PROTOCOL")]
    local_protocol: Option<String>,

    /// Shared secret, must match the gateway's
    #[arg(long, env = "SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Verbose logging
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// What a local WebSocket failure tears down: tunnel or session
    #[arg(long, env = "BRIDGE_FAULT_SCOPE")]
    fault_scope: Option<String>,

    /// Config file path
    #[arg(long, env = "PORTICO_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_level = if cli.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        remote_host: cli.host,
        remote_protocol: cli.remote_protocol,
        local_host: cli.local_host,
        local_protocol: cli.local_protocol,
        secret: cli.secret,
        debug: cli.debug,
        fault_scope: cli.fault_scope,
    };
    let config =
        AgentConfig::load(cli.config.as_deref(), overrides).context("failed to load config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        remote = %config.remote_host,
        local = %config.local_host,
        fault_scope = ?config.fault_scope,
        "starting portico-agent"
    );

    let control = ControlChannel::new(&config).context("failed to set up control channel")?;
    tokio::select! {
        _ = Arc::clone(&control).run() => {}
        _ = shutdown_signal() => info!("received shutdown signal"),
    }
    control.shutdown().await;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
