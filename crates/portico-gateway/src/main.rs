//! portico-gateway: public entry point of the tunnel.

use clap::Parser;
use portico_gateway::config::{GatewayConfig, Overrides};
use portico_gateway::Gateway;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Expose an agent's local service.
#[derive(Parser, Debug)]
#[command(name = "portico-gateway", version, about = "Public portico tunnel gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "BIND")]
    bind: Option<String>,

    /// Shared secret the agent puts in its connection path
    #[arg(long, env = "SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Verbose logging
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Minutes without requests before shutting down (0 disables)
    #[arg(long, env = "AUTO_SLEEP")]
    auto_sleep: Option<u64>,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "MAX_BODY_BYTES")]
    max_body_bytes: Option<usize>,

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

    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind,
        secret: cli.secret,
        debug: cli.debug,
        auto_sleep: cli.auto_sleep,
        max_body_bytes: cli.max_body_bytes,
    };
    let config = match GatewayConfig::load(cli.config.as_deref(), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        auto_sleep_minutes = config.auto_sleep_minutes,
        "starting portico-gateway"
    );

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr(), "failed to bind");
            std::process::exit(1);
        }
    };

    let gateway = Gateway::new(config);
    if let Err(e) = gateway.serve(listener, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
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
