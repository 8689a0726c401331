use clap::Parser;
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::proxy::{ProxyServer, ProxyService};

/// Rate limiting forwarding proxy.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on (overrides configuration)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Downstream base URL (overrides configuration)
    #[arg(long)]
    downstream: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Sluice rate limiting proxy");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = SluiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(downstream) = cli.downstream {
        config.server.downstream_url = downstream;
    }
    config.validate()?;

    info!(
        listen_addr = %config.server.listen_addr,
        downstream = %config.server.downstream_url,
        read_burst = config.rate_limiting.read.burst,
        other_burst = config.rate_limiting.other.burst,
        trust_forwarded_for = config.rate_limiting.trust_forwarded_for,
        tarpit = config.tarpit.enabled,
        "Configuration loaded"
    );

    let service = ProxyService::from_config(&config)?;
    let server = ProxyServer::new(&config, service);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Sluice rate limiting proxy stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_parse() {
        let cli = Cli::try_parse_from([
            "sluice",
            "--config",
            "sluice.yaml",
            "--listen",
            "0.0.0.0:9000",
            "--downstream",
            "http://backend:8090",
            "--log-json",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some("sluice.yaml"));
        assert_eq!(cli.listen, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(cli.downstream.as_deref(), Some("http://backend:8090"));
        assert!(cli.log_json);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["sluice"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.log_json);
    }
}
