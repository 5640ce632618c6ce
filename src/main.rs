use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::pipeline::{
    chain, EchoHandler, ErrorStage, PanicStage, RateLimiterStage, RequestIdStage,
};
use turnstile::server::Server;

/// Echo service guarded by per-client token-bucket rate limiting.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Override the per-client requests per second
    #[arg(long)]
    qps: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(qps) = args.qps {
        config.rate_limiting.qps = qps;
    }
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        qps = config.rate_limiting.qps,
        "Configuration loaded"
    );

    let mut builder = RateLimiterStage::builder(config.rate_limiting.qps);
    if let Some(interval) = config.rate_limiting.cleanup_interval() {
        builder = builder.cleanup_interval(interval);
    }
    if let Some(threshold) = config.rate_limiting.idle_threshold() {
        builder = builder.idle_threshold(threshold);
    }
    let (rate_limiter, limiter_shutdown) = builder.build()?;

    let handler = chain(
        Arc::new(EchoHandler),
        &[&ErrorStage, &RequestIdStage, &PanicStage, &rate_limiter],
    );

    let server = Server::bind(config.server.listen_addr, handler).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    limiter_shutdown.shutdown().await;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
