use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use formgate::config::FormgateConfig;
use formgate::http::{demo, HttpServer};
use formgate::ratelimit::{
    spawn_reclaimer, ClientStore, MemoryStore, ReclaimerConfig, TokenSigner, WindowEnforcer,
};

/// Signed-token rate limiting for form submissions.
#[derive(Debug, Parser)]
#[command(name = "formgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Formgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FormgateConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    let rl = &config.rate_limiting;
    info!(
        bind_addr = %config.server.bind_addr,
        default_window_secs = rl.default_window_secs,
        reclaim_interval_secs = rl.reclaim_interval_secs,
        routes = rl.routes.len(),
        "Configuration loaded"
    );

    let signer = match &rl.token_secret {
        Some(secret) => TokenSigner::new(secret.as_bytes()),
        None => {
            warn!("No token secret configured; issued tokens will not survive a restart");
            TokenSigner::generate()
        }
    };

    let store = Arc::new(match &rl.snapshot_path {
        Some(path) => MemoryStore::load_snapshot(path)?,
        None => MemoryStore::new(),
    });

    let enforcer = Arc::new(WindowEnforcer::new(
        Arc::new(signer),
        store.clone() as Arc<dyn ClientStore>,
        rl.default_window(),
    ));

    let reclaimer = spawn_reclaimer(
        store.clone(),
        ReclaimerConfig {
            interval: rl.reclaim_interval(),
        },
    );

    let router = demo::router(enforcer, rl);
    let server = HttpServer::new(config.server.bind_addr, router);

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    reclaimer.shutdown().await;

    if let Some(path) = &config.rate_limiting.snapshot_path {
        if let Err(e) = store.save_snapshot(path) {
            warn!(path = %path.display(), error = %e, "Failed to save rate limit snapshot");
        }
    }

    served?;
    info!("Formgate stopped");
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
