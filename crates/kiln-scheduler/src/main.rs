//! Kiln scheduler binary.
//!
//! Accepts worker, compile and monitor connections and serves the operator
//! HTTP endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kiln_scheduler::{api, Scheduler, SchedulerConfig, UserStore};
use kiln_state::{FileKv, KvBackend};

/// Kiln compile cluster scheduler.
#[derive(Parser, Debug)]
#[command(name = "kiln-scheduler")]
#[command(about = "Coordinate workers and compile requests for a kiln cluster")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kiln_scheduler=debug,kiln_state=debug,hyper=info,tower=info"
    } else {
        "kiln_scheduler=info,kiln_state=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Kiln scheduler starting");

    let config = SchedulerConfig::load(cli.config.as_deref())?;
    info!(
        listen_addr = %config.api.listen_addr,
        environments_dir = %config.storage.environments_dir.display(),
        database = %config.storage.database_path.display(),
        max_cache_size = ?config.storage.max_cache_size,
        "Configuration loaded"
    );

    let kv: Arc<dyn KvBackend> = Arc::new(FileKv::open(&config.storage.database_path).await?);
    let (scheduler, handle) = Scheduler::bootstrap(&config, kv.clone()).await?;

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let state = Arc::new(api::AppState {
        scheduler: handle,
        users: Arc::new(UserStore::new(kv)),
        channel_capacity: config.connection.channel_capacity,
        shutdown: shutdown.clone(),
    });
    let app = api::router(state);

    let listener = TcpListener::bind(&config.api.listen_addr).await?;
    info!(addr = %config.api.listen_addr, "Scheduler listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let serve_token = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }

    info!("Kiln scheduler shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}
