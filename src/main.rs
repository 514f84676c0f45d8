mod config;
mod git;
mod http;
mod job;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::job::JobSender;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "patchbay", about = "Git patch submission webhook")]
struct Cli {
    /// Path to the YAML configuration file.  Every setting has a default;
    /// the service runs without one.
    #[arg(short, long)]
    config: Option<String>,

    /// TCP port for the HTTP listener.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
///
/// The queue sender is the producer half of the rendezvous channel; the
/// single worker task holds the consumer half.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub queue: JobSender,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>, port: u16) -> Result<()> {
    let app = http::create_router(state);

    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    let config = Arc::new(config);
    let port = cli.port.unwrap_or(config.http.port);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(%port, "starting patchbay");

    // ---- Ensure the worker root exists ----
    tokio::fs::create_dir_all(&config.worker.workdir_root)
        .await
        .with_context(|| {
            format!(
                "failed to create worker root: {}",
                config.worker.workdir_root
            )
        })?;

    // ---- HTTP client for URL-supplied patches ----
    let http_client = reqwest::Client::builder()
        .user_agent("patchbay/0.1")
        .build()
        .context("failed to build reqwest client")?;

    // ---- Queue and worker ----
    let (queue_tx, queue_rx) = job::job_queue();

    let worker_handle = tokio::spawn(worker::run_worker(Arc::clone(&config), queue_rx));

    // ---- App state ----
    let state = Arc::new(AppState {
        config,
        http_client,
        queue: queue_tx,
    });

    // ---- Serve until shutdown ----
    run_http_server(state, port).await?;

    // The server owned the last queue sender; with it gone the worker
    // drains any in-flight job and exits.
    let _ = worker_handle.await;

    tracing::info!("patchbay shut down cleanly");
    Ok(())
}
