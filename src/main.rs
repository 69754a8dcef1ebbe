//! frameshift: a streaming caret-protocol server
//!
//! Every accepted connection gets a `*` handshake, after which payload bytes
//! framed by `^` and `$` are shifted by one and streamed straight back.
//!
//! Features:
//! - One task per connection, with independent parser state
//! - Output written as bytes arrive, never buffered per frame
//! - Connection limit and optional per-operation idle timeout
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        idle_timeout = ?config.idle_timeout,
        "Starting frameshift server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("frameshift-worker");
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::bind(&config)?;
        server.run(shutdown_signal()).await;
        Ok::<_, server::ServerError>(())
    })?;

    Ok(())
}

/// Resolves on Ctrl-C. If the signal handler cannot be installed the server
/// runs until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
