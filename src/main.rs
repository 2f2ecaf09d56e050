//! linechat: a line-oriented TCP text server
//!
//! Clients connect over TCP and exchange newline-terminated messages:
//! - `hello`, `/time`, `/echo <text>` and free text get a reply
//! - `bye` or `/quit` closes the connection after the goodbye
//! - silent clients are disconnected after the idle timeout
//!
//! Every received message is also appended to a per-client transcript file.

mod clock;
mod command;
mod config;
mod server;
mod session;
mod transcript;

use clock::SystemClock;
use config::Config;
use server::Server;
use std::sync::Arc;
use tracing::info;
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
        host = %config.host,
        port = config.port,
        timeout_secs = config.idle_timeout_secs,
        transcript_dir = %config.transcript_dir.display(),
        "Starting linechat server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(serve(config))
}

/// Bind and accept until Ctrl-C. In-flight sessions end with the process.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config, Arc::new(SystemClock)).await?;

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested, no longer accepting connections");
        }
    }
    Ok(())
}
