//! natproxy-server: NAT-traversal relay binary

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use natproxy_server::{RelayServer, ServerConfig};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    let config = ServerConfig::load()?;
    info!(
        listeners = config.listeners.len(),
        workers = config.worker_threads,
        "Starting natproxy-server"
    );

    let server = RelayServer::new(config)?;
    if let Err(e) = server.run() {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
