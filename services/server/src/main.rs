// Millrace server entry point.
use std::sync::Arc;

use anyhow::Result;
use millrace_server::{MemoryDocManager, QueryManager, Server, ServerConfig, observability};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env_or_yaml()?;
    observability::init_metrics(config.metrics_bind)?;

    let server = Server::bind(config, Arc::new(MemoryDocManager::new()), QueryManager::new()).await?;
    tracing::info!(addr = %server.local_addr()?, "millrace server started");

    let accept_task = tokio::spawn(server.serve());

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    accept_task.abort();
    tracing::info!("millrace server stopped");
    Ok(())
}
