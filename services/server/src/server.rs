// Server assembly: shared registries and the TCP accept loop.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use millrace_log::LogRegistry;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::connection::run_connection;
use crate::docs::DocManager;
use crate::query::QueryManager;
use crate::subscription::DurableCursors;

/// State shared by every connection.
pub struct ServerState {
    pub config: ServerConfig,
    pub logs: LogRegistry,
    pub docs: Arc<dyn DocManager>,
    pub queries: QueryManager,
    pub durable: Arc<DurableCursors>,
    connections: std::sync::Mutex<HashSet<u64>>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn register_connection(&self) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("connection registry lock")
            .insert(conn_id);
        conn_id
    }

    pub(crate) fn remove_connection(&self, conn_id: u64) {
        self.connections
            .lock()
            .expect("connection registry lock")
            .remove(&conn_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection registry lock")
            .len()
    }
}

/// A bound millrace server, ready to serve connections.
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        docs: Arc<dyn DocManager>,
        queries: QueryManager,
    ) -> Result<Server> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        let logs = LogRegistry::new(config.log_config());
        let state = Arc::new(ServerState {
            config,
            logs,
            docs,
            queries,
            durable: Arc::new(DurableCursors::new()),
            connections: std::sync::Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(0),
        });
        Ok(Server { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept loop: one task per connection.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            let conn_id = state.register_connection();
            tracing::debug!(conn_id, peer = %peer, "connection accepted");
            tokio::spawn(async move {
                if let Err(err) = run_connection(state, stream, conn_id).await {
                    tracing::warn!(conn_id, error = %err, "connection handler failed");
                }
            });
        }
    }
}
