//! WebSocket sync server with path-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/<doc name>
//!            ├── DocumentRegistry ── SharedDoc(<doc name>) ── Yrs Doc
//! Client B ──┘                           │
//!                                        ├── Replicator ──► Broker / UpdateLog
//!                                        │
//!                          ┌─────────────┼─────────────┐
//!                          ▼             ▼             ▼
//!                       Client A      Client B     Broker subscription
//! ```
//!
//! Each document entry holds:
//! - the Yrs `Doc` and its awareness state
//! - the attached connections and the awareness ids each one controls
//! - a broker subscription on `<name>` and `<name>-awareness`
//!
//! The entry is hydrated from the update log on its first connection and
//! dropped when its last connection leaves.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, LocalBroker};
use crate::config::{ConfigError, ServerConfig};
use crate::hub::HubClient;
use crate::registry::DocumentRegistry;
use crate::session::{self, SessionConfig, SessionCounters};
use crate::storage::{RocksUpdateLog, StoreError, UpdateLog};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub heartbeat_timeouts: u64,
    pub active_documents: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open update log: {0}")]
    Store(#[from] StoreError),
    #[error("failed to reach hub: {0}")]
    Hub(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    counters: Arc<SessionCounters>,
    shutdown: CancellationToken,
}

impl SyncServer {
    /// Create a server on top of an existing broker client and update log.
    pub fn new(config: ServerConfig, broker: Arc<dyn Broker>, log: Arc<dyn UpdateLog>) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.doc_config(), broker, log));
        Self {
            config,
            registry,
            counters: Arc::new(SessionCounters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the broker and log the configuration asks for: the hub when a
    /// hub url is set, otherwise a local RocksDB log and an in-process
    /// broker (single instance).
    pub async fn open(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        match &config.hub_url {
            Some(url) => {
                let hub = HubClient::connect(url, config.hub_request_timeout)
                    .await
                    .map_err(|e| ServerError::Hub(e.to_string()))?;
                log::info!("Using hub at {url} for replication and update log");
                let hub = Arc::new(hub);
                Ok(Self::new(config, hub.clone(), hub))
            }
            None => {
                let log = RocksUpdateLog::open(config.store_config())?;
                log::info!(
                    "Using local update log at {} (no hub, single instance)",
                    log.path().display()
                );
                let broker = LocalBroker::new().client();
                Ok(Self::new(config, Arc::new(broker), Arc::new(log)))
            }
        }
    }

    /// Bind the configured address and serve until [`SyncServer::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until [`SyncServer::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
            }
        }
        log::info!("Sync server stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut path = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };

        let doc_name = doc_name_from_path(&path);
        log::debug!("WebSocket connection from {addr} for '{doc_name}'");
        session::run(
            ws,
            doc_name,
            self.registry.clone(),
            self.session_config(),
            self.counters.clone(),
        )
        .await;
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: self.config.heartbeat_interval,
            outbox_capacity: self.config.outbox_capacity,
        }
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        log::info!("Shutting down sync server");
        self.shutdown.cancel();
        self.registry.close_all();
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            protocol_errors: c.protocol_errors.load(Ordering::Relaxed),
            heartbeat_timeouts: c.heartbeat_timeouts.load(Ordering::Relaxed),
            active_documents: self.registry.len(),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Document name addressed by a request path: the path minus its leading
/// slash and any query string.
pub fn doc_name_from_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    path.strip_prefix('/').unwrap_or(path).to_string()
}
