//! Runtime configuration of the sync server and the hub.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::document::DocConfig;
use crate::storage::{StoreConfig, DEFAULT_COMPACTION_THRESHOLD};

/// Sync server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between heartbeat pings; a ping unanswered for one
    /// interval closes the connection.
    pub heartbeat_interval: Duration,
    /// Per-connection outbound queue capacity
    pub outbox_capacity: usize,
    /// Log entries at which hydration compacts a document
    pub compaction_threshold: usize,
    /// Awareness identities idle for this long are dropped
    pub awareness_timeout: Duration,
    /// Local RocksDB update log, used when no hub is configured
    pub storage_path: PathBuf,
    /// Hub providing broker and update log to several servers
    pub hub_url: Option<String>,
    /// Deadline for hub log requests
    pub hub_request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            outbox_capacity: 256,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            awareness_timeout: Duration::from_secs(30),
            storage_path: PathBuf::from("./coedit-data"),
            hub_url: None,
            hub_request_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and a caller-provided storage directory.
    pub fn for_testing(storage_path: impl AsRef<Path>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: storage_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat_interval"));
        }
        if self.awareness_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("awareness_timeout"));
        }
        if self.hub_request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("hub_request_timeout"));
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::Zero("outbox_capacity"));
        }
        if self.compaction_threshold == 0 {
            return Err(ConfigError::Zero("compaction_threshold"));
        }
        if let Some(url) = &self.hub_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidHubUrl(url.clone()));
            }
        }
        Ok(())
    }

    pub fn doc_config(&self) -> DocConfig {
        DocConfig {
            compaction_threshold: self.compaction_threshold,
            awareness_timeout: self.awareness_timeout,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::at(&self.storage_path)
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: String,
    /// RocksDB directory backing the shared update log. Without it the hub
    /// only relays pub/sub traffic and refuses log requests.
    pub storage_path: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6380".to_string(),
            storage_path: None,
        }
    }
}

impl HubConfig {
    pub fn for_testing(storage_path: Option<&Path>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: storage_path.map(Path::to_path_buf),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must be a non-zero duration")]
    ZeroDuration(&'static str),
    #[error("hub url must use ws:// or wss://, got '{0}'")]
    InvalidHubUrl(String),
}
