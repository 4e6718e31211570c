//! # coedit-sync — Real-time collaborative document sync server
//!
//! Serves Yjs documents over WebSocket using the y-protocols sync and
//! awareness messages, and keeps several server instances converged through
//! a publish/subscribe broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐      ┌─────────────┐
//! │ Yjs client  │ ◄─────────────────► │ SyncServer  │ ◄──► │ Broker      │ ◄──► other
//! │ (per user)  │   sync / awareness  │ (instance)  │      │ (local/hub) │      instances
//! └─────────────┘                     └──────┬──────┘      └─────────────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │ SharedDoc   │── Yrs Doc + Awareness
//!                                     │ per name    │
//!                                     └──────┬──────┘
//!                                            │ append / load + compact
//!                                     ┌──────┴──────┐
//!                                     │ UpdateLog   │ (RocksDB or hub)
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — y-protocols wire framing (sync step 1/2, update, awareness)
//! - [`awareness`] — presence state with clock-based last-writer-wins merge
//! - [`document`] — shared document container, origin tagging, fan-out
//! - [`registry`] — document table with create-on-demand, destroy-on-empty
//! - [`session`] — per-connection pump and heartbeat
//! - [`replication`] — broker subscription pump and ordered side effects
//! - [`broker`] — publish/subscribe contract and the in-process broker
//! - [`storage`] — update log, RocksDB backend, compaction
//! - [`hub`] — standalone broker + shared log process and its client
//! - [`server`] — WebSocket listener
//! - [`config`] — server and hub configuration

pub mod awareness;
pub mod broker;
pub mod config;
pub mod document;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod replication;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChange, AwarenessEntry, AwarenessUpdate, ClientId};
pub use broker::{
    awareness_channel, update_channel, Broker, BrokerError, BrokerMessage, LocalBroker,
    LocalBrokerClient, Subscription, SubscriptionId,
};
pub use config::{ConfigError, HubConfig, ServerConfig};
pub use document::{
    ConnectionHandle, ConnectionId, DocConfig, DocError, HydrationError, SharedDoc, UpdateOrigin,
};
pub use hub::{HubClient, HubError, HubFrame, HubServer};
pub use protocol::{Message, ProtocolError, SyncMessage};
pub use registry::DocumentRegistry;
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{SessionConfig, SessionEnd};
pub use storage::{
    load_and_maybe_compact, LogEntry, RocksUpdateLog, StoreConfig, StoreError, UpdateLog,
    DEFAULT_COMPACTION_THRESHOLD,
};
