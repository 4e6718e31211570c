//! Standalone replication hub shared by several sync servers.
//!
//! ```text
//! sync server A ──┐                  ┌── pub/sub fan-out (never back to sender)
//!  (HubClient)    ├── ws ── HubServer┤
//! sync server B ──┘                  └── RocksUpdateLog (shared update log)
//! ```
//!
//! A [`HubClient`] is both the [`crate::broker::Broker`] and the
//! [`crate::storage::UpdateLog`] of the server using it, so every instance
//! sees the same channels and hydrates from the same durable log.

pub mod client;
pub mod frame;
pub mod server;

pub use client::HubClient;
pub use frame::{FrameError, HubFrame};
pub use server::{HubError, HubServer};
