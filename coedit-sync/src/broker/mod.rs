//! Publish/subscribe contract used for cross-instance replication.
//!
//! ```text
//! instance A ──publish("doc")──►  Broker  ──Message("doc")──► instance B
//!                                   │
//!                                   └─ never echoed back to A
//! ```
//!
//! Implementations:
//! - [`LocalBroker`] — in-process hub, one client per simulated instance
//! - [`crate::hub::HubClient`] — WebSocket client of a standalone hub process

pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use local::{LocalBroker, LocalBrokerClient};

/// Suffix appended to a document name to form its awareness channel.
pub const AWARENESS_SUFFIX: &str = "-awareness";

/// Channel carrying document update deltas.
pub fn update_channel(doc_name: &str) -> String {
    doc_name.to_string()
}

/// Channel carrying encoded awareness updates.
pub fn awareness_channel(doc_name: &str) -> String {
    format!("{doc_name}{AWARENESS_SUFFIX}")
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Identifies one subscription handed out by a broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
///
/// `recv` returning `None` means the subscription was lost (client dropped
/// or transport gone for good); callers resubscribe.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, rx: mpsc::UnboundedReceiver<BrokerMessage>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

/// Broker errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection closed")]
    Closed,
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("broker codec error: {0}")]
    Codec(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` to every other subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a set of channels; messages from all of them arrive on
    /// one [`Subscription`].
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BrokerError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError>;
}
