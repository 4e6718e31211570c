//! In-process broker hub.
//!
//! Several sync instances living in one process (tests, embedded setups)
//! each take their own [`LocalBrokerClient`]; a publish reaches every other
//! client subscribed to the channel but never the publishing client itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, BrokerMessage, Subscription, SubscriptionId};

struct Subscriber {
    id: SubscriptionId,
    client: u64,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct Hub {
    /// channel → subscribers
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_subscription: AtomicU64,
    next_client: AtomicU64,
    published: AtomicU64,
}

/// Shared in-process hub. Cheap to clone.
#[derive(Clone, Default)]
pub struct LocalBroker {
    hub: Arc<Hub>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a client representing one sync instance.
    pub fn client(&self) -> LocalBrokerClient {
        LocalBrokerClient {
            hub: self.hub.clone(),
            client: self.hub.next_client.fetch_add(1, Ordering::Relaxed),
            published: AtomicU64::new(0),
        }
    }

    /// Total publishes across all clients.
    pub fn published(&self) -> u64 {
        self.hub.published.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .channels
            .lock()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }
}

/// One instance's handle on a [`LocalBroker`].
pub struct LocalBrokerClient {
    hub: Arc<Hub>,
    client: u64,
    published: AtomicU64,
}

impl LocalBrokerClient {
    /// Publishes issued by this client.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for LocalBrokerClient {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.hub.published.fetch_add(1, Ordering::Relaxed);

        let mut channels = self.hub.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter().filter(|s| s.client != self.client) {
                let _ = sub.tx.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BrokerError> {
        let id = SubscriptionId(self.hub.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut map = self.hub.channels.lock();
        for channel in channels {
            map.entry(channel.clone()).or_default().push(Subscriber {
                id,
                client: self.client,
                tx: tx.clone(),
            });
        }
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        let mut map = self.hub.channels.lock();
        map.retain(|_, subs| {
            subs.retain(|s| s.id != id);
            !subs.is_empty()
        });
        Ok(())
    }
}
