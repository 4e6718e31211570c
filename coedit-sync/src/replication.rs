//! Cross-instance replication.
//!
//! Two halves per document:
//! - [`Replicator`]: an ordered background worker running the side effects
//!   of locally originated changes (broker publish, log append). Callers
//!   enqueue and move on; failures are logged.
//! - [`run_subscription`]: the pump feeding broker messages for the
//!   document's two channels back into the [`SharedDoc`] with a broker
//!   origin, so they are never published again. A lost subscription is
//!   renewed and followed by a catch-up read of the update log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Subscription};
use crate::document::SharedDoc;
use crate::storage::UpdateLog;

/// First delay before resubscribing after a lost subscription.
pub const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound of the resubscribe delay.
pub const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Effect {
    Publish { channel: String, payload: Bytes },
    Append { update: Bytes },
    /// Cancelled once every effect queued before it has run.
    Marker { reached: CancellationToken },
}

/// Fire-and-forget side effects of one document, executed in order.
#[derive(Debug, Clone)]
pub struct Replicator {
    tx: mpsc::UnboundedSender<Effect>,
}

impl Replicator {
    /// Spawn the worker. It stops once every `Replicator` clone is dropped.
    pub fn spawn(doc_name: String, broker: Arc<dyn Broker>, log: Arc<dyn UpdateLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Effect>();
        tokio::spawn(async move {
            while let Some(effect) = rx.recv().await {
                match effect {
                    Effect::Publish { channel, payload } => {
                        if let Err(e) = broker.publish(&channel, payload).await {
                            log::warn!("Publish to '{channel}' failed: {e}");
                        }
                    }
                    Effect::Append { update } => {
                        match log.append(&doc_name, update.to_vec()).await {
                            Ok(id) => log::trace!("Appended entry {id} for '{doc_name}'"),
                            Err(e) => log::warn!("Log append for '{doc_name}' failed: {e}"),
                        }
                    }
                    Effect::Marker { reached } => reached.cancel(),
                }
            }
            log::debug!("Replication worker for '{doc_name}' stopped");
        });
        Self { tx }
    }

    pub fn publish(&self, channel: String, payload: Bytes) {
        self.enqueue(Effect::Publish { channel, payload });
    }

    pub fn append(&self, update: Bytes) {
        self.enqueue(Effect::Append { update });
    }

    /// Token cancelled once everything queued so far has been carried out.
    pub fn drained(&self) -> CancellationToken {
        let reached = CancellationToken::new();
        if self.tx.send(Effect::Marker { reached: reached.clone() }).is_err() {
            reached.cancel();
        }
        reached
    }

    fn enqueue(&self, effect: Effect) {
        if let Err(e) = self.tx.send(effect) {
            log::warn!("Replication worker gone, dropping {:?}", e.0);
        }
    }
}

/// Deliver broker messages for `doc` until `stop` fires, resubscribing when
/// the subscription ends. Also runs the periodic awareness expiry sweep.
pub async fn run_subscription(
    doc: Arc<SharedDoc>,
    broker: Arc<dyn Broker>,
    mut subscription: Subscription,
    channels: Vec<String>,
    stop: CancellationToken,
) {
    let period = (doc.awareness_timeout() / 10).max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,

            msg = subscription.recv() => match msg {
                Some(msg) => doc.handle_broker_message(msg),
                None => {
                    log::warn!("Broker subscription for '{}' lost, resubscribing", doc.name());
                    match resubscribe(broker.as_ref(), &channels, &stop).await {
                        Some(sub) => subscription = sub,
                        None => return,
                    }
                    // Publishes sent while unsubscribed are only in the log.
                    if let Err(e) = doc.catch_up().await {
                        log::warn!("Catch-up of '{}' after resubscribe failed: {e}", doc.name());
                    }
                }
            },

            _ = sweep.tick() => doc.expire_awareness(Instant::now()),
        }
    }

    if let Err(e) = broker.unsubscribe(subscription.id()).await {
        log::warn!("Unsubscribe for '{}' failed: {e}", doc.name());
    }
    log::debug!("Broker subscription for '{}' closed", doc.name());
}

async fn resubscribe(
    broker: &dyn Broker,
    channels: &[String],
    stop: &CancellationToken,
) -> Option<Subscription> {
    let mut delay = RESUBSCRIBE_INITIAL_BACKOFF;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match broker.subscribe(channels).await {
            Ok(sub) => return Some(sub),
            Err(e) => {
                log::warn!("Resubscribe to {channels:?} failed: {e}; retrying in {delay:?}");
                delay = next_backoff(delay);
            }
        }
    }
}

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(RESUBSCRIBE_MAX_BACKOFF)
}
