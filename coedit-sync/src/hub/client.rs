//! Hub client: the broker and update log of a sync server backed by a hub.
//!
//! A background task owns the WebSocket. It reconnects with exponential
//! backoff and fails outstanding log requests when the connection drops.
//! A reconnect ends every open [`Subscription`]; owners resubscribe and
//! read the update log for anything published during the gap. A publish
//! whose send failed is retried first on the next connection, and frames
//! queued while disconnected go out once the connection is back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::frame::HubFrame;
use crate::broker::{Broker, BrokerError, BrokerMessage, Subscription, SubscriptionId};
use crate::storage::{LogEntry, StoreError, UpdateLog};

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(5);

struct Route {
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

struct Inner {
    url: String,
    request_timeout: Duration,
    outgoing: mpsc::UnboundedSender<HubFrame>,
    routes: Mutex<HashMap<u64, Route>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HubFrame>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    shutdown: CancellationToken,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Close every subscription. Their receivers see the end of the stream.
    fn end_subscriptions(&self) {
        let ended = std::mem::take(&mut *self.routes.lock());
        if !ended.is_empty() {
            log::info!("Ending {} hub subscription(s) after reconnect", ended.len());
        }
    }

    fn dispatch(&self, frame: HubFrame) {
        if let Some(request) = frame.reply_to() {
            match self.pending.lock().remove(&request) {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                None => log::debug!("Late hub reply for request {request}"),
            }
            return;
        }

        match frame {
            HubFrame::Message { subscription, channel, payload } => {
                let mut routes = self.routes.lock();
                let gone = match routes.get(&subscription) {
                    Some(route) => route
                        .tx
                        .send(BrokerMessage { channel, payload: Bytes::from(payload) })
                        .is_err(),
                    // Ended or unsubscribed; the hub still holds it.
                    None => true,
                };
                if gone {
                    routes.remove(&subscription);
                    let _ = self.outgoing.send(HubFrame::Unsubscribe { subscription });
                }
            }
            other => log::warn!("Unexpected frame from hub: {other:?}"),
        }
    }

    /// Drop every waiting request; their callers see the connection loss.
    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

/// Connection to a hub, usable as [`Broker`] and [`UpdateLog`].
pub struct HubClient {
    inner: Arc<Inner>,
}

impl HubClient {
    /// Connect to the hub at `url` (`ws://host:port`). The first connection
    /// attempt must succeed; later losses are retried in the background.
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self, BrokerError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        log::info!("Connected to hub at {url}");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            url: url.to_string(),
            request_timeout,
            outgoing,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(drive(inner.clone(), outgoing_rx, stream));
        Ok(Self { inner })
    }

    /// Publishes issued through this client.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Stop the background connection. Subscriptions end.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn send(&self, frame: HubFrame) -> Result<(), BrokerError> {
        self.inner.outgoing.send(frame).map_err(|_| BrokerError::Closed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> HubFrame) -> Result<HubFrame, StoreError> {
        let request = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request, tx);

        if self.inner.outgoing.send(build(request)).is_err() {
            self.inner.pending.lock().remove(&request);
            return Err(StoreError::Unavailable("hub client stopped".into()));
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(HubFrame::Failed { reason, .. })) => Err(StoreError::Unavailable(reason)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(StoreError::Unavailable("hub connection lost".into())),
            Err(_) => {
                self.inner.pending.lock().remove(&request);
                Err(StoreError::Timeout)
            }
        }
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn unexpected(frame: HubFrame) -> StoreError {
    StoreError::Corrupt(format!("unexpected hub reply {frame:?}"))
}

#[async_trait]
impl Broker for HubClient {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.send(HubFrame::Publish {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        })
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, BrokerError> {
        let id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.lock().insert(id, Route { tx });
        self.send(HubFrame::Subscribe {
            subscription: id,
            channels: channels.to_vec(),
        })?;
        Ok(Subscription::new(SubscriptionId(id), rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BrokerError> {
        self.inner.routes.lock().remove(&id.0);
        self.send(HubFrame::Unsubscribe { subscription: id.0 })
    }
}

#[async_trait]
impl UpdateLog for HubClient {
    async fn append(&self, doc_name: &str, update: Vec<u8>) -> Result<u64, StoreError> {
        let name = doc_name.to_string();
        match self
            .request(|request| HubFrame::Append { request, doc_name: name, update })
            .await?
        {
            HubFrame::Appended { id, .. } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn list_ordered(&self, doc_name: &str) -> Result<Vec<LogEntry>, StoreError> {
        let name = doc_name.to_string();
        match self
            .request(|request| HubFrame::List { request, doc_name: name })
            .await?
        {
            HubFrame::Entries { entries, .. } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    async fn insert_and_delete_atomically(
        &self,
        doc_name: &str,
        merged: Vec<u8>,
        superseded: &[u64],
    ) -> Result<LogEntry, StoreError> {
        let name = doc_name.to_string();
        let superseded = superseded.to_vec();
        match self
            .request(|request| HubFrame::Compact {
                request,
                doc_name: name,
                merged,
                superseded,
            })
            .await?
        {
            HubFrame::Compacted { entry, .. } => Ok(entry),
            other => Err(unexpected(other)),
        }
    }
}

/// Connection driver: pumps frames both ways and reconnects on loss.
async fn drive(inner: Arc<Inner>, mut outgoing: mpsc::UnboundedReceiver<HubFrame>, first: HubStream) {
    let mut next_stream = Some(first);
    let mut delay = RECONNECT_INITIAL_BACKOFF;
    let mut unsent: Option<HubFrame> = None;

    loop {
        let stream = match next_stream.take() {
            Some(stream) => stream,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match tokio_tungstenite::connect_async(inner.url.as_str()).await {
                    Ok((stream, _)) => {
                        log::info!("Reconnected to hub at {}", inner.url);
                        delay = RECONNECT_INITIAL_BACKOFF;
                        inner.end_subscriptions();
                        stream
                    }
                    Err(e) => {
                        log::warn!("Hub reconnect failed: {e}; retrying in {delay:?}");
                        delay = (delay * 2).min(RECONNECT_MAX_BACKOFF);
                        continue;
                    }
                }
            }
        };

        let (mut sink, mut source) = stream.split();
        let mut stopped = false;

        loop {
            // A publish lost with the previous connection goes out first.
            if let Some(frame) = unsent.take() {
                if !send_frame(&mut sink, &frame).await {
                    unsent = Some(frame);
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    stopped = true;
                    break;
                }

                frame = outgoing.recv() => {
                    let Some(frame) = frame else {
                        stopped = true;
                        break;
                    };
                    if !send_frame(&mut sink, &frame).await {
                        if matches!(frame, HubFrame::Publish { .. }) {
                            unsent = Some(frame);
                        }
                        break;
                    }
                }

                msg = source.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => match HubFrame::decode(&data) {
                        Ok(frame) => inner.dispatch(frame),
                        Err(e) => log::warn!("Ignoring undecodable hub frame: {e}"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Hub transport error: {e}");
                        break;
                    }
                },
            }
        }

        inner.fail_pending();
        if stopped {
            break;
        }
        log::warn!("Lost connection to hub at {}, reconnecting", inner.url);
    }

    inner.routes.lock().clear();
    inner.fail_pending();
    log::debug!("Hub client for {} stopped", inner.url);
}

async fn send_frame<S>(sink: &mut S, frame: &HubFrame) -> bool
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Dropping hub frame: {e}");
            return true;
        }
    };
    match sink.send(WsMessage::Binary(bytes.into())).await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Hub send failed: {e}");
            false
        }
    }
}
