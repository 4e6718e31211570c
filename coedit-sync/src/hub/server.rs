//! Hub process: WebSocket relay for broker channels plus the shared update
//! log.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::frame::HubFrame;
use crate::config::HubConfig;
use crate::storage::{RocksUpdateLog, StoreConfig, StoreError, UpdateLog};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to open hub storage: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Route {
    peer: u64,
    subscription: u64,
    tx: mpsc::UnboundedSender<HubFrame>,
}

struct Inner {
    config: HubConfig,
    log: Option<RocksUpdateLog>,
    /// channel → routes
    channels: Mutex<HashMap<String, Vec<Route>>>,
    next_peer: AtomicU64,
    relayed: AtomicU64,
    shutdown: CancellationToken,
}

/// The hub. Cheap to clone.
#[derive(Clone)]
pub struct HubServer {
    inner: Arc<Inner>,
}

impl HubServer {
    pub fn open(config: HubConfig) -> Result<Self, HubError> {
        let log = match &config.storage_path {
            Some(path) => Some(RocksUpdateLog::open(StoreConfig::at(path))?),
            None => None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                log,
                channels: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(1),
                relayed: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!(
            "Hub listening on {} ({})",
            listener.local_addr()?,
            if self.inner.log.is_some() { "with update log" } else { "relay only" }
        );
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let hub = self.clone();
                    tokio::spawn(async move { hub.handle_peer(stream, addr).await });
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Messages delivered to subscribers so far.
    pub fn relayed(&self) -> u64 {
        self.inner.relayed.load(Ordering::Relaxed)
    }

    async fn handle_peer(&self, stream: TcpStream, addr: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Hub handshake with {addr} failed: {e}");
                return;
            }
        };
        let peer = self.inner.next_peer.fetch_add(1, Ordering::Relaxed);
        log::info!("Hub peer {peer} connected from {addr}");

        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<HubFrame>();

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,

                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    match frame.encode() {
                        Ok(bytes) => {
                            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping frame for peer {peer}: {e}"),
                    }
                }

                msg = source.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => match HubFrame::decode(&data) {
                        Ok(frame) => self.dispatch(peer, frame, &tx).await,
                        Err(e) => {
                            log::warn!("Closing hub peer {peer}: {e}");
                            break;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Hub peer {peer} transport error: {e}");
                        break;
                    }
                },
            }
        }

        self.drop_peer(peer);
        log::info!("Hub peer {peer} disconnected");
    }

    async fn dispatch(&self, peer: u64, frame: HubFrame, tx: &mpsc::UnboundedSender<HubFrame>) {
        match frame {
            HubFrame::Subscribe { subscription, channels } => {
                let mut map = self.inner.channels.lock();
                for channel in channels {
                    let routes = map.entry(channel).or_default();
                    routes.retain(|r| !(r.peer == peer && r.subscription == subscription));
                    routes.push(Route { peer, subscription, tx: tx.clone() });
                }
            }
            HubFrame::Unsubscribe { subscription } => {
                let mut map = self.inner.channels.lock();
                map.retain(|_, routes| {
                    routes.retain(|r| !(r.peer == peer && r.subscription == subscription));
                    !routes.is_empty()
                });
            }
            HubFrame::Publish { channel, payload } => {
                let map = self.inner.channels.lock();
                if let Some(routes) = map.get(&channel) {
                    for route in routes.iter().filter(|r| r.peer != peer) {
                        let delivered = route.tx.send(HubFrame::Message {
                            subscription: route.subscription,
                            channel: channel.clone(),
                            payload: payload.clone(),
                        });
                        if delivered.is_ok() {
                            self.inner.relayed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            HubFrame::Append { request, doc_name, update } => {
                let reply = match self.log() {
                    Ok(log) => match log.append(&doc_name, update).await {
                        Ok(id) => HubFrame::Appended { request, id },
                        Err(e) => HubFrame::Failed { request, reason: e.to_string() },
                    },
                    Err(reason) => HubFrame::Failed { request, reason },
                };
                let _ = tx.send(reply);
            }
            HubFrame::List { request, doc_name } => {
                let reply = match self.log() {
                    Ok(log) => match log.list_ordered(&doc_name).await {
                        Ok(entries) => HubFrame::Entries { request, entries },
                        Err(e) => HubFrame::Failed { request, reason: e.to_string() },
                    },
                    Err(reason) => HubFrame::Failed { request, reason },
                };
                let _ = tx.send(reply);
            }
            HubFrame::Compact { request, doc_name, merged, superseded } => {
                let reply = match self.log() {
                    Ok(log) => match log
                        .insert_and_delete_atomically(&doc_name, merged, &superseded)
                        .await
                    {
                        Ok(entry) => HubFrame::Compacted { request, entry },
                        Err(e) => HubFrame::Failed { request, reason: e.to_string() },
                    },
                    Err(reason) => HubFrame::Failed { request, reason },
                };
                let _ = tx.send(reply);
            }
            other => log::warn!("Hub peer {peer} sent unexpected frame {other:?}"),
        }
    }

    fn log(&self) -> Result<&RocksUpdateLog, String> {
        self.inner
            .log
            .as_ref()
            .ok_or_else(|| "hub has no update log configured".to_string())
    }

    fn drop_peer(&self, peer: u64) {
        let mut map = self.inner.channels.lock();
        map.retain(|_, routes| {
            routes.retain(|r| r.peer != peer);
            !routes.is_empty()
        });
    }
}
