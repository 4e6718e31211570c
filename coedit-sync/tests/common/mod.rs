//! Shared helpers: a minimal Yjs-style client speaking the sync protocol
//! over a real WebSocket, and server setup on ephemeral ports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use coedit_sync::{
    AwarenessEntry, AwarenessUpdate, Broker, ClientId, Message, RocksUpdateLog, ServerConfig,
    SyncMessage, SyncServer, UpdateLog,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

pub const WAIT: Duration = Duration::from_secs(3);

/// Start `server` on an ephemeral port.
pub async fn spawn_server(server: &SyncServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    tokio::spawn(async move { server.serve(listener).await.unwrap() });
    addr
}

/// Server over the given broker client and log, with test-sized settings.
pub fn test_server(
    dir: &std::path::Path,
    broker: Arc<dyn Broker>,
    log: Arc<dyn UpdateLog>,
    heartbeat: Duration,
) -> SyncServer {
    let config = ServerConfig {
        heartbeat_interval: heartbeat,
        ..ServerConfig::for_testing(dir)
    };
    SyncServer::new(config, broker, log)
}

pub fn open_log(dir: &std::path::Path) -> Arc<RocksUpdateLog> {
    Arc::new(RocksUpdateLog::open(coedit_sync::StoreConfig::for_testing(dir)).unwrap())
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// [`eventually`] for conditions that have to await.
pub async fn eventually_async<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond().await
}

pub fn text_of_update(update: &[u8]) -> String {
    let doc = Doc::new();
    doc.transact_mut()
        .apply_update(Update::decode_v1(update).unwrap())
        .unwrap();
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

pub fn presence(client_id: ClientId, clock: u64, state: Option<&str>) -> Message {
    Message::Awareness(
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock,
                state: state.map(str::to_string),
            }],
        }
        .encode(),
    )
}

/// What a client observed after reading one frame.
#[derive(Debug)]
pub enum Event {
    Message(Message),
    Closed(Option<u16>),
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub doc: Doc,
    pub awareness: Vec<AwarenessUpdate>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, doc_name: &str) -> Self {
        let url = format!("ws://{addr}/{doc_name}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self {
            ws,
            doc: Doc::new(),
            awareness: Vec::new(),
        }
    }

    /// Connect and run both directions of the sync handshake.
    pub async fn connect_synced(addr: SocketAddr, doc_name: &str) -> Self {
        let mut client = Self::connect(addr, doc_name).await;
        client.handshake().await;
        client
    }

    pub async fn send(&mut self, msg: &Message) {
        self.ws
            .send(WsMessage::Binary(msg.encode().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(WsMessage::Binary(bytes.into())).await.unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Read one frame, applying sync traffic to the local replica. `None`
    /// on timeout.
    pub async fn next_event(&mut self, wait: Duration) -> Option<Event> {
        loop {
            let frame = match timeout(wait, self.ws.next()).await {
                Err(_) => return None,
                Ok(None) | Ok(Some(Err(_))) => return Some(Event::Closed(None)),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                WsMessage::Binary(data) => {
                    let msg = Message::decode(&data).unwrap();
                    self.absorb(&msg).await;
                    return Some(Event::Message(msg));
                }
                WsMessage::Close(frame) => {
                    return Some(Event::Closed(frame.map(|f| u16::from(f.code))));
                }
                _ => continue,
            }
        }
    }

    async fn absorb(&mut self, msg: &Message) {
        match msg {
            Message::Sync(SyncMessage::Step1(sv)) => {
                let sv = StateVector::decode_v1(sv).unwrap();
                let diff = self.doc.transact().encode_diff_v1(&sv);
                self.send(&Message::Sync(SyncMessage::Step2(diff))).await;
            }
            Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                self.doc
                    .transact_mut()
                    .apply_update(Update::decode_v1(update).unwrap())
                    .unwrap();
            }
            Message::Awareness(bytes) => {
                self.awareness.push(AwarenessUpdate::decode(bytes).unwrap());
            }
        }
    }

    /// Read until `pred` holds for a received message.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&Message) -> bool) -> Message {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_event(left).await {
                Some(Event::Message(msg)) if pred(&msg) => return msg,
                Some(Event::Message(_)) => continue,
                other => panic!("expected message, got {other:?}"),
            }
        }
    }

    /// Read until the local text equals `expected`.
    pub async fn wait_for_text(&mut self, expected: &str) {
        let deadline = Instant::now() + WAIT;
        while self.text() != expected {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_event(left).await {
                Some(Event::Message(_)) => {}
                other => panic!(
                    "text '{}' never became '{expected}': {other:?}",
                    self.text()
                ),
            }
        }
    }

    /// Read until the server closes the connection; returns the close code.
    pub async fn wait_closed(&mut self) -> Option<u16> {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_event(left).await {
                Some(Event::Closed(code)) => return code,
                Some(Event::Message(_)) => continue,
                None => panic!("connection was not closed"),
            }
        }
    }

    /// Drain frames for `window`, keeping heartbeats answered.
    pub async fn pump_for(&mut self, window: Duration) -> Vec<Message> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return seen;
            }
            match self.next_event(left).await {
                Some(Event::Message(msg)) => seen.push(msg),
                Some(Event::Closed(_)) | None => return seen,
            }
        }
    }

    /// Server step 1 answered, own step 1 sent and answered.
    pub async fn handshake(&mut self) {
        self.wait_for(|m| matches!(m, Message::Sync(SyncMessage::Step1(_))))
            .await;
        let sv = self.doc.transact().state_vector().encode_v1();
        self.send(&Message::Sync(SyncMessage::Step1(sv))).await;
        self.wait_for(|m| matches!(m, Message::Sync(SyncMessage::Step2(_))))
            .await;
    }

    /// Append `s` to the shared text and send the resulting update.
    pub async fn insert(&mut self, s: &str) -> Vec<u8> {
        let sv = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&sv);
        self.send(&Message::Sync(SyncMessage::Update(update.clone())))
            .await;
        update
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    /// Identities seen removed across all received awareness updates.
    pub fn removed_ids(&self) -> Vec<ClientId> {
        self.awareness
            .iter()
            .flat_map(|u| u.entries.iter())
            .filter(|e| e.state.is_none())
            .map(|e| e.client_id)
            .collect()
    }
}
