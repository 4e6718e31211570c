//! One client connection: message pump and heartbeat.
//!
//! ```text
//!            ┌────────────── select! ──────────────┐
//! ws read ──►│ Binary → SharedDoc::handle_message  │
//! outbox  ──►│ Bytes  → ws write                   │
//! ticker  ──►│ no pong since last ping → close     │
//! closing ──►│ handle closed elsewhere → close     │
//!            └─────────────────────────────────────┘
//!                          │ exit (any path)
//!                          ▼
//!              DocumentRegistry::release
//! ```
//!
//! Everything written to the socket goes through this task, so the
//! connection has a single writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::document::ConnectionHandle;
use crate::registry::DocumentRegistry;

/// Close reason sent when a document could not be loaded.
pub const HYDRATION_FAILED_REASON: &str = "document unavailable";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub outbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            outbox_capacity: 256,
        }
    }
}

/// Counters shared by every session of a server.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed or the transport failed.
    Disconnected,
    /// A ping went unanswered for a whole interval.
    HeartbeatTimeout,
    /// The peer sent something that is not a valid message.
    ProtocolError,
    /// Closed through the handle (full outbox, server shutdown).
    Closed,
    /// The document could not be hydrated.
    Unavailable,
}

/// Serve one upgraded connection for document `doc_name` until it ends.
pub async fn run<S>(
    ws: WebSocketStream<S>,
    doc_name: String,
    registry: Arc<DocumentRegistry>,
    config: SessionConfig,
    counters: Arc<SessionCounters>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (handle, mut outbox) = ConnectionHandle::new(config.outbox_capacity);
    let conn = handle.id();

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let (doc, created) = registry.acquire(&doc_name, handle.clone());
    log::info!(
        "Connection {conn} opened on '{doc_name}'{}",
        if created { " (new document)" } else { "" }
    );

    if let Err(e) = doc.ready().await {
        log::error!("Hydration of '{doc_name}' failed, rejecting {conn}: {e}");
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: Utf8Bytes::from_static(HYDRATION_FAILED_REASON),
        };
        let _ = ws_sender.send(WsMessage::Close(Some(frame))).await;
        registry.release(&doc, conn);
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        return SessionEnd::Unavailable;
    }

    handle.send_message(&doc.sync_step1());
    if let Some(snapshot) = doc.awareness_snapshot() {
        handle.send_message(&snapshot);
    }

    let period = config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut pong_received = true;

    let end = loop {
        tokio::select! {
            _ = handle.closed() => break SessionEnd::Closed,

            msg = ws_receiver.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    counters.messages_received.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    if let Err(e) = doc.handle_message(&data, conn) {
                        log::warn!("Closing {conn} on '{doc_name}': {e}");
                        counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        break SessionEnd::ProtocolError;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => pong_received = true,
                Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Disconnected,
                Some(Ok(other)) => log::trace!("Ignoring non-binary frame from {conn}: {other:?}"),
                Some(Err(e)) => {
                    log::debug!("WebSocket error on {conn}: {e}");
                    break SessionEnd::Disconnected;
                }
            },

            out = outbox.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = ws_sender.send(WsMessage::Binary(bytes)).await {
                        log::debug!("Send to {conn} failed: {e}");
                        break SessionEnd::Disconnected;
                    }
                }
                None => break SessionEnd::Closed,
            },

            _ = heartbeat.tick() => {
                if !pong_received {
                    log::info!("Connection {conn} on '{doc_name}' missed its heartbeat");
                    counters.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
                    break SessionEnd::HeartbeatTimeout;
                }
                pong_received = false;
                if let Err(e) = ws_sender.send(WsMessage::Ping(Bytes::new())).await {
                    log::debug!("Ping to {conn} failed: {e}");
                    break SessionEnd::Disconnected;
                }
            }
        }
    };

    handle.close();
    registry.release(&doc, conn);
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    close_quietly(&mut ws_sender, end).await;
    log::info!("Connection {conn} on '{doc_name}' closed ({end:?})");
    end
}

async fn close_quietly<S>(sender: &mut SplitSink<WebSocketStream<S>, WsMessage>, end: SessionEnd)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match end {
        SessionEnd::Disconnected => return,
        SessionEnd::ProtocolError => Some(CloseFrame {
            code: CloseCode::Protocol,
            reason: Utf8Bytes::from_static("protocol error"),
        }),
        _ => None,
    };
    let closing = sender.send(WsMessage::Close(frame));
    let _ = tokio::time::timeout(Duration::from_secs(1), closing).await;
}
