//! Shared document container: one Yrs replica, its awareness state and the
//! connections attached to it.
//!
//! ```text
//!   connection ──► handle_message ─┐
//!   broker     ──► apply_remote_* ─┼─► mutex(DocState) ─► apply
//!   hydration  ──► log replay ─────┘          │
//!                                             ├─► fan-out (try_send per connection)
//!                                             └─► Replicator (publish / append)
//! ```
//!
//! All mutation of a document goes through one `parking_lot::Mutex`, held
//! only for synchronous work. Side effects that may block (broker publish,
//! log append) are queued on the [`Replicator`] while the lock is held so
//! they keep the order in which updates were applied.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::awareness::{Awareness, AwarenessChange, AwarenessUpdate, ClientId};
use crate::broker::{awareness_channel, update_channel, Broker, BrokerError, BrokerMessage};
use crate::protocol::{Message, ProtocolError, SyncMessage};
use crate::replication::{self, Replicator};
use crate::storage::{load_and_maybe_compact, StoreError, UpdateLog, DEFAULT_COMPACTION_THRESHOLD};

/// Identity of one client connection within this process.
pub type ConnectionId = Uuid;

/// Where a document or awareness change came from.
///
/// Only [`UpdateOrigin::Connection`] changes are published and appended to
/// the log; [`UpdateOrigin::Broker`] changes are never sent back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// A client connected to this process.
    Connection(ConnectionId),
    /// This process itself: hydration, disconnect cleanup, awareness expiry.
    Server,
    /// Another process, delivered through the broker.
    Broker,
}

/// Sending side of one connection, as seen by the documents it is attached to.
///
/// Sends never block: a full or closed outbox closes the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<Bytes>,
    closing: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiver the connection's writer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            outbox,
            closing: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an encoded message. Returns `false` and closes the connection
    /// when it cannot be queued.
    pub fn send(&self, payload: Bytes) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        match self.outbox.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Closing connection {}: outbox rejected message ({e})", self.id);
                self.close();
                false
            }
        }
    }

    pub fn send_message(&self, msg: &Message) -> bool {
        self.send(Bytes::from(msg.encode()))
    }

    /// Mark the connection closed. Idempotent.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }
}

/// Tunables of a document container.
#[derive(Debug, Clone)]
pub struct DocConfig {
    /// Log entry count at which hydration compacts.
    pub compaction_threshold: usize,
    /// Awareness identities not refreshed within this window are removed.
    pub awareness_timeout: Duration,
}

impl Default for DocConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors raised while handling a message for a document.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
}

/// Errors preparing a new document for its first connection.
#[derive(Debug, thiserror::Error)]
pub enum HydrationError {
    #[error("broker subscription failed: {0}")]
    Subscribe(#[from] BrokerError),
    #[error("update log unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("document '{0}' was shut down")]
    ShutDown(String),
}

struct Attached {
    handle: ConnectionHandle,
    /// Awareness identities this connection is responsible for.
    controlled: HashSet<ClientId>,
}

struct DocState {
    doc: Doc,
    awareness: Awareness,
    conns: HashMap<ConnectionId, Attached>,
}

/// One live document replica with its connections.
pub struct SharedDoc {
    name: String,
    config: DocConfig,
    state: Mutex<DocState>,
    replicator: Replicator,
    broker: Arc<dyn Broker>,
    log: Arc<dyn UpdateLog>,
    hydrated: OnceCell<()>,
    /// Effects of the previous incarnation under the same name, which
    /// hydration waits for.
    predecessor: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SharedDoc {
    /// Create an empty container. Must be called inside a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: DocConfig,
        broker: Arc<dyn Broker>,
        log: Arc<dyn UpdateLog>,
    ) -> Arc<Self> {
        let name = name.into();
        let replicator = Replicator::spawn(name.clone(), broker.clone(), log.clone());
        Arc::new(Self {
            name,
            config,
            state: Mutex::new(DocState {
                doc: Doc::new(),
                awareness: Awareness::new(),
                conns: HashMap::new(),
            }),
            replicator,
            broker,
            log,
            hydrated: OnceCell::new(),
            predecessor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to the broker and load the durable state, once.
    ///
    /// Concurrent callers wait for the same attempt. A failed attempt leaves
    /// nothing behind and the next caller retries.
    pub async fn ready(self: &Arc<Self>) -> Result<(), HydrationError> {
        self.hydrated
            .get_or_try_init(|| async {
                if self.shutdown.is_cancelled() {
                    return Err(HydrationError::ShutDown(self.name.clone()));
                }

                let channels = vec![update_channel(&self.name), awareness_channel(&self.name)];
                let subscription = self.broker.subscribe(&channels).await?;
                let pump_stop = self.shutdown.child_token();
                tokio::spawn(replication::run_subscription(
                    self.clone(),
                    self.broker.clone(),
                    subscription,
                    channels,
                    pump_stop.clone(),
                ));

                let predecessor = self.predecessor.lock().take();
                if let Some(drained) = predecessor {
                    if !drained.is_cancelled() {
                        log::debug!("'{}' waiting for the previous replica's log writes", self.name);
                        drained.cancelled().await;
                    }
                }

                match load_and_maybe_compact(
                    self.log.as_ref(),
                    &self.name,
                    self.config.compaction_threshold,
                )
                .await
                {
                    Ok(entries) => {
                        self.replay_entries(entries.iter().map(|e| (e.id, e.update.as_slice())));
                        log::info!(
                            "Hydrated document '{}' from {} log entries",
                            self.name,
                            entries.len()
                        );
                        Ok(())
                    }
                    Err(e) => {
                        pump_stop.cancel();
                        Err(e.into())
                    }
                }
            })
            .await
            .map(|_| ())
    }

    fn replay_entries<'a>(&self, entries: impl Iterator<Item = (u64, &'a [u8])>) {
        let state = self.state.lock();
        let mut txn = state.doc.transact_mut();
        for (id, bytes) in entries {
            let applied = Update::decode_v1(bytes)
                .map_err(|e| e.to_string())
                .and_then(|u| txn.apply_update(u).map_err(|e| e.to_string()));
            if let Err(e) = applied {
                log::warn!("Skipping unreadable log entry {id} of '{}': {e}", self.name);
            }
        }
    }

    /// Attach a connection with no controlled identities.
    pub fn attach(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock();
        log::debug!("Connection {} attached to '{}'", handle.id(), self.name);
        state.conns.insert(
            handle.id(),
            Attached { handle, controlled: HashSet::new() },
        );
    }

    /// Detach a connection and remove every awareness identity it controlled.
    /// Returns `false` when the connection was not attached.
    pub fn detach(&self, conn: ConnectionId) -> bool {
        let mut state = self.state.lock();
        let Some(attached) = state.conns.remove(&conn) else {
            return false;
        };
        log::debug!("Connection {conn} detached from '{}'", self.name);

        if !attached.controlled.is_empty() {
            let ids: Vec<ClientId> = attached.controlled.into_iter().collect();
            let change = state.awareness.remove_states(&ids);
            self.on_awareness_change(&mut state, change, UpdateOrigin::Server);
        }
        true
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.state.lock().conns.contains_key(&conn)
    }

    /// Identities controlled by a connection, sorted.
    pub fn controlled_by(&self, conn: ConnectionId) -> Vec<ClientId> {
        let state = self.state.lock();
        let mut ids: Vec<ClientId> = state
            .conns
            .get(&conn)
            .map(|a| a.controlled.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Decode and process one wire message from `conn`.
    pub fn handle_message(&self, bytes: &[u8], conn: ConnectionId) -> Result<(), DocError> {
        match Message::decode(bytes)? {
            Message::Sync(sync) => {
                if let Some(reply) = self.handle_sync(sync, conn)? {
                    let state = self.state.lock();
                    if let Some(attached) = state.conns.get(&conn) {
                        attached.handle.send_message(&reply);
                    }
                }
                Ok(())
            }
            Message::Awareness(update) => {
                self.apply_awareness(&update, UpdateOrigin::Connection(conn))
            }
        }
    }

    /// Run one step of the sync protocol. Step 1 yields a step 2 reply;
    /// step 2 and updates are applied and yield nothing.
    pub fn handle_sync(
        &self,
        msg: SyncMessage,
        conn: ConnectionId,
    ) -> Result<Option<Message>, DocError> {
        match msg {
            SyncMessage::Step1(sv) => {
                let sv = StateVector::decode_v1(&sv)
                    .map_err(|e| DocError::InvalidStateVector(e.to_string()))?;
                let state = self.state.lock();
                let diff = state.doc.transact().encode_diff_v1(&sv);
                Ok(Some(Message::Sync(SyncMessage::Step2(diff))))
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                self.apply_update(&update, UpdateOrigin::Connection(conn))?;
                Ok(None)
            }
        }
    }

    /// Apply an update sent by a local connection.
    pub fn apply_local_update(&self, update: &[u8], conn: ConnectionId) -> Result<bool, DocError> {
        self.apply_update(update, UpdateOrigin::Connection(conn))
    }

    /// Apply an update received from the broker. Never re-published.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<bool, DocError> {
        self.apply_update(update, UpdateOrigin::Broker)
    }

    /// Apply an update, fan it out to local connections (skipping the
    /// originating one) and, for attached connection origins, queue the
    /// publish and the log append.
    ///
    /// What goes out is the delta the transaction actually integrated, so
    /// an update that changes nothing (an empty step 2, a duplicate) has no
    /// effect beyond the apply itself. Returns whether the replica changed.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<bool, DocError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocError::InvalidUpdate(e.to_string()))?;

        let state = self.state.lock();
        let delta = {
            let mut txn = state.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocError::InvalidUpdate(e.to_string()))?;
            txn.commit();
            if txn.delete_set().is_empty() && txn.after_state() == txn.before_state() {
                None
            } else {
                Some(Bytes::from(txn.encode_update_v1()))
            }
        };
        let Some(delta) = delta else {
            log::trace!("Update for '{}' from {origin:?} changed nothing", self.name);
            return Ok(false);
        };

        let frame = Bytes::from(Message::Sync(SyncMessage::Update(delta.to_vec())).encode());
        for (id, attached) in &state.conns {
            if origin != UpdateOrigin::Connection(*id) {
                attached.handle.send(frame.clone());
            }
        }

        if let UpdateOrigin::Connection(conn) = origin {
            if state.conns.contains_key(&conn) {
                self.replicator.publish(update_channel(&self.name), delta.clone());
                self.replicator.append(delta);
            }
        }
        Ok(true)
    }

    /// Merge an encoded awareness update.
    pub fn apply_awareness(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError> {
        let update = AwarenessUpdate::decode(update)?;
        let mut state = self.state.lock();
        let change = state.awareness.apply_update(update);
        self.on_awareness_change(&mut state, change, origin);
        Ok(())
    }

    /// Drop awareness identities that were not refreshed in time.
    pub fn expire_awareness(&self, now: Instant) {
        let mut state = self.state.lock();
        let change = state.awareness.expire_outdated(now, self.config.awareness_timeout);
        if !change.removed.is_empty() {
            log::debug!(
                "Expired {} awareness identities of '{}'",
                change.removed.len(),
                self.name
            );
        }
        self.on_awareness_change(&mut state, change, UpdateOrigin::Server);
    }

    /// Change observer for awareness: bookkeeping of controlled identities,
    /// fan-out to every connection, publish unless broker-originated.
    fn on_awareness_change(
        &self,
        state: &mut DocState,
        change: AwarenessChange,
        origin: UpdateOrigin,
    ) {
        if change.is_empty() {
            return;
        }

        if let UpdateOrigin::Connection(conn) = origin {
            if state.conns.contains_key(&conn) {
                for id in change.added.iter().chain(&change.updated) {
                    for (other, attached) in state.conns.iter_mut() {
                        if *other == conn {
                            attached.controlled.insert(*id);
                        } else {
                            attached.controlled.remove(id);
                        }
                    }
                }
            }
        }
        for id in &change.removed {
            for attached in state.conns.values_mut() {
                attached.controlled.remove(id);
            }
        }

        let encoded = state.awareness.encode_update(&change.changed_clients()).encode();
        let frame = Bytes::from(Message::Awareness(encoded.clone()).encode());
        for attached in state.conns.values() {
            attached.handle.send(frame.clone());
        }

        if origin != UpdateOrigin::Broker {
            self.replicator
                .publish(awareness_channel(&self.name), Bytes::from(encoded));
        }
    }

    /// Route a message from the document's broker subscription.
    pub fn handle_broker_message(&self, msg: BrokerMessage) {
        let result = if msg.channel == update_channel(&self.name) {
            self.apply_remote_update(&msg.payload).map(|_| ())
        } else if msg.channel == awareness_channel(&self.name) {
            self.apply_awareness(&msg.payload, UpdateOrigin::Broker)
        } else {
            log::debug!("'{}' ignoring message on channel '{}'", self.name, msg.channel);
            Ok(())
        };
        if let Err(e) = result {
            log::warn!("Dropping broker message for '{}': {e}", self.name);
        }
    }

    /// Sync step 1 announcing this replica's state vector.
    pub fn sync_step1(&self) -> Message {
        let state = self.state.lock();
        let sv = state.doc.transact().state_vector().encode_v1();
        Message::Sync(SyncMessage::Step1(sv))
    }

    /// Awareness update covering every known identity, if there is any.
    pub fn awareness_snapshot(&self) -> Option<Message> {
        let state = self.state.lock();
        if state.awareness.is_empty() {
            return None;
        }
        let update = state.awareness.encode_update(&state.awareness.clients());
        Some(Message::Awareness(update.encode()))
    }

    /// Identities currently present in the awareness state.
    pub fn awareness_clients(&self) -> Vec<ClientId> {
        self.state.lock().awareness.clients()
    }

    /// Full document state as one update.
    pub fn encode_state(&self) -> Vec<u8> {
        let state = self.state.lock();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.lock().doc.transact().state_vector()
    }

    /// Close every attached connection.
    pub fn close_connections(&self) {
        let state = self.state.lock();
        for attached in state.conns.values() {
            attached.handle.close();
        }
    }

    /// Stop the broker subscription. The in-memory replica is dropped with
    /// the last reference.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shut down and return a token cancelled once every publish and log
    /// append queued by this replica has run.
    pub fn retire(&self) -> CancellationToken {
        self.shutdown();
        self.replicator.drained()
    }

    /// Make hydration wait for `drained`, the [`SharedDoc::retire`] token of
    /// the replica this one replaces.
    pub fn follow(&self, drained: CancellationToken) {
        *self.predecessor.lock() = Some(drained);
    }

    /// Re-read the update log and apply whatever this replica is missing,
    /// as if it came from the broker. Used after a gap in the broker
    /// subscription.
    pub async fn catch_up(&self) -> Result<usize, StoreError> {
        let entries = self.log.list_ordered(&self.name).await?;
        let mut applied = 0;
        for entry in &entries {
            match self.apply_update(&entry.update, UpdateOrigin::Broker) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Skipping log entry {} of '{}': {e}", entry.id, self.name),
            }
        }
        if applied > 0 {
            log::info!("'{}' caught up {applied} missed updates from the log", self.name);
        }
        Ok(applied)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn awareness_timeout(&self) -> Duration {
        self.config.awareness_timeout
    }
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .finish()
    }
}
