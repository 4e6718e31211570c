//! Process-wide table of live documents.
//!
//! An entry lives exactly as long as it has at least one attached
//! connection. Attaching and detaching happen under the registry lock, so a
//! last-connection teardown can never race a new connection into a replica
//! that is being destroyed. Lock order is registry, then document.
//!
//! A destroyed document may still have log appends in flight. Its
//! successor under the same name waits for them before hydrating.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::document::{ConnectionHandle, ConnectionId, DocConfig, SharedDoc};
use crate::storage::UpdateLog;

#[derive(Default)]
struct Table {
    live: HashMap<String, Arc<SharedDoc>>,
    /// Retired documents whose queued effects have not finished yet.
    draining: HashMap<String, CancellationToken>,
}

pub struct DocumentRegistry {
    docs: Mutex<Table>,
    config: DocConfig,
    broker: Arc<dyn Broker>,
    log: Arc<dyn UpdateLog>,
}

impl DocumentRegistry {
    pub fn new(config: DocConfig, broker: Arc<dyn Broker>, log: Arc<dyn UpdateLog>) -> Self {
        Self {
            docs: Mutex::new(Table::default()),
            config,
            broker,
            log,
        }
    }

    /// Existing entry for `name`, or a freshly created one. The flag is
    /// `true` when the entry was created by this call.
    pub fn resolve(&self, name: &str) -> (Arc<SharedDoc>, bool) {
        let mut docs = self.docs.lock();
        self.resolve_locked(&mut docs, name)
    }

    fn resolve_locked(&self, docs: &mut Table, name: &str) -> (Arc<SharedDoc>, bool) {
        if let Some(doc) = docs.live.get(name) {
            return (doc.clone(), false);
        }
        let doc = SharedDoc::new(
            name,
            self.config.clone(),
            self.broker.clone(),
            self.log.clone(),
        );
        if let Some(drained) = docs.draining.remove(name) {
            if !drained.is_cancelled() {
                doc.follow(drained);
            }
        }
        docs.live.insert(name.to_string(), doc.clone());
        log::info!("Created document '{name}'");
        (doc, true)
    }

    /// Resolve `name` and attach `handle` to it in one step.
    pub fn acquire(&self, name: &str, handle: ConnectionHandle) -> (Arc<SharedDoc>, bool) {
        let mut docs = self.docs.lock();
        let (doc, created) = self.resolve_locked(&mut docs, name);
        doc.attach(handle);
        (doc, created)
    }

    /// Detach `conn` from `doc`; tear the document down when it was the
    /// last connection. Returns `true` when the document was destroyed.
    pub fn release(&self, doc: &Arc<SharedDoc>, conn: ConnectionId) -> bool {
        let mut docs = self.docs.lock();
        doc.detach(conn);
        if doc.connection_count() > 0 {
            return false;
        }

        let registered = docs
            .live
            .get(doc.name())
            .is_some_and(|current| Arc::ptr_eq(current, doc));
        if !registered {
            doc.shutdown();
            return false;
        }

        docs.live.remove(doc.name());
        docs.draining.retain(|_, drained| !drained.is_cancelled());
        docs.draining.insert(doc.name().to_string(), doc.retire());
        log::info!("Destroyed document '{}' (no connections left)", doc.name());
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<SharedDoc>> {
        self.docs.lock().live.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.docs.lock().live.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.docs.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().live.is_empty()
    }

    /// Names of the live documents, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.lock().live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every connection of every document. Documents are removed as
    /// their sessions release them.
    pub fn close_all(&self) {
        let docs: Vec<Arc<SharedDoc>> = self.docs.lock().live.values().cloned().collect();
        for doc in docs {
            doc.close_connections();
        }
    }
}
