//! Ephemeral presence state ("awareness") for one shared document.
//!
//! Each client identity owns a JSON payload (cursor, user name, ...) and a
//! clock it bumps on every change. Merging is last-writer-wins on that
//! clock; a `null` payload is a tombstone.
//!
//! ```text
//! remote update ──► Awareness::apply_update ──► AwarenessChange
//! disconnect    ──► Awareness::remove_states ─┘      │
//! idle timeout  ──► Awareness::expire_outdated ┘     ▼
//!                                       encode_update(changed ids)
//! ```
//!
//! Wire format (y-protocols compatible):
//! `varuint(n)` then `n × (varuint client • varuint clock • varstring json)`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::protocol::ProtocolError;

/// Identity of an awareness participant (a Yjs client id).
pub type ClientId = u64;

/// JSON text used on the wire for a removed identity.
const TOMBSTONE: &str = "null";

/// One identity's entry in an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// Raw JSON payload, `None` for a tombstone.
    pub state: Option<String>,
}

/// A batch of awareness entries as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.entries.len() as u32);
        for entry in &self.entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            buf.write_string(entry.state.as_deref().unwrap_or(TOMBSTONE));
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let len: u32 = cursor.read_var()?;
        let mut entries = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            let client_id: ClientId = cursor.read_var()?;
            let clock: u64 = cursor.read_var()?;
            let json = cursor.read_string()?;
            let state = if json == TOMBSTONE {
                None
            } else {
                Some(json.to_string())
            };
            entries.push(AwarenessEntry { client_id, clock, state });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identities touched by one awareness mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every identity in the change, in added/updated/removed order.
    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Awareness state of one document.
///
/// Metadata (clock) outlives the state itself so that a removal can be
/// encoded as a tombstone carrying the last clock peers have seen.
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<ClientId, String>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update. An entry wins when its clock is newer, or when it is
    /// a tombstone with an equal clock for an identity still present.
    pub fn apply_update(&mut self, update: AwarenessUpdate) -> AwarenessChange {
        self.apply_update_at(update, Instant::now())
    }

    fn apply_update_at(&mut self, update: AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in update.entries {
            let current_clock = self.meta.get(&entry.client_id).map_or(0, |m| m.clock);
            let present = self.states.contains_key(&entry.client_id);
            let accept = current_clock < entry.clock
                || (current_clock == entry.clock && entry.state.is_none() && present);
            if !accept {
                log::trace!(
                    "Ignoring stale awareness entry for client {} (clock {} <= {})",
                    entry.client_id,
                    entry.clock,
                    current_clock
                );
                continue;
            }

            self.meta.insert(
                entry.client_id,
                ClientMeta { clock: entry.clock, last_updated: now },
            );

            match entry.state {
                Some(state) => {
                    if self.states.insert(entry.client_id, state).is_some() {
                        change.updated.push(entry.client_id);
                    } else {
                        change.added.push(entry.client_id);
                    }
                }
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
            }
        }

        change
    }

    /// Remove the given identities; unknown or already removed ids are skipped.
    pub fn remove_states(&mut self, clients: &[ClientId]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for client in clients {
            if self.states.remove(client).is_some() {
                change.removed.push(*client);
            }
        }
        change
    }

    /// Remove identities that have not been refreshed within `timeout`.
    pub fn expire_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessChange {
        let outdated: Vec<ClientId> = self
            .states
            .keys()
            .filter(|id| {
                self.meta
                    .get(id)
                    .is_some_and(|m| now.saturating_duration_since(m.last_updated) >= timeout)
            })
            .copied()
            .collect();
        self.remove_states(&outdated)
    }

    /// Encode the given identities. Removed ones become tombstones; ids never
    /// seen are left out.
    pub fn encode_update(&self, clients: &[ClientId]) -> AwarenessUpdate {
        let entries = clients
            .iter()
            .filter_map(|id| {
                let meta = self.meta.get(id)?;
                Some(AwarenessEntry {
                    client_id: *id,
                    clock: meta.clock,
                    state: self.states.get(id).cloned(),
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Identities that currently have a state.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self, client: ClientId) -> Option<&str> {
        self.states.get(&client).map(String::as_str)
    }

    pub fn clock(&self, client: ClientId) -> Option<u64> {
        self.meta.get(&client).map(|m| m.clock)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
