//! Persistence integration tests.
//!
//! Verifies:
//! - Documents are rebuilt from the update log after a restart
//! - Hydration compacts long logs into a single full-state entry
//! - The on-disk log survives closing and reopening RocksDB
//! - A failing log rejects the connection without leaving a document behind

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coedit_sync::{
    load_and_maybe_compact, LocalBroker, LogEntry, RocksUpdateLog, StoreConfig, StoreError,
    UpdateLog,
};
use common::{eventually, open_log, spawn_server, test_server, TestClient};
use tempfile::tempdir;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, WriteTxn};

const HEARTBEAT: Duration = Duration::from_secs(30);

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Write `n` single-character edits straight into the log, returning the text.
fn seed_log(log: &RocksUpdateLog, name: &str, n: usize) -> String {
    let doc = Doc::new();
    for i in 0..n {
        let sv = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, &((b'a' + (i % 26) as u8) as char).to_string());
        }
        let delta = doc.transact().encode_state_as_update_v1(&sv);
        log.append_blocking(name, &delta).unwrap();
    }
    let txn = doc.transact();
    txn.get_text("content").unwrap().get_string(&txn)
}

/// Update log that refuses every read.
struct UnavailableLog;

#[async_trait]
impl UpdateLog for UnavailableLog {
    async fn append(&self, _: &str, _: Vec<u8>) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn list_ordered(&self, _: &str) -> Result<Vec<LogEntry>, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }

    async fn insert_and_delete_atomically(
        &self,
        _: &str,
        _: Vec<u8>,
        _: &[u64],
    ) -> Result<LogEntry, StoreError> {
        Err(StoreError::Unavailable("down".into()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_rebuilds_from_log() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path());

    {
        let server = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log.clone(), HEARTBEAT);
        let addr = spawn_server(&server).await;
        let mut client = TestClient::connect_synced(addr, "report").await;
        client.insert("Hello, ").await;
        client.insert("persistence!").await;
        assert!(eventually(|| log.list_blocking("report").unwrap().len() == 2).await);
        server.shutdown();
    }

    let restarted = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log.clone(), HEARTBEAT);
    let addr = spawn_server(&restarted).await;
    let client = TestClient::connect_synced(addr, "report").await;
    assert_eq!(client.text(), "Hello, persistence!");
}

#[tokio::test]
async fn test_hydration_compacts_long_log() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path());
    let expected = seed_log(&log, "long", 60);
    assert_eq!(log.list_blocking("long").unwrap().len(), 60);

    let server = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log.clone(), HEARTBEAT);
    let addr = spawn_server(&server).await;
    let client = TestClient::connect_synced(addr, "long").await;

    assert_eq!(client.text(), expected);
    let entries = log.list_blocking("long").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(common::text_of_update(&entries[0].update), expected);
}

#[tokio::test]
async fn test_short_log_left_alone() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path());
    let expected = seed_log(&log, "short", 10);

    let server = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log.clone(), HEARTBEAT);
    let addr = spawn_server(&server).await;
    let client = TestClient::connect_synced(addr, "short").await;

    assert_eq!(client.text(), expected);
    assert_eq!(log.list_blocking("short").unwrap().len(), 10);
}

#[tokio::test]
async fn test_compacted_log_keeps_growing_after_edits() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path());
    seed_log(&log, "doc", 55);

    let entries = load_and_maybe_compact(log.as_ref(), "doc", 50).await.unwrap();
    assert_eq!(entries.len(), 1);

    let server = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log.clone(), HEARTBEAT);
    let addr = spawn_server(&server).await;
    let mut client = TestClient::connect_synced(addr, "doc").await;
    client.insert("!").await;

    assert!(eventually(|| log.list_blocking("doc").unwrap().len() == 2).await);
    let ids: Vec<u64> = log.list_blocking("doc").unwrap().iter().map(|e| e.id).collect();
    assert!(ids[0] < ids[1]);
}

#[tokio::test]
async fn test_log_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let expected = {
        let log = RocksUpdateLog::open(StoreConfig::for_testing(&path)).unwrap();
        let text = seed_log(&log, "disk", 5);
        log.sync().unwrap();
        text
    };

    let log = Arc::new(RocksUpdateLog::open(StoreConfig::for_testing(&path)).unwrap());
    let server = test_server(dir.path(), Arc::new(LocalBroker::new().client()), log, HEARTBEAT);
    let addr = spawn_server(&server).await;
    let client = TestClient::connect_synced(addr, "disk").await;
    assert_eq!(client.text(), expected);
}

#[tokio::test]
async fn test_unavailable_log_rejects_connection() {
    let dir = tempdir().unwrap();
    let server = test_server(
        dir.path(),
        Arc::new(LocalBroker::new().client()),
        Arc::new(UnavailableLog),
        HEARTBEAT,
    );
    let addr = spawn_server(&server).await;

    let mut client = TestClient::connect(addr, "broken").await;
    let code = client.wait_closed().await;
    assert_eq!(code, Some(1011));
    assert!(eventually(|| !server.registry().contains("broken")).await);
}

#[test]
fn test_full_state_of_seeded_doc_matches() {
    let dir = tempdir().unwrap();
    let log = RocksUpdateLog::open(StoreConfig::for_testing(dir.path())).unwrap();
    let expected = seed_log(&log, "x", 3);

    let merged = coedit_sync::storage::compaction::replay(&log.list_blocking("x").unwrap()).unwrap();
    assert_eq!(common::text_of_update(&merged), expected);

    let doc = Doc::new();
    let empty = doc.transact().encode_state_as_update_v1(&StateVector::default());
    assert_eq!(common::text_of_update(&empty), "");
}
