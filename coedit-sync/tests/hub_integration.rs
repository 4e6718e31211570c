//! Hub integration tests.
//!
//! Verifies:
//! - Hub pub/sub never echoes a publish back to its sender
//! - The update log is reachable through the hub (append, list, compact)
//! - A hub without storage rejects log requests
//! - Sync servers opened with a hub url converge and hydrate from the hub log
//! - A hub restart ends open subscriptions and publishing resumes afterwards

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use coedit_sync::{
    load_and_maybe_compact, Broker, HubClient, HubConfig, HubServer, ServerConfig, StoreError,
    SyncServer, UpdateLog,
};
use common::{spawn_server, TestClient};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, WriteTxn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

async fn spawn_hub(storage: Option<&std::path::Path>) -> (HubServer, String) {
    let hub = HubServer::open(HubConfig::for_testing(storage)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let runner = hub.clone();
    tokio::spawn(async move { runner.serve(listener).await.unwrap() });
    (hub, format!("ws://{addr}"))
}

async fn open_server(dir: &std::path::Path, hub_url: &str) -> SocketAddr {
    let config = ServerConfig {
        hub_url: Some(hub_url.to_string()),
        hub_request_timeout: REQUEST_TIMEOUT,
        ..ServerConfig::for_testing(dir)
    };
    let server = SyncServer::open(config).await.unwrap();
    spawn_server(&server).await
}

#[tokio::test]
async fn test_hub_pubsub_skips_sender() {
    let dir = tempdir().unwrap();
    let (hub, url) = spawn_hub(Some(dir.path())).await;
    let a = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();
    let b = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();

    let mut sub_a = a.subscribe(&["notes".to_string()]).await.unwrap();
    let mut sub_b = b.subscribe(&["notes".to_string()]).await.unwrap();
    // A reply proves the hub has processed each subscribe.
    a.list_ordered("barrier").await.unwrap();
    b.list_ordered("barrier").await.unwrap();

    a.publish("notes", Bytes::from_static(b"delta")).await.unwrap();

    let msg = timeout(Duration::from_secs(3), sub_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.channel, "notes");
    assert_eq!(msg.payload, Bytes::from_static(b"delta"));

    assert!(timeout(Duration::from_millis(200), sub_a.recv()).await.is_err());
    assert_eq!(a.published(), 1);
    assert_eq!(hub.relayed(), 1);
}

#[tokio::test]
async fn test_hub_unsubscribe_stops_delivery() {
    let (_hub, url) = spawn_hub(None).await;
    let a = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();
    let b = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();

    let mut sub = b.subscribe(&["chan".to_string()]).await.unwrap();
    b.unsubscribe(sub.id()).await.unwrap();
    // Failed reply from a storage-less hub still orders the frames.
    let _ = b.list_ordered("barrier").await;

    a.publish("chan", Bytes::from_static(b"x")).await.unwrap();
    let got = timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(!matches!(got, Ok(Some(_))));
}

#[tokio::test]
async fn test_hub_update_log_roundtrip() {
    let dir = tempdir().unwrap();
    let (_hub, url) = spawn_hub(Some(dir.path())).await;
    let client = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();

    let first = client.append("doc", vec![1, 2, 3]).await.unwrap();
    let second = client.append("doc", vec![4, 5]).await.unwrap();
    client.append("other", vec![9]).await.unwrap();
    assert!(first < second);

    let entries = client.list_ordered("doc").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].update, vec![1, 2, 3]);
    assert_eq!(entries[1].update, vec![4, 5]);

    let merged = client
        .insert_and_delete_atomically("doc", vec![7, 7], &[first, second])
        .await
        .unwrap();
    assert!(merged.id > second);
    let entries = client.list_ordered("doc").await.unwrap();
    assert_eq!(entries, vec![merged]);
    assert_eq!(client.list_ordered("other").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hub_without_storage_rejects_log_requests() {
    let (_hub, url) = spawn_hub(None).await;
    let client = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();

    let err = client.append("doc", vec![1]).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn test_servers_converge_through_hub() {
    let hub_dir = tempdir().unwrap();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let (_hub, url) = spawn_hub(Some(hub_dir.path())).await;

    let addr_a = open_server(dir_a.path(), &url).await;
    let addr_b = open_server(dir_b.path(), &url).await;

    let mut alice = TestClient::connect_synced(addr_a, "shared").await;
    let mut bob = TestClient::connect_synced(addr_b, "shared").await;

    alice.insert("over the hub").await;
    bob.wait_for_text("over the hub").await;

    bob.insert("!").await;
    alice.wait_for_text("over the hub!").await;

    let probe = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();
    let probe = &probe;
    assert!(common::eventually_async(move || async move {
        probe.list_ordered("shared").await.map(|e| e.len()).unwrap_or(0) == 2
    })
    .await);

    // A third instance starts with nothing local and hydrates from the hub.
    let dir_c = tempdir().unwrap();
    let addr_c = open_server(dir_c.path(), &url).await;
    let carol = TestClient::connect_synced(addr_c, "shared").await;
    assert_eq!(carol.text(), "over the hub!");
}

#[tokio::test]
async fn test_compaction_through_hub() {
    let hub_dir = tempdir().unwrap();
    let (_hub, url) = spawn_hub(Some(hub_dir.path())).await;
    let client = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();

    let doc = Doc::new();
    for word in ["a", "b", "c", "d"] {
        let sv = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, word);
        }
        let delta = doc.transact().encode_state_as_update_v1(&sv);
        client.append("hubdoc", delta).await.unwrap();
    }

    let entries = load_and_maybe_compact(&client, "hubdoc", 4).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(common::text_of_update(&entries[0].update), "abcd");
    assert_eq!(client.list_ordered("hubdoc").await.unwrap(), entries);
}

#[tokio::test]
async fn test_hub_restart_ends_subscriptions() {
    let first = HubServer::open(HubConfig::for_testing(None)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let runner = first.clone();
    let serving = tokio::spawn(async move { runner.serve(listener).await.unwrap() });

    let client = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();
    let mut sub = client.subscribe(&["notes".to_string()]).await.unwrap();

    first.shutdown();
    serving.await.unwrap();
    let second = HubServer::open(HubConfig::for_testing(None)).unwrap();
    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    let runner = second.clone();
    tokio::spawn(async move { runner.serve(listener).await.unwrap() });

    let ended = timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
    assert!(ended.is_none());

    // A fresh subscription on the reconnected client receives again.
    let mut renewed = client.subscribe(&["notes".to_string()]).await.unwrap();
    let _ = client.list_ordered("barrier").await;
    let other = HubClient::connect(&url, REQUEST_TIMEOUT).await.unwrap();
    other.publish("notes", Bytes::from_static(b"after")).await.unwrap();
    let msg = timeout(Duration::from_secs(3), renewed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, Bytes::from_static(b"after"));
}
