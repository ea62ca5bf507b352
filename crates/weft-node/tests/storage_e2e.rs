//! Storage peers: durable backends speaking the sync protocol.

use std::sync::Arc;

use serde_json::json;
use weft_core::{CoValueKind, MapOp};
use weft_node::LocalNode;
use weft_store::{FileSystemBackend, MemoryBackend, SqliteBackend, StorageBackend};
use weft_testkit::settle;

async fn roundtrip_through<B: StorageBackend + 'static>(
    make_backend: impl Fn() -> Arc<B>,
) {
    let backend = make_backend();

    // First device: create and edit, everything flows to storage.
    let (alice, credentials) = LocalNode::with_new_account("alice").await.unwrap();
    alice.add_storage("storage", Arc::clone(&backend)).await;
    alice.resync_all().await.unwrap();

    let team = alice.create_group().await.unwrap();
    let doc = alice.create_covalue(CoValueKind::Map, Some(&team)).await.unwrap();
    alice
        .edit(&doc, vec![MapOp::set("title", json!("notes"))])
        .await
        .unwrap();
    settle().await;

    // Second device: same account, fresh node, only storage to load from.
    let device2 = LocalNode::new(credentials);
    device2.add_storage("storage", backend).await;
    device2.load(device2.account()).await.unwrap();
    device2.load(&doc).await.unwrap();

    assert!(device2.is_available(&team).await);
    let map = device2.map_of(&doc).await.unwrap();
    assert_eq!(map.get("title"), Some(&json!("notes")));
}

#[tokio::test]
async fn test_memory_storage_roundtrip() {
    roundtrip_through(|| Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn test_filesystem_storage_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    roundtrip_through(move || Arc::new(FileSystemBackend::open(&path).unwrap())).await;
}

#[tokio::test]
async fn test_sqlite_storage_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weft.db");
    roundtrip_through(move || Arc::new(SqliteBackend::open(&path).unwrap())).await;
}

#[tokio::test]
async fn test_filesystem_storage_survives_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileSystemBackend::open(dir.path()).unwrap());

    let (alice, credentials) = LocalNode::with_new_account("alice").await.unwrap();
    alice.add_storage("storage", Arc::clone(&backend)).await;
    alice.resync_all().await.unwrap();

    let team = alice.create_group().await.unwrap();
    let doc = alice.create_covalue(CoValueKind::Map, Some(&team)).await.unwrap();
    alice
        .edit(&doc, vec![MapOp::set("a", json!(1))])
        .await
        .unwrap();
    settle().await;

    backend.compact().await.unwrap();

    // More edits after compaction land in a fresh WAL.
    alice
        .edit(&doc, vec![MapOp::set("b", json!(2))])
        .await
        .unwrap();
    settle().await;

    // A second device sees both the compacted and the fresh data.
    let device2 = LocalNode::new(credentials);
    device2.add_storage("storage", backend).await;
    device2.load(device2.account()).await.unwrap();
    device2.load(&doc).await.unwrap();

    let map = device2.map_of(&doc).await.unwrap();
    assert_eq!(map.get("a"), Some(&json!(1)));
    assert_eq!(map.get("b"), Some(&json!(2)));
}
