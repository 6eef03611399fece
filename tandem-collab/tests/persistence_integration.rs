//! Persistence integration tests.
//!
//! Verifies:
//! - Session teardown writes a snapshot that the next session loads
//! - A restarted server serves the checkpointed text
//! - Periodic checkpoints while clients stay attached
//! - The same flows over RocksDB (feature `rocksdb`)

use std::sync::Arc;
use tandem_collab::{
    AllowAnonymous, DocumentId, MemoryStore, Persistence, RateLimit, ServerConfig, SyncClient,
    SyncServer,
};
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn test_config() -> ServerConfig {
    ServerConfig {
        rate_limit: RateLimit {
            max_messages: 1_000,
            window: Duration::from_secs(1),
        },
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig, store: Arc<dyn Persistence>) -> (SyncServer, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(config, Arc::new(AllowAnonymous), store);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn write_text(url: &str, doc: &str, text: &str) -> SyncClient {
    let mut client = SyncClient::new(url, doc);
    client.connect().await.unwrap();
    let start = client.version().await;
    client.insert(0, text).await.unwrap();
    let c = &client;
    eventually(|| async move { c.version().await > start }).await;
    client
}

// ─── Memory store ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_teardown_persists_and_rejoin_loads() {
    let store = Arc::new(MemoryStore::new());
    let (server, url) = start_server(test_config(), store.clone()).await;
    let doc = DocumentId::from("kept");

    let mut writer = write_text(&url, "kept", "survives").await;
    writer.close().await;
    let registry = server.registry();
    eventually(|| async move { registry.session_count().await == 0 }).await;

    let stored = store.load(&doc).unwrap().unwrap();
    assert_eq!((stored.content.as_str(), stored.version), ("survives", 1));

    let mut reader = SyncClient::new(url, "kept");
    reader.connect().await.unwrap();
    assert_eq!(reader.content().await, "survives");
    assert_eq!(reader.version().await, 1);

    // The reloaded session keeps counting from the stored version
    reader.insert(8, "!").await.unwrap();
    let r = &reader;
    eventually(|| async move { r.version().await == 2 }).await;
    assert_eq!(reader.content().await, "survives!");
}

#[tokio::test]
async fn test_restart_serves_checkpointed_text() {
    let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
    let (first, url) = start_server(test_config(), store.clone()).await;
    let _writer = write_text(&url, "restart", "before").await;
    first.shutdown().await.unwrap();

    let (_second, url) = start_server(test_config(), store).await;
    let mut client = SyncClient::new(url, "restart");
    client.connect().await.unwrap();
    assert_eq!(client.content().await, "before");
    assert_eq!(client.version().await, 1);
}

#[tokio::test]
async fn test_periodic_checkpoint() {
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        checkpoint_every: 2,
        ..test_config()
    };
    let (_server, url) = start_server(config, store.clone()).await;
    let doc = DocumentId::from("ticks");

    let client = write_text(&url, "ticks", "a").await;
    client.insert(0, "b").await.unwrap();
    let c = &client;
    eventually(|| async move { c.version().await == 2 }).await;

    // Still attached, yet the snapshot is on disk
    let (s, d) = (&store, &doc);
    eventually(|| async move { s.load(d).unwrap().is_some_and(|stored| stored.version == 2) }).await;
    assert_eq!(store.load(&doc).unwrap().unwrap().content, client.content().await);
}

#[tokio::test]
async fn test_documents_persist_independently() {
    let store = Arc::new(MemoryStore::new());
    let (server, url) = start_server(test_config(), store.clone()).await;

    let mut left = write_text(&url, "left", "L").await;
    let mut right = write_text(&url, "right", "R").await;
    left.close().await;
    let registry = server.registry();
    eventually(|| async move { registry.session_count().await == 1 }).await;

    assert_eq!(store.load(&DocumentId::from("left")).unwrap().unwrap().content, "L");
    assert!(store.load(&DocumentId::from("right")).unwrap().is_none());

    right.close().await;
    let s = &store;
    eventually(|| async move { s.len() == 2 }).await;
}

// ─── RocksDB ─────────────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;
    use tandem_collab::{RocksConfig, RocksStore};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocks_restart_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksStore::open(RocksConfig::for_testing(dir.path())).unwrap());

        let (first, url) = start_server(test_config(), store.clone()).await;
        let _writer = write_text(&url, "durable", "on disk").await;
        first.shutdown().await.unwrap();

        let meta = store.metadata(&DocumentId::from("durable")).unwrap().unwrap();
        assert_eq!(meta.version, 1);

        let (_second, url) = start_server(test_config(), store).await;
        let mut client = SyncClient::new(url, "durable");
        client.connect().await.unwrap();
        assert_eq!(client.content().await, "on disk");
    }
}
