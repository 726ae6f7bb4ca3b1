//! RPC and remote index integration tests.
//!
//! Tests verify:
//! - The `index` service answers list/open/read/cursor calls over real transports
//! - Remote tile misses surface as `TileNotFound`
//! - A call with no server behind it fails with a timeout after all tries
//! - The index cache works unchanged on top of the remote index
//! - Clients and servers ride out a broker restart

use std::sync::Arc;
use std::time::{Duration, Instant};

use plate_server::cache::IndexCache;
use plate_server::channel::{self, Broker};
use plate_server::error::{IndexError, RpcError};
use plate_server::index::{IndexRpcService, IndexService, RemoteIndex, TileStore};
use plate_server::rpc::{RpcClient, RpcServer};
use plate_server::PlateError;

use super::test_utils::{MemoryIndex, StoreFixture};

const TIMEOUT: Duration = Duration::from_millis(500);

fn fixture_index() -> MemoryIndex {
    MemoryIndex::new()
        .with_store(
            StoreFixture::new(7, "moon", std::path::Path::new("/plates/moon"), "png")
                .with_description("Moon")
                .with_cursor(50)
                .with_tile((10, 20, 3), 40, 2, 4096)
                .with_tile((10, 20, 3), 45, 3, 0),
        )
        .with_store(StoreFixture::new(
            9,
            "mars",
            std::path::Path::new("/plates/mars"),
            "jpg",
        ))
}

/// Bind an index RPC server at `address` and run it in the background.
async fn spawn_index_server(address: &str, index: MemoryIndex) -> tokio::task::JoinHandle<()> {
    let channel = channel::bind(address, "index-server").await.unwrap();
    let server = RpcServer::new(channel).with_service("index", Arc::new(IndexRpcService::new(index)));
    tokio::spawn(async move {
        let _ = server.serve().await;
    })
}

async fn exercise_remote_index(index: RemoteIndex) {
    let mut names = index.list_stores().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["mars".to_string(), "moon".to_string()]);

    let moon = index.open_store("moon").await.unwrap();
    assert_eq!(moon.header().store_id, 7);
    assert_eq!(moon.header().description.as_deref(), Some("Moon"));
    assert_eq!(moon.transaction_cursor().await.unwrap(), 50);

    // latest at or before 44 is the write at 40
    let record = moon.read_request(10, 20, 3, 44, false).await.unwrap();
    assert_eq!((record.blob_id, record.blob_offset), (2, 4096));

    let record = moon.read_request(10, 20, 3, 45, true).await.unwrap();
    assert_eq!((record.blob_id, record.blob_offset), (3, 0));

    let missing = moon.read_request(10, 20, 3, 44, true).await;
    assert!(matches!(
        missing,
        Err(IndexError::TileNotFound {
            col: 10,
            row: 20,
            level: 3,
            transaction: 44
        })
    ));

    let unknown = index.open_store("venus").await;
    assert!(matches!(unknown, Err(IndexError::StoreNotFound(_))));
}

#[tokio::test]
async fn test_remote_index_over_tcp() {
    let channel = channel::bind("tcp://127.0.0.1:0", "index-server").await.unwrap();
    let address = channel.address().to_string();
    let server = RpcServer::new(channel)
        .with_service("index", Arc::new(IndexRpcService::new(fixture_index())));
    let handle = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    let index = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    exercise_remote_index(index).await;

    handle.abort();
}

#[tokio::test]
async fn test_remote_index_over_broker() {
    let (addr, broker) = Broker::spawn("127.0.0.1:0").await.unwrap();
    let address = format!("broker://{addr}/index/index");
    let server = spawn_index_server(&address, fixture_index()).await;

    let index = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    exercise_remote_index(index).await;

    server.abort();
    broker.abort();
}

#[tokio::test]
async fn test_two_clients_share_one_broker_queue() {
    let (addr, broker) = Broker::spawn("127.0.0.1:0").await.unwrap();
    let address = format!("broker://{addr}/index/shared");
    let server = spawn_index_server(&address, fixture_index()).await;

    // Same base identity; the process-unique suffix keeps reply queues apart.
    let first = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    let second = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    assert_ne!(first.client().client_id(), second.client().client_id());

    let (a, b) = tokio::join!(first.list_stores(), second.list_stores());
    assert_eq!(a.unwrap().len(), 2);
    assert_eq!(b.unwrap().len(), 2);

    server.abort();
    broker.abort();
}

#[tokio::test]
async fn test_remote_index_survives_broker_restart() {
    let (addr, broker) = Broker::spawn("127.0.0.1:0").await.unwrap();
    let address = format!("broker://{addr}/index/restart");
    let server = spawn_index_server(&address, fixture_index()).await;

    let index = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    assert_eq!(index.list_stores().await.unwrap().len(), 2);

    broker.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, broker) = Broker::spawn(&addr.to_string()).await.unwrap();

    // Give the server time to notice and re-declare its queue.
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The same client and the same server carry on over the new broker.
    assert_eq!(index.list_stores().await.unwrap().len(), 2);

    server.abort();
    broker.abort();
}

#[tokio::test]
async fn test_call_without_server_times_out() {
    // The bound end exists but nobody serves it.
    let _silent = channel::bind("inproc://rpc-silent", "server").await.unwrap();
    let client = RpcClient::connect("inproc://rpc-silent", "client")
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(50))
        .with_tries(3)
        .with_service("index");

    let start = Instant::now();
    let result = client.invoke("index", "ListRequest", Default::default()).await;

    assert!(matches!(result, Err(RpcError::Timeout { tries: 3, .. })));
    assert!(start.elapsed() >= Duration::from_millis(140));
}

#[tokio::test]
async fn test_index_cache_over_remote_index() {
    let memory = fixture_index();
    let channel = channel::bind("tcp://127.0.0.1:0", "index-server").await.unwrap();
    let address = channel.address().to_string();
    let server = RpcServer::new(channel)
        .with_service("index", Arc::new(IndexRpcService::new(memory.clone())));
    let handle = tokio::spawn(async move {
        let _ = server.serve().await;
    });

    let index = RemoteIndex::connect(&address, "plate_server", TIMEOUT, 3)
        .await
        .unwrap();
    let cache = IndexCache::new(index);

    // First lookup misses and triggers a resync.
    let moon = cache.resolve(7).await.unwrap();
    assert_eq!(moon.short_name, "moon");
    assert_eq!(moon.description, "Moon");
    assert_eq!(moon.read_cursor, 50);
    assert_eq!(cache.len().await, 2);

    // The default description is "<name>.<cursor>".
    let mars = cache.resolve(9).await.unwrap();
    assert_eq!(mars.description, "mars.0");

    assert!(matches!(
        cache.resolve(11).await,
        Err(PlateError::StoreNotFound(11))
    ));

    handle.abort();
}
