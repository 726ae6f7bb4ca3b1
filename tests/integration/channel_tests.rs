//! Channel integration tests.
//!
//! Tests verify, for every transport:
//! - A message round-trips from a connected channel to a bound one and back
//! - Replies reach the right client when many clients share one server loop
//! - A receive that times out yields `None`, not an error
//! - Zero-length messages survive every transport
//! - Closing a bound socket endpoint hangs up on its peers

use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;

use plate_server::channel::{self, Broker, Channel};

const CLIENTS: usize = 30;
const MESSAGES: usize = 1000;

// =============================================================================
// Fixtures
// =============================================================================

/// Owns whatever a transport needs to stay alive for the test.
enum Fixture {
    None,
    Dir(TempDir),
    Broker(tokio::task::JoinHandle<()>),
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Fixture::Broker(handle) = self {
            handle.abort();
        }
    }
}

/// Bind a server channel for `transport` and return it with the address
/// clients should connect to.
async fn bind_server(transport: &str, name: &str) -> (Box<dyn Channel>, String, Fixture) {
    match transport {
        "inproc" => {
            let address = format!("inproc://{name}");
            let server = channel::bind(&address, "server").await.unwrap();
            (server, address, Fixture::None)
        }
        "ipc" => {
            let dir = tempfile::tempdir().unwrap();
            let address = format!("ipc://{}", dir.path().join(format!("{name}.sock")).display());
            let server = channel::bind(&address, "server").await.unwrap();
            (server, address, Fixture::Dir(dir))
        }
        "tcp" => {
            let server = channel::bind("tcp://127.0.0.1:0", "server").await.unwrap();
            let address = server.address().to_string();
            (server, address, Fixture::None)
        }
        "broker" => {
            let (addr, handle) = Broker::spawn("127.0.0.1:0").await.unwrap();
            let address = format!("broker://{addr}/test/{name}");
            let server = channel::bind(&address, "server").await.unwrap();
            (server, address, Fixture::Broker(handle))
        }
        other => panic!("unknown transport {other}"),
    }
}

// =============================================================================
// Round trip
// =============================================================================

async fn round_trip(transport: &str) {
    let (mut server, address, _fixture) = bind_server(transport, &format!("round-{transport}")).await;
    let mut client = channel::connect(&address, "client").await.unwrap();

    client.send(Bytes::from_static(b"ping")).await.unwrap();
    let request = server
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("server should receive");
    assert_eq!(&request[..], b"ping");

    server.send(Bytes::from_static(b"pong")).await.unwrap();
    let reply = client
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("client should receive");
    assert_eq!(&reply[..], b"pong");

    client.close().await;
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_round_trip_inproc() {
    round_trip("inproc").await;
}

#[tokio::test]
async fn test_round_trip_ipc() {
    round_trip("ipc").await;
}

#[tokio::test]
async fn test_round_trip_tcp() {
    round_trip("tcp").await;
}

#[tokio::test]
async fn test_round_trip_broker() {
    round_trip("broker").await;
}

async fn empty_round_trip(transport: &str) {
    let (mut server, address, _fixture) = bind_server(transport, &format!("empty-{transport}")).await;
    let mut client = channel::connect(&address, "client").await.unwrap();

    client.send(Bytes::new()).await.unwrap();
    let request = server
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("server should receive the empty message");
    assert!(request.is_empty());

    server.send(Bytes::new()).await.unwrap();
    let reply = client
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("client should receive the empty reply");
    assert!(reply.is_empty());
}

#[tokio::test]
async fn test_empty_message_inproc() {
    empty_round_trip("inproc").await;
}

#[tokio::test]
async fn test_empty_message_ipc() {
    empty_round_trip("ipc").await;
}

#[tokio::test]
async fn test_empty_message_tcp() {
    empty_round_trip("tcp").await;
}

#[tokio::test]
async fn test_empty_message_broker() {
    empty_round_trip("broker").await;
}

// =============================================================================
// Reply routing under concurrency
// =============================================================================

/// Many clients, one echoing server loop. Every client must get back exactly
/// its own messages, in order.
async fn reply_routing(transport: &str) {
    let (mut server, address, _fixture) =
        bind_server(transport, &format!("routing-{transport}")).await;

    let echo = tokio::spawn(async move {
        let mut handled = 0usize;
        while handled < CLIENTS * MESSAGES {
            match server.receive_timeout(Duration::from_secs(10)).await {
                Ok(Some(message)) => {
                    server.send(message).await.unwrap();
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => panic!("server receive failed: {e}"),
            }
        }
        handled
    });

    let mut clients = Vec::new();
    for client_id in 0..CLIENTS {
        let address = address.clone();
        clients.push(tokio::spawn(async move {
            let identity = format!("client-{client_id}");
            let mut channel = channel::connect(&address, &identity).await.unwrap();
            for seq in 0..MESSAGES {
                let message = format!("{client_id}:{seq}");
                channel.send(Bytes::from(message.clone())).await.unwrap();
                let reply = channel
                    .receive_timeout(Duration::from_secs(10))
                    .await
                    .unwrap()
                    .expect("reply should arrive");
                assert_eq!(reply, Bytes::from(message));
            }
            channel.close().await;
        }));
    }

    for client in clients {
        client.await.unwrap();
    }
    assert_eq!(echo.await.unwrap(), CLIENTS * MESSAGES);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_routing_inproc() {
    reply_routing("inproc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_routing_ipc() {
    reply_routing("ipc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_routing_tcp() {
    reply_routing("tcp").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_routing_broker() {
    reply_routing("broker").await;
}

// =============================================================================
// Timeouts
// =============================================================================

async fn receive_times_out(transport: &str) {
    let (_server, address, _fixture) = bind_server(transport, &format!("quiet-{transport}")).await;
    let mut client = channel::connect(&address, "client").await.unwrap();

    let start = Instant::now();
    let received = client.receive_timeout(Duration::from_millis(100)).await;
    let elapsed = start.elapsed();

    assert!(matches!(received, Ok(None)));
    assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test]
async fn test_timeout_is_not_an_error_inproc() {
    receive_times_out("inproc").await;
}

#[tokio::test]
async fn test_timeout_is_not_an_error_ipc() {
    receive_times_out("ipc").await;
}

#[tokio::test]
async fn test_timeout_is_not_an_error_tcp() {
    receive_times_out("tcp").await;
}

#[tokio::test]
async fn test_timeout_is_not_an_error_broker() {
    receive_times_out("broker").await;
}

#[tokio::test]
async fn test_default_timeout_applies_to_receive() {
    let (_server, address, _fixture) = bind_server("inproc", "default-timeout").await;
    let mut client = channel::connect(&address, "client").await.unwrap();
    client.set_timeout(Duration::from_millis(50));

    assert_eq!(client.timeout(), Duration::from_millis(50));
    assert!(matches!(client.receive().await, Ok(None)));
}

#[tokio::test]
async fn test_connect_to_unknown_inproc_fails() {
    let result = channel::connect("inproc://nobody-home", "client").await;
    assert!(result.is_err());
}

// =============================================================================
// Shutdown
// =============================================================================

async fn close_hangs_up_on_peers(transport: &str) {
    let (mut server, address, _fixture) = bind_server(transport, &format!("hangup-{transport}")).await;
    let mut client = channel::connect(&address, "client").await.unwrap();

    client.send(Bytes::from_static(b"hello")).await.unwrap();
    server
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("server should receive");

    server.close().await;
    assert!(!server.is_open());

    let result = client.receive_timeout(Duration::from_secs(5)).await;
    assert!(result.is_err(), "{result:?}");
}

#[tokio::test]
async fn test_close_hangs_up_on_peers_ipc() {
    close_hangs_up_on_peers("ipc").await;
}

#[tokio::test]
async fn test_close_hangs_up_on_peers_tcp() {
    close_hangs_up_on_peers("tcp").await;
}
