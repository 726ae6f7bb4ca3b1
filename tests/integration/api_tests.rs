//! API integration tests for tile retrieval, listings and error handling.
//!
//! Tests verify:
//! - Tile retrieval at an exact transaction and at the current cursor
//! - Error cases (missing tile, unknown store, malformed query)
//! - WTML listing contents
//! - Status and health endpoints
//! - HTTP response codes and headers

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use plate_server::blob::FileBlobOpener;
use plate_server::server::{ErrorResponse, HealthResponse};
use plate_server::tile::TileService;
use plate_server::{create_router, RouterConfig};

use super::test_utils::{append_blob, tile_bytes, MemoryIndex, StoreFixture};

struct TestServer {
    router: Router,
    index: MemoryIndex,
    _dir: TempDir,
}

/// Store 7 ("moon") with tile (col 10, row 20, level 3) written at
/// transactions 40 and 42, and tile (0, 0, 9) written at 42.
fn test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let v40 = tile_bytes("moon-v40");
    let v42 = tile_bytes("moon-v42");
    let deep = tile_bytes("moon-deep");
    let offsets = append_blob(dir.path(), 0, &[&v40, &v42]);
    let deep_offsets = append_blob(dir.path(), 1, &[&deep]);

    let index = MemoryIndex::new().with_store(
        StoreFixture::new(7, "moon", dir.path(), "png")
            .with_description("Lunar <Mosaic>")
            .with_cursor(42)
            .with_tile((10, 20, 3), 40, 0, offsets[0])
            .with_tile((10, 20, 3), 42, 0, offsets[1])
            .with_tile((0, 0, 9), 42, 1, deep_offsets[0]),
    );

    let tile_service = TileService::new(index.clone(), FileBlobOpener);
    let router = create_router(tile_service, RouterConfig::new().with_tracing(false));

    TestServer {
        router,
        index,
        _dir: dir,
    }
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn error_body(response: axum::response::Response) -> ErrorResponse {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

// =============================================================================
// Tile Retrieval
// =============================================================================

#[tokio::test]
async fn test_tile_at_exact_transaction() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/3/10/20.png?transaction_id=42&exact=true").await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    assert_eq!(headers.get("cache-control").unwrap(), "max-age=604800");
    assert_eq!(headers.get("x-tile-transaction").unwrap(), "42");
    assert_eq!(
        headers.get("content-length").unwrap(),
        &tile_bytes("moon-v42").len().to_string()
    );

    assert_eq!(body_bytes(response).await, tile_bytes("moon-v42"));
}

#[tokio::test]
async fn test_tile_at_earlier_transaction() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/3/10/20.png?transaction_id=41").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, tile_bytes("moon-v40"));
}

#[tokio::test]
async fn test_tile_at_current_cursor() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/3/10/20.png").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-tile-transaction").unwrap(), "42");
    assert_eq!(body_bytes(response).await, tile_bytes("moon-v42"));
}

#[tokio::test]
async fn test_deep_tile_has_short_cache_lifetime() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/9/0/0.png").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "max-age=1200"
    );
    assert_eq!(body_bytes(response).await, tile_bytes("moon-deep"));
}

#[tokio::test]
async fn test_nocache_parameter() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/3/10/20.png?nocache=1").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
}

#[tokio::test]
async fn test_head_request_has_headers_only() {
    let server = test_server();
    let request = Request::builder()
        .method("HEAD")
        .uri("/wwt/p/7/3/10/20.png")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/png");
    assert!(body_bytes(response).await.is_empty());
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test]
async fn test_missing_tile_at_exact_transaction() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/7/3/10/20.png?transaction_id=41&exact=1").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = error_body(response).await;
    assert_eq!(error.error, "tile_not_found");
    assert_eq!(error.status, Some(404));
}

#[tokio::test]
async fn test_unknown_store() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/8/3/10/20.png").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_body(response).await.error, "store_not_found");
}

#[tokio::test]
async fn test_bad_query_is_400() {
    let server = test_server();
    for uri in [
        "/wwt/p/7/3/10/20.png?transaction_id=-5",
        "/wwt/p/7/3/10/20.png?transaction_id=abc",
        "/wwt/p/7/3/10/20.png?exact=maybe",
    ] {
        let response = get(&server.router, uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(error_body(response).await.error, "bad_request");
    }
}

#[tokio::test]
async fn test_unrecognised_path_is_404() {
    let server = test_server();
    let response = get(&server.router, "/wwt/p/not/a/tile").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_blob_file_is_500() {
    let server = test_server();
    let dir = tempfile::tempdir().unwrap();
    server.index.add_store(
        StoreFixture::new(8, "ghost", dir.path(), "png")
            .with_cursor(1)
            .with_tile((0, 0, 0), 1, 5, 0),
    );

    let response = get(&server.router, "/wwt/p/8/0/0/0.png").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_body(response).await.error, "server_error");
}

// =============================================================================
// WTML Listing
// =============================================================================

#[tokio::test]
async fn test_wtml_listing() {
    let server = test_server();
    let request = Request::builder()
        .uri("/wwt/p/moon.wtml?nocache=1")
        .header("host", "plates.example.org")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/xml"
    );

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.starts_with("<?xml version='1.0' encoding='UTF-8'?>"));
    assert!(body.contains("<Folder Name='Ames Planetary Content' Group='View'>"));
    assert!(body.contains("Name='Lunar &lt;Mosaic&gt;'"));
    assert!(body.contains("Url='http://plates.example.org/wwt/p/7/{1}/{2}/{3}.png?nocache=1'"));
    assert!(body.contains(
        "<ThumbnailUrl>http://plates.example.org/wwt/p/7/0/0/0.png?nocache=1</ThumbnailUrl>"
    ));
}

#[tokio::test]
async fn test_wtml_listing_sees_new_store() {
    let server = test_server();
    let dir = tempfile::tempdir().unwrap();
    server
        .index
        .add_store(StoreFixture::new(11, "mars", dir.path(), "jpg").with_description("Mars"));

    let response = get(&server.router, "/wwt/p/all.wtml").await;
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(body.matches("<ImageSet ").count(), 2);
    assert!(body.contains("FileType='.jpg'"));
}

// =============================================================================
// Status and Health
// =============================================================================

#[tokio::test]
async fn test_status_endpoint() {
    let server = test_server();
    // Populate the cache.
    get(&server.router, "/wwt/p/7/3/10/20.png").await;

    let response = get(&server.router, "/wwt/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.starts_with("Moo!"));
    assert!(body.contains("Cached stores: 1"));

    let response = get(&server.router, "/wwt/status?short").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = test_server();
    let response = get(&server.router, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_custom_base_path() {
    let dir = tempfile::tempdir().unwrap();
    let payload = tile_bytes("base");
    let offsets = append_blob(dir.path(), 0, &[&payload]);
    let index = MemoryIndex::new().with_store(
        StoreFixture::new(1, "earth", dir.path(), "jpg")
            .with_cursor(3)
            .with_tile((0, 0, 0), 3, 0, offsets[0]),
    );
    let router = create_router(
        TileService::new(index, FileBlobOpener),
        RouterConfig::new().with_base_path("/tiles").with_tracing(false),
    );

    let response = get(&router, "/tiles/p/1/0/0/0.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/jpeg");

    let response = get(&router, "/wwt/p/1/0/0/0.jpg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
