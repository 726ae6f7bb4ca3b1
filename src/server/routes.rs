//! Router configuration for the plate server.
//!
//! # Route Structure
//!
//! ```text
//! /health                   - Health check
//! <base>/status             - Diagnostic status
//! <base>/p/{*path}          - Tiles and WTML listings
//! ```
//!
//! # Example
//!
//! ```ignore
//! use plate_server::blob::FileBlobOpener;
//! use plate_server::index::RemoteIndex;
//! use plate_server::server::{create_router, RouterConfig};
//! use plate_server::tile::TileService;
//!
//! let index = RemoteIndex::connect("broker://127.0.0.1:5672/index/index", "plate_server", timeout, 5).await?;
//! let tile_service = TileService::new(index, FileBlobOpener);
//!
//! let router = create_router(tile_service, RouterConfig::new().with_base_path("/wwt"));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::any::Any;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http::header::CONTENT_TYPE;
use http::Method;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use super::handlers::{health_handler, plate_handler, status_handler, AppState, ErrorResponse};
use super::wtml::DEFAULT_DEM_URL;
use crate::blob::BlobOpener;
use crate::index::IndexService;
use crate::tile::TileService;

/// Default mount point.
pub const DEFAULT_BASE_PATH: &str = "/wwt";

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Mount point of the status and plate routes
    pub base_path: String,
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Whether to enable request tracing
    pub enable_tracing: bool,
    /// `DemUrl` advertised in WTML listings
    pub dem_url: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    /// Create a router configuration.
    ///
    /// By default:
    /// - Routes are mounted under `/wwt`
    /// - CORS allows any origin
    /// - Tracing is enabled
    pub fn new() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_string(),
            cors_origins: None,
            enable_tracing: true,
            dem_url: DEFAULT_DEM_URL.to_string(),
        }
    }

    /// Set the mount point. A trailing slash is ignored; an empty path mounts
    /// at the root.
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = normalize_base_path(&base_path.into());
        self
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    pub fn with_dem_url(mut self, dem_url: impl Into<String>) -> Self {
        self.dem_url = dem_url.into();
        self
    }
}

fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// This function builds the complete Axum router with:
/// - Health, status and plate routes
/// - Panic recovery mapped to a JSON 500
/// - CORS configuration
/// - Request tracing (optional)
pub fn create_router<I, O>(tile_service: TileService<I, O>, config: RouterConfig) -> Router
where
    I: IndexService + 'static,
    O: BlobOpener + 'static,
{
    let base = normalize_base_path(&config.base_path);
    let app_state = AppState::new(tile_service, base.clone()).with_dem_url(&config.dem_url);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route(&format!("{base}/status"), get(status_handler::<I, O>))
        .route(&format!("{base}/p/{{*path}}"), get(plate_handler::<I, O>))
        .with_state(app_state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(build_cors_layer(&config));

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(AnyOrigin),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

/// Turn a handler panic into a JSON 500 so one bad request cannot take the
/// process down.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(%detail, "Uncaught panic while serving request");

    let status = StatusCode::INTERNAL_SERVER_ERROR;
    (
        status,
        Json(ErrorResponse::with_status(
            "internal_error",
            format!("Internal error: {detail}"),
            status,
        )),
    )
        .into_response()
}
