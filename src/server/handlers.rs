//! HTTP request handlers for the plate server.
//!
//! # Endpoints
//!
//! - `GET|HEAD <base>/p/<store_id>/<level>/<col>/<row>.<format>` - Serve a tile
//! - `GET|HEAD <base>/p/<name>.wtml` - List the cached stores as WTML
//! - `GET <base>/status` - Diagnostic status
//! - `GET /health` - Health check endpoint

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::blob::{BlobOpener, SendfileParams};
use crate::error::PlateError;
use crate::index::IndexService;
use crate::tile::{TilePath, TileQuery, TileRequest, TileResponse, TileService};

use super::wtml::{parse_wtml_path, render_wtml, request_prefix, WTML_CONTENT_TYPE};

/// Header carrying the transaction a tile was read at.
pub const TRANSACTION_HEADER: &str = "x-tile-transaction";

/// Text returned by the status endpoint.
pub const STATUS_TEXT: &str = "Moo!";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the tile service.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<I: IndexService, O: BlobOpener> {
    pub tile_service: Arc<TileService<I, O>>,

    /// Mount point, used to build absolute URLs in listings
    pub base_path: String,

    /// `DemUrl` advertised in WTML listings
    pub dem_url: String,
}

impl<I: IndexService, O: BlobOpener> AppState<I, O> {
    pub fn new(tile_service: TileService<I, O>, base_path: impl Into<String>) -> Self {
        Self {
            tile_service: Arc::new(tile_service),
            base_path: base_path.into(),
            dem_url: super::wtml::DEFAULT_DEM_URL.to_string(),
        }
    }

    pub fn with_dem_url(mut self, dem_url: impl Into<String>) -> Self {
        self.dem_url = dem_url.into();
        self
    }
}

impl<I: IndexService, O: BlobOpener> Clone for AppState<I, O> {
    fn clone(&self) -> Self {
        Self {
            tile_service: Arc::clone(&self.tile_service),
            base_path: self.base_path.clone(),
            dem_url: self.dem_url.clone(),
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (for client reference)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// =============================================================================
// Error Handling
// =============================================================================

impl IntoResponse for PlateError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            PlateError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
            PlateError::StoreNotFound(_) => {
                (StatusCode::NOT_FOUND, "store_not_found", self.to_string())
            }
            PlateError::TileNotFound { .. } => {
                (StatusCode::NOT_FOUND, "tile_not_found", self.to_string())
            }
            PlateError::ServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                self.to_string(),
            ),
            PlateError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
        };

        match &self {
            PlateError::Internal(_) => error!(%message, "Uncaught error while serving request"),
            _ if status.is_server_error() => error!(%message, "Server error"),
            _ if status == StatusCode::NOT_FOUND => debug!(%message, "Not found"),
            _ => warn!(%message, "Client error"),
        }

        (
            status,
            Json(ErrorResponse::with_status(error_type, message, status)),
        )
            .into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle every request under `<base>/p/`.
///
/// The path is offered to the tile handler first, then to the WTML listing.
/// A path neither recognises is a plain 404.
pub async fn plate_handler<I, O>(
    State(state): State<AppState<I, O>>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, PlateError>
where
    I: IndexService + 'static,
    O: BlobOpener + 'static,
{
    let path = format!("/{path}");
    let header_only = method == Method::HEAD;

    if let Some(tile) = TilePath::parse(&path)? {
        let params = parse_query(query.as_deref());
        let request =
            TileRequest::new(tile, TileQuery::from_params(&params)?).header_only(header_only);
        let response = state.tile_service.get_tile(&request).await?;
        return tile_response(response).await;
    }

    if let Some(filename) = parse_wtml_path(&path) {
        if header_only {
            return Ok(([(header::CONTENT_TYPE, WTML_CONTENT_TYPE)]).into_response());
        }

        let cache = state.tile_service.index_cache();
        cache.resync().await.map_err(|e| {
            PlateError::ServerError(format!("Could not resync index cache: {e}"))
        })?;
        let entries = cache.entries().await;

        let prefix = request_prefix(&headers, &state.base_path);
        let body = render_wtml(&entries, &prefix, query.as_deref(), &state.dem_url);
        debug!(filename, stores = entries.len(), "Served WTML");

        return Ok(([(header::CONTENT_TYPE, WTML_CONTENT_TYPE)], body).into_response());
    }

    debug!(path = %path, "No handler for path");
    Ok(StatusCode::NOT_FOUND.into_response())
}

/// Status endpoint. `?short` answers with an empty body.
pub async fn status_handler<I, O>(
    State(state): State<AppState<I, O>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response
where
    I: IndexService + 'static,
    O: BlobOpener + 'static,
{
    if params.contains_key("short") {
        return StatusCode::OK.into_response();
    }

    let stores = state.tile_service.index_cache().len().await;
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{STATUS_TEXT}\nCached stores: {stores}\n"),
    )
        .into_response()
}

/// Health check endpoint.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Helpers
// =============================================================================

/// Decode a raw query string. Both `&` and `;` separate pairs; a key without
/// `=` maps to an empty value.
fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw else {
        return HashMap::new();
    };
    let normalized = raw.replace(';', "&");
    url::form_urlencoded::parse(normalized.as_bytes())
        .into_owned()
        .collect()
}

async fn tile_response(tile: TileResponse) -> Result<Response, PlateError> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, tile.content_type)
        .header(header::CACHE_CONTROL, &tile.cache_control)
        .header(TRANSACTION_HEADER, tile.transaction);

    let response = match tile.body {
        None => builder.body(Body::empty()),
        Some(params) => {
            let size = params.size;
            let body = stream_range(params).await?;
            builder.header(header::CONTENT_LENGTH, size).body(body)
        }
    };

    response.map_err(|e| PlateError::Internal(format!("Failed to build response: {e}")))
}

/// Stream `size` bytes of a file starting at `offset`.
async fn stream_range(params: SendfileParams) -> Result<Body, PlateError> {
    let read_error = |e: std::io::Error| {
        PlateError::ServerError(format!(
            "Could not read blob data from {}: {e}",
            params.path.display()
        ))
    };

    let mut file = tokio::fs::File::open(&params.path)
        .await
        .map_err(read_error)?;
    file.seek(SeekFrom::Start(params.offset))
        .await
        .map_err(read_error)?;

    Ok(Body::from_stream(ReaderStream::new(file.take(params.size))))
}
