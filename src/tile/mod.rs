//! Tile read path.
//!
//! The tile layer sits between the HTTP handlers and the caches:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              HTTP Handlers              │
//! └────────────────────┬────────────────────┘
//!                      │ TilePath + TileQuery
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TileService                │
//! └──────────┬─────────────────┬────────────┘
//!            ▼                 ▼
//! ┌────────────────────┐ ┌──────────────────┐
//! │    IndexCache      │ │    BlobCache     │
//! └────────────────────┘ └──────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TilePath`]: `/<store_id>/<level>/<col>/<row>.<format>` parsing
//! - [`TileQuery`]: `transaction_id`, `exact` and `nocache` parameters
//! - [`TileService`]: resolves a request to headers and a blob byte range
//! - [`cache_control`]: response lifetime by zoom level

mod request;
mod service;

pub use request::{
    cache_control, content_type_for, TilePath, TileQuery, TransactionSelector,
    LONG_CACHE_MAX_AGE, LONG_CACHE_MAX_LEVEL, SHORT_CACHE_MAX_AGE,
};
pub use service::{TileRequest, TileResponse, TileService};
