//! HTTP server layer for the plate server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │    GET <base>/p/{store_id}/{level}/{col}/{row}.{format}         │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │    wtml     │  │        routes           │  │
//! │  │ (requests)  │  │  (listing)  │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handlers;
pub mod routes;
pub mod wtml;

pub use handlers::{
    health_handler, plate_handler, status_handler, AppState, ErrorResponse, HealthResponse,
    STATUS_TEXT, TRANSACTION_HEADER,
};
pub use routes::{create_router, RouterConfig, DEFAULT_BASE_PATH};
pub use wtml::{parse_wtml_path, render_wtml, request_prefix, xml_escape, ImageSet};
