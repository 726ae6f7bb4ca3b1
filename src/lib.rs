//! # Plate Server
//!
//! A tile server for versioned plate stores.
//!
//! Tiles live in append-only blob files. A remote index service maps
//! `(store, level, col, row, transaction)` to a blob and an offset; this
//! crate asks it over a message channel, caches what it learns, and streams
//! the tile bytes straight from disk.
//!
//! ## Features
//!
//! - **Pluggable channels**: `inproc://`, `ipc://`, `tcp://` and `broker://`
//!   transports behind one [`Channel`] trait, with reply routing
//! - **RPC with bounded retry**: per-attempt timeouts, stale-reply discarding
//! - **Index cache**: resync on miss, singleflight, tolerant of bad stores
//! - **Blob cache**: handles tagged with their owning store, replaced when a
//!   file is recreated under another store
//! - **WTML listings** of every cached store
//!
//! ## Architecture
//!
//! - [`channel`] - Message transports and the broker
//! - [`rpc`] - Request/response calls over channels
//! - [`index`] - Index service contract and its RPC client/server
//! - [`cache`] - Index and blob caches
//! - [`blob`] - Blob files and record layout
//! - [`tile`] - Tile request parsing and the read path
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use plate_server::{create_router, FileBlobOpener, RemoteIndex, RouterConfig, TileService};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let index = RemoteIndex::connect(
//!         "tcp://127.0.0.1:6000",
//!         "plate_server",
//!         Duration::from_secs(1),
//!         5,
//!     )
//!     .await?;
//!     let router = create_router(TileService::new(index, FileBlobOpener), RouterConfig::new());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod index;
pub mod rpc;
pub mod server;
pub mod tile;

// Re-export commonly used types
pub use blob::{Blob, BlobOpener, FileBlob, FileBlobOpener, SendfileParams};
pub use cache::{BlobCache, IndexCache, IndexCacheEntry};
pub use channel::{Broker, Channel, ChannelAddress};
pub use config::{BrokerConfig, Cli, Command, ServeConfig};
pub use error::{BlobError, ChannelError, IndexError, PlateError, RemoteError, RpcError};
pub use index::{IndexHeader, IndexRecord, IndexRpcService, IndexService, RemoteIndex, TileStore};
pub use rpc::{RpcClient, RpcServer, RpcService};
pub use server::{create_router, health_handler, AppState, RouterConfig};
pub use tile::{TilePath, TileQuery, TileRequest, TileResponse, TileService, TransactionSelector};
