//! Index service contract.
//!
//! The index service knows every tile store and, per store, which blob and
//! offset holds a given tile at a given transaction. This module defines:
//!
//! - [`IndexService`] and [`TileStore`], the traits the cache layer consumes;
//! - the request/reply messages of the `index` RPC service ([`messages`]);
//! - [`RemoteIndex`], the RPC-backed client implementation;
//! - [`IndexRpcService`], which exposes any `IndexService` over RPC.

pub mod messages;
mod remote;
mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

pub use remote::{RemoteIndex, RemoteTileStore};
pub use server::IndexRpcService;

/// What opening a store yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    /// Numeric store id used in tile paths
    pub store_id: u32,
    /// Short name the index service lists the store under
    pub name: String,
    /// Directory holding the store's blob files
    pub storage_path: String,
    /// Tile file type without the dot (e.g. `png`)
    pub tile_filetype: String,
    pub description: Option<String>,
    pub num_levels: u32,
}

/// Where one tile lives: a blob and a byte offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub blob_id: u32,
    pub blob_offset: u64,
}

/// One opened tile store.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Metadata captured when the store was opened.
    fn header(&self) -> &IndexHeader;

    /// The store's latest committed transaction.
    async fn transaction_cursor(&self) -> Result<u64, IndexError>;

    /// Look up the record for one tile.
    ///
    /// With `exact` set, only a record written at exactly `transaction`
    /// matches; otherwise the latest record at or before it does. A miss is
    /// [`IndexError::TileNotFound`].
    async fn read_request(
        &self,
        col: u32,
        row: u32,
        level: u32,
        transaction: u64,
        exact: bool,
    ) -> Result<IndexRecord, IndexError>;
}

/// Source of tile stores.
///
/// Abstracts the index backend so the cache layer works the same against the
/// remote service and in-process test doubles.
#[async_trait]
pub trait IndexService: Send + Sync {
    /// The store handle this service opens.
    type Store: TileStore + 'static;

    /// Names of every known store.
    async fn list_stores(&self) -> Result<Vec<String>, IndexError>;

    /// Open the store listed under `name`.
    async fn open_store(&self, name: &str) -> Result<Self::Store, IndexError>;
}
