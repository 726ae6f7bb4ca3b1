//! Tile read path.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TileService                             │
//! │                           get_tile()                             │
//! │  1. Resolve store       3. Read index record   5. Resolve blob   │
//! │  2. Pick transaction    4. Response headers    6. Byte range     │
//! └──────────┬──────────────────────┬───────────────────────┬────────┘
//!            ▼                      ▼                       ▼
//!     ┌─────────────┐        ┌─────────────┐         ┌─────────────┐
//!     │ IndexCache  │        │  TileStore  │         │  BlobCache  │
//!     └─────────────┘        │  (via RPC)  │         └─────────────┘
//!                            └─────────────┘
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::blob::{Blob, BlobOpener, SendfileParams};
use crate::cache::{BlobCache, IndexCache};
use crate::error::{BlobError, IndexError, PlateError};
use crate::index::{IndexRecord, IndexService, TileStore};

use super::request::{cache_control, content_type_for, TilePath, TileQuery, TransactionSelector};

// =============================================================================
// Tile Request
// =============================================================================

/// A parsed tile request.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub path: TilePath,
    pub query: TileQuery,

    /// Only response headers are wanted; skip blob resolution
    pub header_only: bool,
}

impl TileRequest {
    pub fn new(path: TilePath, query: TileQuery) -> Self {
        Self {
            path,
            query,
            header_only: false,
        }
    }

    pub fn header_only(mut self, header_only: bool) -> Self {
        self.header_only = header_only;
        self
    }
}

// =============================================================================
// Tile Response
// =============================================================================

/// What the transport layer needs to answer a tile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileResponse {
    pub content_type: &'static str,
    pub cache_control: String,

    /// Transaction the record was read at
    pub transaction: u64,

    pub record: IndexRecord,

    /// Byte range to transmit; `None` for header-only requests
    pub body: Option<SendfileParams>,
}

// =============================================================================
// Tile Service
// =============================================================================

/// Serves tile requests from an [`IndexCache`] and a [`BlobCache`].
///
/// Stateless per request; all shared state lives in the two caches.
pub struct TileService<I: IndexService, O: BlobOpener> {
    index_cache: Arc<IndexCache<I>>,
    blob_cache: Arc<BlobCache<O>>,
}

impl<I: IndexService, O: BlobOpener> TileService<I, O> {
    /// Create a service with fresh, empty caches.
    pub fn new(index: I, opener: O) -> Self {
        Self::with_caches(
            Arc::new(IndexCache::new(index)),
            Arc::new(BlobCache::new(opener)),
        )
    }

    /// Create a service over shared caches.
    pub fn with_caches(index_cache: Arc<IndexCache<I>>, blob_cache: Arc<BlobCache<O>>) -> Self {
        Self {
            index_cache,
            blob_cache,
        }
    }

    pub fn index_cache(&self) -> &Arc<IndexCache<I>> {
        &self.index_cache
    }

    pub fn blob_cache(&self) -> &Arc<BlobCache<O>> {
        &self.blob_cache
    }

    /// Resolve one tile request to its headers and byte range.
    ///
    /// # Errors
    ///
    /// - `StoreNotFound` if the store id is unknown even after a resync
    /// - `TileNotFound` if the index has no record at the selected transaction
    /// - `ServerError` if the index service or the blob file fails
    pub async fn get_tile(&self, request: &TileRequest) -> Result<TileResponse, PlateError> {
        let TilePath {
            store_id,
            level,
            col,
            row,
            ref format,
        } = request.path;

        let entry = self.index_cache.resolve(store_id).await?;

        // The current cursor is read per request; the one cached at resync
        // time is only used for the store description.
        let (transaction, exact) = match request.query.transaction {
            TransactionSelector::Current => {
                let cursor = entry.store.transaction_cursor().await.map_err(|e| {
                    PlateError::ServerError(format!("Could not read transaction cursor: {e}"))
                })?;
                (cursor, false)
            }
            TransactionSelector::At { id, exact } => (id, exact),
        };

        let record = entry
            .store
            .read_request(col, row, level, transaction, exact)
            .await
            .map_err(|e| match e {
                IndexError::TileNotFound {
                    col,
                    row,
                    level,
                    transaction,
                } => PlateError::TileNotFound {
                    col,
                    row,
                    level,
                    transaction,
                },
                other => PlateError::ServerError(format!("Could not read plate index: {other}")),
            })?;

        debug!(
            store_id,
            level,
            col,
            row,
            transaction,
            exact,
            blob_id = record.blob_id,
            blob_offset = record.blob_offset,
            "Resolved tile record"
        );

        let mut response = TileResponse {
            content_type: content_type_for(format),
            cache_control: cache_control(level, request.query.nocache),
            transaction,
            record,
            body: None,
        };

        if request.header_only {
            return Ok(response);
        }

        let blob_error =
            |e: BlobError| PlateError::ServerError(format!("Could not load blob data: {e}"));
        let blob = self
            .blob_cache
            .get_blob(store_id, &entry.storage_path, record.blob_id)
            .await
            .map_err(blob_error)?;
        response.body = Some(
            blob.read_sendfile(record.blob_offset)
                .await
                .map_err(blob_error)?,
        );

        Ok(response)
    }
}
