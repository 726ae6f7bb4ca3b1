//! Cache of opened tile stores keyed by store id.
//!
//! The cache is rebuilt wholesale: `resync` lists every store, opens each one
//! into a fresh map and swaps the map in under the write lock. Readers clone
//! the current map's `Arc` and never see a half-built cache.
//!
//! # Resync on miss
//!
//! [`IndexCache::resolve`] is the read path: lookup, on a miss one resync,
//! lookup again, else [`PlateError::StoreNotFound`]. Concurrent misses share
//! one resync: every completed resync bumps a generation counter, and a caller
//! that finds the generation moved while it waited for the resync lock reuses
//! that result instead of listing again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{IndexError, PlateError};
use crate::index::{IndexService, TileStore};

/// One cached store.
#[derive(Debug)]
pub struct IndexCacheEntry<S> {
    pub store_id: u32,
    pub short_name: String,
    pub storage_path: String,
    pub description: String,
    /// Transaction cursor observed when the entry was built
    pub read_cursor: u64,
    pub tile_filetype: String,
    pub num_levels: u32,
    pub store: Arc<S>,
}

type EntryMap<S> = HashMap<u32, Arc<IndexCacheEntry<S>>>;

/// Store id to opened store, refreshed from an [`IndexService`].
pub struct IndexCache<I: IndexService> {
    index: I,
    entries: RwLock<Arc<EntryMap<I::Store>>>,
    resync_lock: Mutex<()>,
    generation: AtomicU64,
}

impl<I: IndexService> IndexCache<I> {
    /// Create an empty cache. Nothing is listed until the first resync.
    pub fn new(index: I) -> Self {
        Self {
            index,
            entries: RwLock::new(Arc::new(HashMap::new())),
            resync_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Cached entry for `store_id`, without touching the index service.
    pub async fn lookup(&self, store_id: u32) -> Option<Arc<IndexCacheEntry<I::Store>>> {
        self.entries.read().await.get(&store_id).cloned()
    }

    /// Cached entry for `store_id`, resyncing once on a miss.
    pub async fn resolve(&self, store_id: u32) -> Result<Arc<IndexCacheEntry<I::Store>>, PlateError> {
        let observed = self.generation.load(Ordering::Acquire);
        if let Some(entry) = self.lookup(store_id).await {
            return Ok(entry);
        }

        {
            let _guard = self.resync_lock.lock().await;
            if self.generation.load(Ordering::Acquire) == observed {
                debug!(store_id, "Index cache miss, resyncing");
                self.resync_locked().await.map_err(|e| {
                    PlateError::ServerError(format!("Could not resync index cache: {e}"))
                })?;
            } else {
                debug!(store_id, "Index cache miss, reusing concurrent resync");
            }
        }

        self.lookup(store_id)
            .await
            .ok_or(PlateError::StoreNotFound(store_id))
    }

    /// Rebuild the cache from the index service.
    ///
    /// A store that fails to open is logged and left out. If listing itself
    /// fails, the previous cache stays in place and the error is returned.
    /// Returns the number of cached stores.
    pub async fn resync(&self) -> Result<usize, IndexError> {
        let _guard = self.resync_lock.lock().await;
        self.resync_locked().await
    }

    /// Every cached entry, ordered by store id.
    pub async fn entries(&self) -> Vec<Arc<IndexCacheEntry<I::Store>>> {
        let map = Arc::clone(&*self.entries.read().await);
        let mut entries: Vec<_> = map.values().cloned().collect();
        entries.sort_by_key(|entry| entry.store_id);
        entries
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of completed resyncs.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn resync_locked(&self) -> Result<usize, IndexError> {
        let names = self.index.list_stores().await?;

        let mut fresh: EntryMap<I::Store> = HashMap::with_capacity(names.len());
        for name in &names {
            match self.open_entry(name).await {
                Ok(entry) => {
                    if let Some(previous) = fresh.insert(entry.store_id, Arc::new(entry)) {
                        warn!(
                            store_id = previous.store_id,
                            replaced = %previous.short_name,
                            "Duplicate store id in index listing"
                        );
                    }
                }
                Err(e) => {
                    error!(store = %name, error = %e, "Could not open store during resync, skipping");
                }
            }
        }

        let count = fresh.len();
        *self.entries.write().await = Arc::new(fresh);
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(stores = count, listed = names.len(), "Index cache resynced");
        Ok(count)
    }

    async fn open_entry(&self, name: &str) -> Result<IndexCacheEntry<I::Store>, IndexError> {
        let store = self.index.open_store(name).await?;
        let read_cursor = store.transaction_cursor().await?;
        let header = store.header().clone();

        let description = header
            .description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("{}.{}", header.name, read_cursor));

        Ok(IndexCacheEntry {
            store_id: header.store_id,
            short_name: header.name,
            storage_path: header.storage_path,
            description,
            read_cursor,
            tile_filetype: header.tile_filetype,
            num_levels: header.num_levels,
            store: Arc::new(store),
        })
    }
}
