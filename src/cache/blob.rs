//! Cache of open blob handles keyed by file path.
//!
//! Each entry remembers the store that opened it. A request from a different
//! store id for the same path means the file was deleted and recreated under
//! a new store, so the old handle is replaced rather than reused.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::blob::BlobOpener;
use crate::error::BlobError;

/// Path of blob `blob_id` inside a store's storage directory.
pub fn blob_path(storage_path: &str, blob_id: u32) -> PathBuf {
    Path::new(storage_path).join(format!("plate_{blob_id}.blob"))
}

struct BlobCacheEntry<B> {
    owner: u32,
    blob: Arc<B>,
}

/// Blob path to open handle, tagged with the owning store id.
///
/// Entries are never evicted; they are only replaced on owner mismatch.
pub struct BlobCache<O: BlobOpener> {
    opener: O,
    entries: RwLock<HashMap<PathBuf, BlobCacheEntry<O::Blob>>>,
}

impl<O: BlobOpener> BlobCache<O> {
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Handle for blob `blob_id` of the store `store_id` stored at `storage_path`.
    pub async fn get_blob(
        &self,
        store_id: u32,
        storage_path: &str,
        blob_id: u32,
    ) -> Result<Arc<O::Blob>, BlobError> {
        let path = blob_path(storage_path, blob_id);

        if let Some(entry) = self.entries.read().await.get(&path) {
            if entry.owner == store_id {
                return Ok(Arc::clone(&entry.blob));
            }
        }

        let opened = Arc::new(self.opener.open(&path).await?);

        let mut entries = self.entries.write().await;
        match entries.get(&path) {
            // Another task opened it while we were opening ours.
            Some(entry) if entry.owner == store_id => return Ok(Arc::clone(&entry.blob)),
            Some(entry) => {
                debug!(
                    path = %path.display(),
                    old_owner = entry.owner,
                    new_owner = store_id,
                    "Replacing stale blob handle"
                );
            }
            None => debug!(path = %path.display(), store_id, "Opened blob"),
        }
        entries.insert(
            path,
            BlobCacheEntry {
                owner: store_id,
                blob: Arc::clone(&opened),
            },
        );
        Ok(opened)
    }

    /// Store id that owns the cached handle for `path`, if any.
    pub async fn owner_of(&self, path: &Path) -> Option<u32> {
        self.entries.read().await.get(path).map(|entry| entry.owner)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
