//! Cache integration tests.
//!
//! Tests verify:
//! - A resync skips stores that fail to open and keeps the rest
//! - A resync drops stores the index no longer lists
//! - Concurrent misses share one resync
//! - Blob handles are replaced when a path changes owner

use std::sync::Arc;

use plate_server::blob::{Blob, FileBlobOpener, RECORD_HEADER_LEN};
use plate_server::cache::{blob_path, BlobCache, IndexCache};
use plate_server::PlateError;

use super::test_utils::{append_blob, tile_bytes, MemoryIndex, StoreFixture};

fn store(id: u32, name: &str) -> StoreFixture {
    StoreFixture::new(id, name, std::path::Path::new("/plates"), "png")
}

// =============================================================================
// Index Cache
// =============================================================================

#[tokio::test]
async fn test_resync_skips_broken_store() {
    let index = MemoryIndex::new()
        .with_store(store(1, "a"))
        .with_store(store(2, "b"))
        .with_store(store(3, "c"));
    index.break_store("b");

    let cache = IndexCache::new(index.clone());
    assert_eq!(cache.resync().await.unwrap(), 2);

    let ids: Vec<u32> = cache.entries().await.iter().map(|e| e.store_id).collect();
    assert_eq!(ids, vec![1, 3]);

    // A request for the broken store resyncs once more, then gives up.
    assert!(matches!(
        cache.resolve(2).await,
        Err(PlateError::StoreNotFound(2))
    ));
}

#[tokio::test]
async fn test_resync_drops_removed_store() {
    let index = MemoryIndex::new()
        .with_store(store(1, "a"))
        .with_store(store(2, "b"));
    let cache = IndexCache::new(index.clone());
    cache.resync().await.unwrap();
    assert!(cache.lookup(2).await.is_some());

    index.remove_store("b");
    cache.resync().await.unwrap();
    assert!(cache.lookup(2).await.is_none());
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_new_store_found_on_miss() {
    let index = MemoryIndex::new().with_store(store(1, "a"));
    let cache = IndexCache::new(index.clone());
    cache.resync().await.unwrap();

    index.add_store(store(5, "e"));
    let entry = cache.resolve(5).await.unwrap();
    assert_eq!(entry.short_name, "e");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_resync() {
    let index = MemoryIndex::new().with_store(store(1, "a"));
    let cache = Arc::new(IndexCache::new(index.clone()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.resolve(1).await.map(|e| e.store_id) })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }
    assert_eq!(index.list_calls(), 1);
}

// =============================================================================
// Blob Cache
// =============================================================================

#[tokio::test]
async fn test_blob_cache_reads_real_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload = tile_bytes("tile-a");
    let offsets = append_blob(dir.path(), 0, &[b"first", &payload]);

    let cache = BlobCache::new(FileBlobOpener);
    let storage = dir.path().to_string_lossy().into_owned();
    let blob = cache.get_blob(7, &storage, 0).await.unwrap();

    let params = blob.read_sendfile(offsets[1]).await.unwrap();
    assert_eq!(params.path, blob_path(&storage, 0));
    assert_eq!(params.offset, offsets[1] + RECORD_HEADER_LEN);
    assert_eq!(params.size, payload.len() as u64);
}

#[tokio::test]
async fn test_blob_recreated_under_new_store() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().to_string_lossy().into_owned();
    append_blob(dir.path(), 0, &[b"old store data"]);

    let cache = BlobCache::new(FileBlobOpener);
    let old = cache.get_blob(1, &storage, 0).await.unwrap();

    // The file is deleted and rewritten by another store.
    std::fs::remove_file(blob_path(&storage, 0)).unwrap();
    let offsets = append_blob(dir.path(), 0, &[b"new", b"new store data!"]);

    let new = cache.get_blob(2, &storage, 0).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(cache.owner_of(&blob_path(&storage, 0)).await, Some(2));

    let params = new.read_sendfile(offsets[1]).await.unwrap();
    assert_eq!(params.size, b"new store data!".len() as u64);

    // The same store keeps getting the same handle.
    let again = cache.get_blob(2, &storage, 0).await.unwrap();
    assert!(Arc::ptr_eq(&new, &again));
}

#[tokio::test]
async fn test_missing_blob_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().to_string_lossy().into_owned();

    let cache = BlobCache::new(FileBlobOpener);
    assert!(cache.get_blob(1, &storage, 9).await.is_err());
    assert!(cache.is_empty().await);
}
