//! Process-resident caches in front of the index service and blob files.
//!
//! - [`IndexCache`]: store id to opened store plus metadata, rebuilt wholesale
//!   by `resync`.
//! - [`BlobCache`]: blob file path to open blob handle, tagged with the store
//!   that owns it.

mod blob;
mod index;

pub use blob::{blob_path, BlobCache};
pub use index::{IndexCache, IndexCacheEntry};
