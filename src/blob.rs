//! Blob files.
//!
//! A blob is an append-only container holding many tile payloads. Each
//! payload is stored as a record:
//!
//! ```text
//! ┌───────────┬──────────────┬─────────────────────┐
//! │ magic (4) │ size u64 LE  │ payload (size bytes)│
//! └───────────┴──────────────┴─────────────────────┘
//!   ^ blob_offset from the index points here
//! ```
//!
//! The server never reads payloads into memory. [`Blob::read_sendfile`]
//! validates the record header and returns the byte range to transmit.

use std::fs::File;
use std::io::{Seek, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BlobError;

/// Marks the start of every record.
pub const RECORD_MAGIC: [u8; 4] = *b"PLBR";

/// Size of the record header preceding each payload.
pub const RECORD_HEADER_LEN: u64 = 12;

/// Where a tile's bytes live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendfileParams {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// An open blob file.
#[async_trait]
pub trait Blob: Send + Sync {
    /// Path of the underlying file.
    fn path(&self) -> &Path;

    /// Locate the payload of the record starting at `blob_offset`.
    async fn read_sendfile(&self, blob_offset: u64) -> Result<SendfileParams, BlobError>;
}

/// Opens blobs by path.
#[async_trait]
pub trait BlobOpener: Send + Sync {
    type Blob: Blob + 'static;

    async fn open(&self, path: &Path) -> Result<Self::Blob, BlobError>;
}

// =============================================================================
// File-backed implementation
// =============================================================================

/// A blob backed by a file descriptor held open for the life of the handle.
pub struct FileBlob {
    path: PathBuf,
    file: Arc<File>,
}

impl FileBlob {
    pub fn open(path: &Path) -> Result<Self, BlobError> {
        let file =
            File::open(path).map_err(|e| BlobError::Io(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    fn invalid(&self, offset: u64, reason: impl Into<String>) -> BlobError {
        BlobError::InvalidRecord {
            path: self.path.display().to_string(),
            offset,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Blob for FileBlob {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read_sendfile(&self, blob_offset: u64) -> Result<SendfileParams, BlobError> {
        let file = Arc::clone(&self.file);
        let (header, file_len) = tokio::task::spawn_blocking(move || {
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            let file_len = file.metadata()?.len();
            if blob_offset.saturating_add(RECORD_HEADER_LEN) > file_len {
                return Ok::<_, std::io::Error>((None, file_len));
            }
            file.read_exact_at(&mut header, blob_offset)?;
            Ok((Some(header), file_len))
        })
        .await
        .map_err(|e| BlobError::Io(format!("blob read task failed: {e}")))??;

        let header = header.ok_or_else(|| {
            self.invalid(blob_offset, format!("header runs past end of file ({file_len} bytes)"))
        })?;

        if header[..4] != RECORD_MAGIC {
            return Err(self.invalid(blob_offset, "bad record magic"));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&header[4..]);
        let size = u64::from_le_bytes(size_bytes);

        let offset = blob_offset + RECORD_HEADER_LEN;
        if offset.checked_add(size).map_or(true, |end| end > file_len) {
            return Err(self.invalid(
                blob_offset,
                format!("record of {size} bytes runs past end of file ({file_len} bytes)"),
            ));
        }

        Ok(SendfileParams {
            path: self.path.clone(),
            offset,
            size,
        })
    }
}

/// Opens [`FileBlob`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBlobOpener;

#[async_trait]
impl BlobOpener for FileBlobOpener {
    type Blob = FileBlob;

    async fn open(&self, path: &Path) -> Result<FileBlob, BlobError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || FileBlob::open(&path))
            .await
            .map_err(|e| BlobError::Io(format!("blob open task failed: {e}")))?
    }
}

/// Append one record at the writer's current position and return that offset.
pub fn write_record<W: Write + Seek>(writer: &mut W, payload: &[u8]) -> std::io::Result<u64> {
    let position = writer.stream_position()?;
    writer.write_all(&RECORD_MAGIC)?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(position)
}
