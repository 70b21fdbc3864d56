//! Chunk store session capability.

use thiserror::Error;

use crate::flags::OpenFlags;
use crate::meta::InodeId;

/// Failure reported by a chunk session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// The backing store is out of space.
    #[error("no space left on chunk store")]
    NoSpace,
    /// Any other lower-layer failure.
    #[error("chunk store failure: {0}")]
    Io(String),
}

/// Result alias for chunk session calls.
pub type ChunkResult<T> = std::result::Result<T, ChunkError>;

/// Cached byte-range store for one open file.
///
/// Implementations must be safe to call from several threads for a single
/// session. Retry policy, if any, lives behind this trait.
pub trait ChunkSession: Send + Sync {
    /// Inode the session was opened for.
    fn inode(&self) -> InodeId;

    /// File size including writes not yet flushed.
    fn cached_size(&self) -> u64;

    /// Reads up to `len` bytes at `offset`. A shorter result is a valid
    /// partial read.
    fn read(&self, offset: u64, len: usize) -> ChunkResult<Vec<u8>>;

    /// Writes `data` at `offset` and returns the number of bytes accepted.
    fn write(&self, offset: u64, data: &[u8]) -> ChunkResult<usize>;

    /// Pushes cached writes to remote storage.
    fn flush(&self) -> ChunkResult<()>;

    /// Closes the write side for one write-mode opener.
    fn close_write(&self) -> ChunkResult<()>;

    /// Tears the session down. Called once, when the last handle goes away.
    fn close(&self);

    /// Records an additional opener on an already open session.
    fn note_open(&self, flags: OpenFlags);
}
