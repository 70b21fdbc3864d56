//! Metadata service capability.
//!
//! The client only needs name resolution, open/create and symlink reads from
//! the metadata tier; everything else about its wire protocol stays behind
//! this trait.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::chunk::ChunkSession;
use crate::flags::OpenFlags;

/// Inode number assigned by the metadata service.
pub type InodeId = u64;

/// Inode of the mount root.
pub const ROOT_INODE: InodeId = 1;

/// Kind of object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Attributes persisted by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode number.
    pub ino: InodeId,
    /// Object kind.
    pub kind: InodeKind,
    /// Flushed file size in bytes.
    pub size: u64,
    /// Link count.
    pub nlink: u32,
    /// Last access time, seconds since the epoch.
    pub atime_secs: i64,
    /// Last modification time, seconds since the epoch.
    pub mtime_secs: i64,
}

/// Non-OK status returned by the metadata service.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MetaStatus {
    /// The name or inode does not exist.
    #[error("not found")]
    NotFound,
    /// The name already exists.
    #[error("already exists")]
    AlreadyExists,
    /// Any other failure, with the service's status code.
    #[error("metadata service error (code {0})")]
    Other(i32),
}

/// Result alias for metadata calls.
pub type MetaResult<T> = std::result::Result<T, MetaStatus>;

/// Client of the metadata tier.
pub trait MetaClient: Send + Sync {
    /// Resolves `name` under `parent` to its attributes.
    fn resolve(&self, parent: InodeId, name: &str) -> MetaResult<InodeInfo>;

    /// Resolves a symlink `name` under `parent` to its inode.
    fn resolve_symlink(&self, parent: InodeId, name: &str) -> MetaResult<InodeId>;

    /// Opens an existing file and returns a fresh chunk session for it.
    fn open(&self, parent: InodeId, name: &str, flags: OpenFlags) -> MetaResult<Arc<dyn ChunkSession>>;

    /// Creates the file and returns a chunk session for the new inode.
    fn create(&self, parent: InodeId, name: &str, flags: OpenFlags) -> MetaResult<Arc<dyn ChunkSession>>;

    /// Reads the target of the symlink `ino`.
    fn read_symlink_target(&self, ino: InodeId) -> MetaResult<String>;
}
