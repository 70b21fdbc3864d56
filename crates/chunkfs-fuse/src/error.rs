//! Error types surfaced by file node operations.

use thiserror::Error;

/// Errors returned by [`crate::file::FileNode`] operations.
///
/// Metadata and chunk store failures are translated into these variants at
/// the file node boundary and never retried there.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FuseError {
    /// Name or inode is absent on the metadata service.
    #[error("No such entry: {name}")]
    NotFound {
        /// Name that failed to resolve.
        name: String,
    },

    /// A create raced with another creator and lost.
    #[error("Name already exists: {name}")]
    AlreadyExists {
        /// Name that was created concurrently.
        name: String,
    },

    /// Another handle already holds the file open for writing.
    #[error("Permission denied for {name}, operation: {op}")]
    PermissionDenied {
        /// File the handle was denied on.
        name: String,
        /// Operation that was refused.
        op: String,
    },

    /// The requested semantics are not implemented.
    #[error("Operation not supported: {op}")]
    Unsupported {
        /// Operation or flag that was requested.
        op: String,
    },

    /// The backing store ran out of space.
    #[error("No space left on backing store for {name}")]
    ResourceExhausted {
        /// File whose write was refused.
        name: String,
    },

    /// Opaque lower-layer failure.
    #[error("I/O error on {name}: {reason}")]
    Io {
        /// File the failure was reported for.
        name: String,
        /// Lower-layer description.
        reason: String,
    },
}

/// Result alias for file node operations.
pub type Result<T> = std::result::Result<T, FuseError>;

impl FuseError {
    pub(crate) fn io(name: &str, reason: impl Into<String>) -> Self {
        FuseError::Io {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps the error onto the errno replied to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FuseError::NotFound { .. } => ENOENT,
            FuseError::AlreadyExists { .. } => EEXIST,
            FuseError::PermissionDenied { .. } => EPERM,
            FuseError::Unsupported { .. } => EPERM,
            FuseError::ResourceExhausted { .. } => ENOSPC,
            FuseError::Io { .. } => EIO,
        }
    }
}
