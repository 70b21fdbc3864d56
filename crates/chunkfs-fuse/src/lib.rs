#![warn(missing_docs)]

//! ChunkFS FUSE client.
//!
//! Presents POSIX file semantics over chunk storage. Every open name is
//! backed by a [`file::FileNode`] that coordinates concurrent FUSE handles,
//! enforces the single-writer rule and owns the chunk session while at
//! least one handle is open.

pub mod attr;
pub mod chunk;
pub mod config;
pub mod dir_table;
pub mod error;
pub mod file;
pub mod filesystem;
pub mod flags;
pub mod memory;
pub mod meta;
pub mod mount;

pub use chunk::{ChunkError, ChunkResult, ChunkSession};
pub use dir_table::DirectoryTable;
pub use error::{FuseError, Result};
pub use file::{FileKind, FileNode};
pub use flags::OpenFlags;
pub use meta::{InodeId, InodeInfo, InodeKind, MetaClient, MetaResult, MetaStatus, ROOT_INODE};
