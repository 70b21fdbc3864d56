//! Per-file handle state machine.
//!
//! One [`FileNode`] exists per open name within a parent directory and is
//! shared by every FUSE handle that refers to it. The node counts handles
//! and writers, owns the chunk session while any handle is open, and rejects
//! a second concurrent writer.
//!
//! Every operation holds the node mutex for its whole critical section,
//! including the call into the chunk session. Operations on one file are
//! therefore serialized; different files never contend.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::attr::FileAttr;
use crate::chunk::{ChunkError, ChunkSession};
use crate::dir_table::DirectoryTable;
use crate::error::{FuseError, Result};
use crate::flags::OpenFlags;
use crate::meta::{InodeId, MetaClient, MetaStatus};

/// Kinds of non-directory nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file backed by chunk storage.
    Regular,
    /// Symbolic link; its target is immutable once created.
    Symlink,
}

struct NodeState {
    inode: InodeId,
    parent: InodeId,
    name: String,
    writers: u32,
    handles: u32,
    session: Option<Arc<dyn ChunkSession>>,
}

/// Logical open file shared by all handles on one name.
pub struct FileNode {
    kind: FileKind,
    meta: Arc<dyn MetaClient>,
    dirs: Weak<DirectoryTable>,
    attr_ttl: Duration,
    state: Mutex<NodeState>,
}

impl FileNode {
    /// Creates a closed node for `name` under `parent`. `inode` may be 0 until
    /// the first open resolves it.
    pub fn new(
        kind: FileKind,
        inode: InodeId,
        parent: InodeId,
        name: &str,
        meta: Arc<dyn MetaClient>,
        dirs: Weak<DirectoryTable>,
        attr_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(FileNode {
            kind,
            meta,
            dirs,
            attr_ttl,
            state: Mutex::new(NodeState {
                inode,
                parent,
                name: name.to_string(),
                writers: 0,
                handles: 0,
                session: None,
            }),
        })
    }

    /// Regular file or symlink.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Inode number, or 0 before the first successful open.
    pub fn inode(&self) -> InodeId {
        self.state.lock().inode
    }

    /// Current parent inode.
    pub fn parent(&self) -> InodeId {
        self.state.lock().parent
    }

    /// Current name.
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Renames the node. The directory table is not touched.
    pub fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_string();
    }

    /// Moves the node under `parent`.
    pub fn set_parent(&self, parent: InodeId) {
        self.state.lock().parent = parent;
    }

    /// Number of open handles.
    pub fn handle_count(&self) -> u32 {
        self.state.lock().handles
    }

    /// Number of handles open for writing.
    pub fn writer_count(&self) -> u32 {
        self.state.lock().writers
    }

    /// True while a chunk session is held.
    pub fn has_session(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Returns current attributes.
    ///
    /// Regular files report the larger of the flushed and the cached size
    /// so dirty writes are visible before flush.
    pub fn attr(&self) -> Result<FileAttr> {
        let state = self.state.lock();
        match self.kind {
            FileKind::Regular => {
                let info = match self.meta.resolve(state.parent, &state.name) {
                    Ok(info) => info,
                    Err(MetaStatus::NotFound) => {
                        self.invalidate_entry(&state);
                        return Err(FuseError::NotFound {
                            name: state.name.clone(),
                        });
                    }
                    Err(status) => {
                        warn!("attr: resolve {} failed: {}", state.name, status);
                        return Err(FuseError::io(&state.name, status.to_string()));
                    }
                };
                let cached = state
                    .session
                    .as_ref()
                    .map(|session| session.cached_size())
                    .unwrap_or(0);
                let size = info.size.max(cached);
                Ok(FileAttr::regular(&info, size, self.attr_ttl))
            }
            FileKind::Symlink => match self.meta.resolve_symlink(state.parent, &state.name) {
                Ok(ino) => Ok(FileAttr::symlink(ino)),
                Err(MetaStatus::NotFound) => {
                    self.invalidate_entry(&state);
                    Err(FuseError::NotFound {
                        name: state.name.clone(),
                    })
                }
                Err(status) => {
                    warn!("attr: resolve symlink {} failed: {}", state.name, status);
                    Err(FuseError::io(&state.name, status.to_string()))
                }
            },
        }
    }

    /// Opens one more handle on this file.
    ///
    /// The first open resolves the name and creates the chunk session,
    /// creating the file itself when the flags ask for it. Later opens only
    /// tell the session about the extra opener.
    pub fn open(self: &Arc<Self>, flags: OpenFlags) -> Result<()> {
        if flags.truncates() {
            debug!("open: rejecting O_TRUNC flags={:#o}", flags.bits());
            return Err(FuseError::Unsupported {
                op: "open with O_TRUNC".to_string(),
            });
        }

        let mut state = self.state.lock();
        debug!(
            "open start: name={} inode={} parent={} flags={:#o} handles={} writers={}",
            state.name,
            state.inode,
            state.parent,
            flags.bits(),
            state.handles,
            state.writers
        );

        if state.writers > 0 && flags.is_writable() {
            error!("open: {} already has a writer", state.name);
            return Err(FuseError::PermissionDenied {
                name: state.name.clone(),
                op: "open for write".to_string(),
            });
        }

        if state.session.is_none() && state.handles == 0 {
            let session = match self.meta.open(state.parent, &state.name, flags) {
                Ok(session) => session,
                Err(MetaStatus::NotFound) => {
                    self.invalidate_entry(&state);
                    if !flags.requests_create() {
                        return Err(FuseError::NotFound {
                            name: state.name.clone(),
                        });
                    }
                    let session = self
                        .meta
                        .create(state.parent, &state.name, flags)
                        .map_err(|status| match status {
                            MetaStatus::AlreadyExists => FuseError::AlreadyExists {
                                name: state.name.clone(),
                            },
                            other => {
                                error!("open: create {} failed: {}", state.name, other);
                                FuseError::io(&state.name, other.to_string())
                            }
                        })?;
                    state.handles = 0;
                    state.writers = 0;
                    if let Some(dirs) = self.dirs.upgrade() {
                        dirs.insert(state.parent, &state.name, Arc::clone(self));
                    }
                    session
                }
                Err(status) => {
                    error!("open: resolve {} failed: {}", state.name, status);
                    return Err(FuseError::io(&state.name, status.to_string()));
                }
            };
            state.inode = session.inode();
            state.session = Some(session);
        } else if let Some(session) = &state.session {
            session.note_open(flags);
        }

        state.handles += 1;
        if flags.is_writable() {
            state.writers += 1;
        }

        debug!(
            "open end: name={} inode={} handles={} writers={}",
            state.name, state.inode, state.handles, state.writers
        );
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`.
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let session = self.session(&state, "read")?;

        if offset == session.cached_size() {
            debug!("read: {} offset {} is at end of file", state.name, offset);
            return Ok(Vec::new());
        }

        let data = session.read(offset, size as usize).map_err(|e| {
            error!("read: {} offset {} failed: {}", state.name, offset, e);
            FuseError::io(&state.name, e.to_string())
        })?;
        if data.len() != size as usize {
            debug!(
                "read: {} requested {} bytes, got {}",
                state.name,
                size,
                data.len()
            );
        }
        Ok(data)
    }

    /// Writes `data` at `offset`. Handle counts are untouched on failure.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let state = self.state.lock();
        let session = self.session(&state, "write")?;

        match session.write(offset, data) {
            Ok(written) if written == data.len() => Ok(written as u32),
            Ok(written) => {
                error!(
                    "write: {} short write {} of {} bytes",
                    state.name,
                    written,
                    data.len()
                );
                Err(FuseError::io(&state.name, format!("short write of {} bytes", written)))
            }
            Err(ChunkError::NoSpace) => {
                error!("write: {} failed: ENOSPC", state.name);
                Err(FuseError::ResourceExhausted {
                    name: state.name.clone(),
                })
            }
            Err(e) => {
                error!("write: {} failed: {}", state.name, e);
                Err(FuseError::io(&state.name, e.to_string()))
            }
        }
    }

    /// Pushes cached writes to remote storage.
    pub fn flush(&self) -> Result<()> {
        self.flush_session("flush")
    }

    /// Same as [`FileNode::flush`]: the chunk store exposes a single
    /// durability level.
    pub fn fsync(&self) -> Result<()> {
        self.flush_session("fsync")
    }

    /// Releases one handle opened with `flags`.
    ///
    /// A failing write-side close is reported only after the counts have
    /// been decremented. The last release closes the chunk session.
    /// Releasing more handles than were opened clamps the counts at zero.
    pub fn release(&self, flags: OpenFlags) -> Result<()> {
        let mut state = self.state.lock();
        debug!(
            "release start: name={} parent={} handles={} writers={}",
            state.name, state.parent, state.handles, state.writers
        );

        let mut outcome = Ok(());
        if flags.is_writable() {
            if state.writers == 0 {
                warn!("release: {} has no writer to release", state.name);
            } else {
                state.writers -= 1;
            }
            if let Some(session) = &state.session {
                if let Err(e) = session.close_write() {
                    error!("release: {} close write failed: {}", state.name, e);
                    outcome = Err(FuseError::io(&state.name, e.to_string()));
                }
            }
        }

        if state.handles == 0 {
            warn!("release: {} has no open handle", state.name);
            return outcome;
        }
        state.handles -= 1;
        if state.handles == 0 {
            if let Some(session) = state.session.take() {
                session.close();
            }
        }

        debug!(
            "release end: name={} handles={} writers={}",
            state.name, state.handles, state.writers
        );
        outcome
    }

    /// Drops this node from its parent's active entries.
    pub fn forget(&self) {
        let (parent, name) = {
            let state = self.state.lock();
            (state.parent, state.name.clone())
        };
        if let Some(dirs) = self.dirs.upgrade() {
            dirs.forget_child(parent, &name, self);
        }
    }

    /// Attribute changes are accepted and ignored.
    pub fn setattr(&self) -> Result<FileAttr> {
        debug!("setattr: {} ignored", self.name());
        self.attr()
    }

    /// Target of a symlink node.
    pub fn readlink(&self) -> Result<String> {
        let (inode, name) = {
            let state = self.state.lock();
            (state.inode, state.name.clone())
        };
        self.meta.read_symlink_target(inode).map_err(|status| {
            error!("readlink: {} (inode {}) failed: {}", name, inode, status);
            FuseError::io(&name, status.to_string())
        })
    }

    fn flush_session(&self, op: &str) -> Result<()> {
        let state = self.state.lock();
        let session = self.session(&state, op)?;
        session.flush().map_err(|e| {
            error!("{}: {} failed: {}", op, state.name, e);
            FuseError::io(&state.name, e.to_string())
        })
    }

    fn session<'a>(&self, state: &'a NodeState, op: &str) -> Result<&'a Arc<dyn ChunkSession>> {
        state.session.as_ref().ok_or_else(|| {
            error!("{}: {} has no open handle", op, state.name);
            FuseError::io(&state.name, format!("{} without an open handle", op))
        })
    }

    fn invalidate_entry(&self, state: &NodeState) {
        if let Some(dirs) = self.dirs.upgrade() {
            dirs.invalidate(state.parent, &state.name);
        }
    }
}
