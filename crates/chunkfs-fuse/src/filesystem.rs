//! `fuser::Filesystem` binding.
//!
//! Maps kernel requests 1:1 onto [`FileNode`] operations and replies with
//! the errno of the resulting [`crate::error::FuseError`]. Directory
//! listing and namespace mutation are not served here.

use dashmap::DashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, warn};

use crate::attr::FileAttr;
use crate::dir_table::DirectoryTable;
use crate::file::{FileKind, FileNode};
use crate::flags::OpenFlags;
use crate::meta::{InodeId, InodeKind, MetaClient, MetaStatus, ROOT_INODE};

/// Per-mount settings of [`ChunkFs`].
#[derive(Debug, Clone)]
pub struct ChunkFsConfig {
    /// Owner reported for every node.
    pub uid: u32,
    /// Group reported for every node.
    pub gid: u32,
    /// Attribute cache timeout.
    pub attr_timeout: Duration,
    /// Entry cache timeout.
    pub entry_timeout: Duration,
}

impl Default for ChunkFsConfig {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            attr_timeout: Duration::from_secs(1),
            entry_timeout: Duration::from_secs(1),
        }
    }
}

struct NodeRef {
    node: Arc<FileNode>,
    lookups: u64,
}

struct DirRef {
    mtime_secs: i64,
    lookups: u64,
}

/// FUSE filesystem serving one mount.
///
/// Keeps the kernel's lookup references per inode and routes handle
/// operations to the [`FileNode`] bound to each file inode.
pub struct ChunkFs {
    config: ChunkFsConfig,
    meta: Arc<dyn MetaClient>,
    dirs: Arc<DirectoryTable>,
    nodes: DashMap<InodeId, NodeRef>,
    directories: DashMap<InodeId, DirRef>,
    next_fh: AtomicU64,
}

impl ChunkFs {
    /// Creates a filesystem over `meta` with nothing looked up yet.
    pub fn new(config: ChunkFsConfig, meta: Arc<dyn MetaClient>) -> Self {
        Self {
            config,
            meta,
            dirs: Arc::new(DirectoryTable::new()),
            nodes: DashMap::new(),
            directories: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Mount settings.
    pub fn config(&self) -> &ChunkFsConfig {
        &self.config
    }

    /// Active entries shared with every node.
    pub fn directory_table(&self) -> &Arc<DirectoryTable> {
        &self.dirs
    }

    /// Node currently bound to `ino`, if the kernel holds a lookup on it.
    pub fn node(&self, ino: InodeId) -> Option<Arc<FileNode>> {
        self.nodes.get(&ino).map(|r| r.node.clone())
    }

    /// Lookup count the kernel holds on `ino`.
    pub fn lookup_count(&self, ino: InodeId) -> u64 {
        self.nodes.get(&ino).map(|r| r.lookups).unwrap_or(0)
    }

    /// Resolves `name` under `parent` and binds it to a node, taking one
    /// kernel lookup reference.
    pub fn lookup_entry(&self, parent: InodeId, name: &str) -> crate::Result<FileAttr> {
        let info = match self.meta.resolve(parent, name) {
            Ok(info) => info,
            Err(MetaStatus::NotFound) => {
                self.dirs.invalidate(parent, name);
                return Err(crate::FuseError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(status) => return Err(crate::FuseError::io(name, status.to_string())),
        };

        let inode_kind = info.kind;
        let kind = match inode_kind {
            InodeKind::Directory => {
                let attr = FileAttr::directory(info.ino, info.mtime_secs, self.config.attr_timeout);
                let mut entry = self.directories.entry(info.ino).or_insert(DirRef {
                    mtime_secs: info.mtime_secs,
                    lookups: 0,
                });
                entry.mtime_secs = info.mtime_secs;
                entry.lookups += 1;
                return Ok(attr);
            }
            InodeKind::File => FileKind::Regular,
            InodeKind::Symlink => FileKind::Symlink,
        };

        let node = self.dirs.get_or_insert_with(parent, name, || {
            FileNode::new(
                kind,
                info.ino,
                parent,
                name,
                self.meta.clone(),
                Arc::downgrade(&self.dirs),
                self.config.attr_timeout,
            )
        });
        let attr = node.attr()?;
        self.bind(attr.ino, node);
        Ok(attr)
    }

    /// Opens `name` under `parent`, creating it when absent, and binds the
    /// node to its (possibly new) inode.
    pub fn create_entry(&self, parent: InodeId, name: &str, flags: OpenFlags) -> crate::Result<FileAttr> {
        let node = self.dirs.get_or_insert_with(parent, name, || {
            FileNode::new(
                FileKind::Regular,
                0,
                parent,
                name,
                self.meta.clone(),
                Arc::downgrade(&self.dirs),
                self.config.attr_timeout,
            )
        });
        if let Err(e) = node.open(flags.with(libc::O_CREAT)) {
            if node.handle_count() == 0 {
                self.dirs.forget_child(parent, name, &node);
            }
            return Err(e);
        }
        let attr = match node.attr() {
            Ok(attr) => attr,
            Err(e) => {
                if let Err(release_err) = node.release(flags) {
                    warn!("create {}: release after attr failure: {}", name, release_err);
                }
                if node.handle_count() == 0 {
                    self.dirs.forget_child(parent, name, &node);
                }
                return Err(e);
            }
        };
        self.bind(attr.ino, node);
        Ok(attr)
    }

    /// Drops `nlookup` kernel references; the node or directory row is
    /// forgotten at zero.
    pub fn forget_entry(&self, ino: InodeId, nlookup: u64) {
        let forgotten = {
            let Some(mut entry) = self.nodes.get_mut(&ino) else {
                self.forget_directory(ino, nlookup);
                return;
            };
            entry.lookups = entry.lookups.saturating_sub(nlookup);
            entry.lookups == 0
        };
        if forgotten {
            if let Some((_, entry)) = self.nodes.remove_if(&ino, |_, r| r.lookups == 0) {
                entry.node.forget();
            }
        }
    }

    fn forget_directory(&self, ino: InodeId, nlookup: u64) {
        let forgotten = match self.directories.get_mut(&ino) {
            Some(mut entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => return,
        };
        if forgotten && self.directories.remove_if(&ino, |_, d| d.lookups == 0).is_some() {
            debug!("directory forgotten: inode={}", ino);
        }
    }

    fn bind(&self, ino: InodeId, node: Arc<FileNode>) {
        let mut entry = self.nodes.entry(ino).or_insert_with(|| NodeRef {
            node: node.clone(),
            lookups: 0,
        });
        entry.node = node;
        entry.lookups += 1;
    }

    fn dir_attr(&self, ino: InodeId) -> Option<FileAttr> {
        if ino == ROOT_INODE {
            return Some(FileAttr::directory(ROOT_INODE, 0, self.config.attr_timeout));
        }
        self.directories
            .get(&ino)
            .map(|dir| FileAttr::directory(ino, dir.mtime_secs, self.config.attr_timeout))
    }

    fn reply_attr(&self, attr: &FileAttr, reply: ReplyAttr) {
        reply.attr(&attr.ttl, &attr.to_fuser(self.config.uid, self.config.gid));
    }
}

impl Filesystem for ChunkFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("ChunkFS filesystem init");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = name.to_string_lossy();
        debug!("lookup parent={} name={}", parent, name_str);
        match self.lookup_entry(parent, &name_str) {
            Ok(attr) => reply.entry(
                &self.config.entry_timeout,
                &attr.to_fuser(self.config.uid, self.config.gid),
                0,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget ino={} nlookup={}", ino, nlookup);
        self.forget_entry(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        if let Some(attr) = self.dir_attr(ino) {
            self.reply_attr(&attr, reply);
            return;
        }
        match self.node(ino) {
            Some(node) => match node.attr() {
                Ok(attr) => self.reply_attr(&attr, reply),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino={} size={:?} mode={:?}", ino, size, mode);
        if let Some(attr) = self.dir_attr(ino) {
            self.reply_attr(&attr, reply);
            return;
        }
        match self.node(ino) {
            Some(node) => match node.setattr() {
                Ok(attr) => self.reply_attr(&attr, reply),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink ino={}", ino);
        match self.node(ino) {
            Some(node) => match node.readlink() {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino={} flags={:#o}", ino, flags);
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match node.open(OpenFlags::from_libc(flags)) {
            Ok(()) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name_str = name.to_string_lossy();
        debug!(
            "create parent={} name={} mode={:o} flags={:#o}",
            parent, name_str, mode, flags
        );
        match self.create_entry(parent, &name_str, OpenFlags::from_libc(flags)) {
            Ok(attr) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                reply.created(
                    &self.config.entry_timeout,
                    &attr.to_fuser(self.config.uid, self.config.gid),
                    0,
                    fh,
                    flags as u32,
                );
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} offset={} size={}", ino, offset, size);
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match node.read(offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino={} offset={} size={}", ino, offset, data.len());
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match node.write(offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush ino={}", ino);
        match self.node(ino) {
            Some(node) => match node.flush() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsync ino={}", ino);
        match self.node(ino) {
            Some(node) => match node.fsync() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release ino={} fh={}", ino, fh);
        let Some(node) = self.node(ino) else {
            warn!("release of unbound inode {}", ino);
            reply.ok();
            return;
        };
        match node.release(OpenFlags::from_libc(flags)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
