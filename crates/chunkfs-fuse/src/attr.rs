//! Node attributes and their conversion to kernel replies.

use crate::meta::{InodeId, InodeInfo, InodeKind};
use std::time::{Duration, SystemTime};

/// Block size reported to the kernel.
pub const BLOCK_SIZE: u32 = 4096;

/// Attributes reported for a node, with the time the kernel may cache them.
#[derive(Clone, Debug, PartialEq)]
pub struct FileAttr {
    /// Inode number.
    pub ino: InodeId,
    /// Size in bytes, including unflushed writes for open files.
    pub size: u64,
    /// 512-byte sectors.
    pub blocks: u64,
    /// Last access.
    pub atime: SystemTime,
    /// Last modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Object kind.
    pub kind: InodeKind,
    /// Permission bits.
    pub perm: u16,
    /// Link count.
    pub nlink: u32,
    /// How long the kernel may cache these attributes.
    pub ttl: Duration,
}

impl FileAttr {
    /// Attributes of a regular file. `size` already includes unflushed
    /// cached bytes.
    pub fn regular(info: &InodeInfo, size: u64, ttl: Duration) -> Self {
        let mtime = epoch_secs(info.mtime_secs);
        FileAttr {
            ino: info.ino,
            size,
            blocks: blocks_for_size(size),
            atime: epoch_secs(info.atime_secs),
            mtime,
            ctime: mtime,
            kind: InodeKind::File,
            perm: 0o666,
            nlink: info.nlink,
            ttl,
        }
    }

    /// Attributes of a symlink. Never cached by the kernel.
    pub fn symlink(ino: InodeId) -> Self {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind: InodeKind::Symlink,
            perm: 0o666,
            nlink: 1,
            ttl: Duration::ZERO,
        }
    }

    /// Attributes of a directory, reported with the size of one block.
    pub fn directory(ino: InodeId, mtime_secs: i64, ttl: Duration) -> Self {
        let mtime = epoch_secs(mtime_secs);
        FileAttr {
            ino,
            size: BLOCK_SIZE as u64,
            blocks: 8,
            atime: mtime,
            mtime,
            ctime: mtime,
            kind: InodeKind::Directory,
            perm: 0o755,
            nlink: 2,
            ttl,
        }
    }

    /// Converts to the `fuser` reply form, owned by `uid`/`gid`.
    pub fn to_fuser(&self, uid: u32, gid: u32) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: kind_to_fuser_type(self.kind),
            perm: self.perm,
            nlink: self.nlink,
            uid,
            gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// 512-byte sectors needed for `size` bytes, rounded up to whole blocks.
pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * 8
}

/// Maps an inode kind onto the kernel file type.
pub fn kind_to_fuser_type(kind: InodeKind) -> fuser::FileType {
    match kind {
        InodeKind::File => fuser::FileType::RegularFile,
        InodeKind::Directory => fuser::FileType::Directory,
        InodeKind::Symlink => fuser::FileType::Symlink,
    }
}

fn epoch_secs(secs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}
