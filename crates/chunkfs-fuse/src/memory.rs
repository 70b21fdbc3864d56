//! In-memory metadata service and chunk store.
//!
//! Backs the client when no remote cluster is configured and lets tests
//! inject out-of-space, flush and write-close failures per file.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::chunk::{ChunkError, ChunkResult, ChunkSession};
use crate::flags::OpenFlags;
use crate::meta::{InodeId, InodeInfo, InodeKind, MetaClient, MetaResult, MetaStatus, ROOT_INODE};

const EIO_CODE: i32 = 5;
const EISDIR_CODE: i32 = 21;

/// Size cap for files without an explicit capacity.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// Durable state of one object in the in-memory store.
pub struct MemoryFile {
    ino: InodeId,
    kind: InodeKind,
    target: Option<String>,
    data: RwLock<Vec<u8>>,
    mtime_secs: AtomicI64,
    capacity: Mutex<Option<u64>>,
    fail_flush: AtomicBool,
    fail_close_write: AtomicBool,
    sessions_opened: AtomicU32,
    sessions_closed: AtomicU32,
    noted_opens: AtomicU32,
}

impl MemoryFile {
    fn new(ino: InodeId, kind: InodeKind, data: Vec<u8>, target: Option<String>) -> Self {
        MemoryFile {
            ino,
            kind,
            target,
            data: RwLock::new(data),
            mtime_secs: AtomicI64::new(now_secs()),
            capacity: Mutex::new(None),
            fail_flush: AtomicBool::new(false),
            fail_close_write: AtomicBool::new(false),
            sessions_opened: AtomicU32::new(0),
            sessions_closed: AtomicU32::new(0),
            noted_opens: AtomicU32::new(0),
        }
    }

    /// Inode number.
    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// Flushed contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Largest file size writes may reach; `None` applies
    /// [`DEFAULT_MAX_FILE_SIZE`].
    pub fn set_capacity(&self, capacity: Option<u64>) {
        *self.capacity.lock() = capacity;
    }

    /// Makes flushes fail with an I/O error.
    pub fn fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Makes write-side closes fail with an I/O error.
    pub fn fail_close_write(&self, fail: bool) {
        self.fail_close_write.store(fail, Ordering::SeqCst);
    }

    /// Chunk sessions opened on this file.
    pub fn sessions_opened(&self) -> u32 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Chunk sessions closed on this file.
    pub fn sessions_closed(&self) -> u32 {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    /// Extra openers reported to live sessions.
    pub fn noted_opens(&self) -> u32 {
        self.noted_opens.load(Ordering::SeqCst)
    }

    fn info(&self) -> InodeInfo {
        InodeInfo {
            ino: self.ino,
            kind: self.kind,
            size: self.data.read().len() as u64,
            nlink: if self.kind == InodeKind::Directory { 2 } else { 1 },
            atime_secs: self.mtime_secs.load(Ordering::SeqCst),
            mtime_secs: self.mtime_secs.load(Ordering::SeqCst),
        }
    }
}

/// Chunk session over a [`MemoryFile`] with a private write-back cache.
pub struct MemoryChunkSession {
    file: Arc<MemoryFile>,
    cache: Mutex<Vec<u8>>,
}

impl MemoryChunkSession {
    fn open(file: Arc<MemoryFile>) -> Arc<Self> {
        file.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let cache = file.contents();
        Arc::new(MemoryChunkSession {
            file,
            cache: Mutex::new(cache),
        })
    }

    fn persist(&self) {
        let cache = self.cache.lock();
        *self.file.data.write() = cache.clone();
        self.file.mtime_secs.store(now_secs(), Ordering::SeqCst);
    }
}

impl ChunkSession for MemoryChunkSession {
    fn inode(&self) -> InodeId {
        self.file.ino
    }

    fn cached_size(&self) -> u64 {
        self.cache.lock().len() as u64
    }

    fn read(&self, offset: u64, len: usize) -> ChunkResult<Vec<u8>> {
        let cache = self.cache.lock();
        let start = (offset as usize).min(cache.len());
        let end = start.saturating_add(len).min(cache.len());
        Ok(cache[start..end].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> ChunkResult<usize> {
        let capacity = self.file.capacity.lock().unwrap_or(DEFAULT_MAX_FILE_SIZE);
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= capacity)
            .ok_or(ChunkError::NoSpace)?;
        let (start, end) = match (usize::try_from(offset), usize::try_from(end)) {
            (Ok(start), Ok(end)) => (start, end),
            _ => return Err(ChunkError::NoSpace),
        };
        let mut cache = self.cache.lock();
        if cache.len() < end {
            cache.resize(end, 0);
        }
        cache[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn flush(&self) -> ChunkResult<()> {
        if self.file.fail_flush.load(Ordering::SeqCst) {
            return Err(ChunkError::Io("injected flush failure".to_string()));
        }
        self.persist();
        Ok(())
    }

    fn close_write(&self) -> ChunkResult<()> {
        if self.file.fail_close_write.load(Ordering::SeqCst) {
            return Err(ChunkError::Io("injected close-write failure".to_string()));
        }
        self.persist();
        Ok(())
    }

    fn close(&self) {
        self.file.sessions_closed.fetch_add(1, Ordering::SeqCst);
        debug!("memory session closed: inode={}", self.file.ino);
    }

    fn note_open(&self, flags: OpenFlags) {
        self.file.noted_opens.fetch_add(1, Ordering::SeqCst);
        debug!(
            "memory session extra opener: inode={} flags={:#o}",
            self.file.ino,
            flags.bits()
        );
    }
}

/// Metadata service kept entirely in process memory.
pub struct MemoryMeta {
    entries: RwLock<HashMap<(InodeId, String), Arc<MemoryFile>>>,
    by_inode: RwLock<HashMap<InodeId, Arc<MemoryFile>>>,
    next_ino: AtomicU64,
    unavailable: AtomicBool,
    create_status: Mutex<Option<MetaStatus>>,
}

impl MemoryMeta {
    /// Creates an empty store holding only the root.
    pub fn new() -> Self {
        MemoryMeta {
            entries: RwLock::new(HashMap::new()),
            by_inode: RwLock::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
            unavailable: AtomicBool::new(false),
            create_status: Mutex::new(None),
        }
    }

    /// Adds a flushed regular file.
    pub fn add_file(&self, parent: InodeId, name: &str, contents: &[u8]) -> InodeId {
        self.add(parent, name, InodeKind::File, contents.to_vec(), None)
    }

    /// Adds a symlink pointing at `target`.
    pub fn add_symlink(&self, parent: InodeId, name: &str, target: &str) -> InodeId {
        self.add(parent, name, InodeKind::Symlink, Vec::new(), Some(target.to_string()))
    }

    /// Adds an empty directory.
    pub fn add_dir(&self, parent: InodeId, name: &str) -> InodeId {
        self.add(parent, name, InodeKind::Directory, Vec::new(), None)
    }

    /// Removes the name, as if another client had unlinked it.
    pub fn remove(&self, parent: InodeId, name: &str) -> bool {
        let removed = self.entries.write().remove(&(parent, name.to_string()));
        if let Some(file) = &removed {
            self.by_inode.write().remove(&file.ino);
        }
        removed.is_some()
    }

    /// Store entry behind `name`, for inspecting or injecting failures.
    pub fn file_state(&self, parent: InodeId, name: &str) -> Option<Arc<MemoryFile>> {
        self.entries.read().get(&(parent, name.to_string())).cloned()
    }

    /// Makes every call fail with a non-NotFound status.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Forces `create` to fail with `status`.
    pub fn set_create_status(&self, status: Option<MetaStatus>) {
        *self.create_status.lock() = status;
    }

    fn add(
        &self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        data: Vec<u8>,
        target: Option<String>,
    ) -> InodeId {
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(MemoryFile::new(ino, kind, data, target));
        self.entries
            .write()
            .insert((parent, name.to_string()), file.clone());
        self.by_inode.write().insert(ino, file);
        ino
    }

    fn check_available(&self) -> MetaResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MetaStatus::Other(EIO_CODE));
        }
        Ok(())
    }

    fn lookup(&self, parent: InodeId, name: &str) -> MetaResult<Arc<MemoryFile>> {
        self.check_available()?;
        self.file_state(parent, name).ok_or(MetaStatus::NotFound)
    }
}

impl Default for MemoryMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaClient for MemoryMeta {
    fn resolve(&self, parent: InodeId, name: &str) -> MetaResult<InodeInfo> {
        Ok(self.lookup(parent, name)?.info())
    }

    fn resolve_symlink(&self, parent: InodeId, name: &str) -> MetaResult<InodeId> {
        let file = self.lookup(parent, name)?;
        if file.kind != InodeKind::Symlink {
            return Err(MetaStatus::NotFound);
        }
        Ok(file.ino)
    }

    fn open(&self, parent: InodeId, name: &str, _flags: OpenFlags) -> MetaResult<Arc<dyn ChunkSession>> {
        let file = self.lookup(parent, name)?;
        if file.kind == InodeKind::Directory {
            return Err(MetaStatus::Other(EISDIR_CODE));
        }
        Ok(MemoryChunkSession::open(file))
    }

    fn create(&self, parent: InodeId, name: &str, _flags: OpenFlags) -> MetaResult<Arc<dyn ChunkSession>> {
        self.check_available()?;
        if let Some(status) = *self.create_status.lock() {
            return Err(status);
        }
        let file = {
            let mut entries = self.entries.write();
            match entries.entry((parent, name.to_string())) {
                Entry::Occupied(_) => return Err(MetaStatus::AlreadyExists),
                Entry::Vacant(slot) => {
                    let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
                    let file = Arc::new(MemoryFile::new(ino, InodeKind::File, Vec::new(), None));
                    slot.insert(Arc::clone(&file));
                    file
                }
            }
        };
        self.by_inode.write().insert(file.ino, Arc::clone(&file));
        Ok(MemoryChunkSession::open(file))
    }

    fn read_symlink_target(&self, ino: InodeId) -> MetaResult<String> {
        self.check_available()?;
        self.by_inode
            .read()
            .get(&ino)
            .and_then(|file| file.target.clone())
            .ok_or(MetaStatus::NotFound)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_reports_flushed_size() {
        let meta = MemoryMeta::new();
        let ino = meta.add_file(ROOT_INODE, "f", b"abcd");
        let info = meta.resolve(ROOT_INODE, "f").unwrap();
        assert_eq!(info.ino, ino);
        assert_eq!(info.size, 4);
        assert_eq!(info.kind, InodeKind::File);
    }

    #[test]
    fn test_resolve_missing_is_not_found() {
        let meta = MemoryMeta::new();
        assert_eq!(meta.resolve(ROOT_INODE, "x"), Err(MetaStatus::NotFound));
    }

    #[test]
    fn test_unavailable_is_other() {
        let meta = MemoryMeta::new();
        meta.add_file(ROOT_INODE, "f", b"");
        meta.set_unavailable(true);
        assert!(matches!(meta.resolve(ROOT_INODE, "f"), Err(MetaStatus::Other(_))));
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let meta = MemoryMeta::new();
        assert!(meta.create(ROOT_INODE, "f", OpenFlags::WRITE_ONLY).is_ok());
        assert!(matches!(
            meta.create(ROOT_INODE, "f", OpenFlags::WRITE_ONLY),
            Err(MetaStatus::AlreadyExists)
        ));
    }

    #[test]
    fn test_session_write_is_cached_until_flush() {
        let meta = MemoryMeta::new();
        meta.add_file(ROOT_INODE, "f", b"");
        let session = meta.open(ROOT_INODE, "f", OpenFlags::WRITE_ONLY).unwrap();
        assert_eq!(session.write(3, b"xy").unwrap(), 2);
        assert_eq!(session.cached_size(), 5);
        let file = meta.file_state(ROOT_INODE, "f").unwrap();
        assert!(file.contents().is_empty());
        session.flush().unwrap();
        assert_eq!(file.contents(), vec![0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_capacity_limit_is_no_space() {
        let meta = MemoryMeta::new();
        meta.add_file(ROOT_INODE, "f", b"");
        meta.file_state(ROOT_INODE, "f").unwrap().set_capacity(Some(2));
        let session = meta.open(ROOT_INODE, "f", OpenFlags::WRITE_ONLY).unwrap();
        assert_eq!(session.write(0, b"abc"), Err(ChunkError::NoSpace));
        assert_eq!(session.cached_size(), 0);
    }

    #[test]
    fn test_write_past_default_cap_is_no_space() {
        let meta = MemoryMeta::new();
        meta.add_file(ROOT_INODE, "f", b"ab");
        let session = meta.open(ROOT_INODE, "f", OpenFlags::WRITE_ONLY).unwrap();
        assert_eq!(session.write(i64::MAX as u64 - 1, b"x"), Err(ChunkError::NoSpace));
        assert_eq!(session.write(DEFAULT_MAX_FILE_SIZE, b"x"), Err(ChunkError::NoSpace));
        assert_eq!(session.write(u64::MAX, b"xy"), Err(ChunkError::NoSpace));
        assert_eq!(session.cached_size(), 2);
        assert_eq!(session.write(2, b"c").unwrap(), 1);
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let meta = Arc::new(MemoryMeta::new());
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let meta = meta.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    meta.create(ROOT_INODE, "race", OpenFlags::WRITE_ONLY)
                        .map(|session| session.inode())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(MetaStatus::AlreadyExists))));
        let file = meta.file_state(ROOT_INODE, "race").unwrap();
        assert_eq!(file.ino(), *winners[0]);
        assert_eq!(file.sessions_opened(), 1);
    }

    #[test]
    fn test_open_directory_fails() {
        let meta = MemoryMeta::new();
        meta.add_dir(ROOT_INODE, "d");
        assert!(matches!(
            meta.open(ROOT_INODE, "d", OpenFlags::READ_ONLY),
            Err(MetaStatus::Other(EISDIR_CODE))
        ));
    }

    #[test]
    fn test_remove_forgets_inode() {
        let meta = MemoryMeta::new();
        let ino = meta.add_symlink(ROOT_INODE, "l", "/t");
        assert!(meta.remove(ROOT_INODE, "l"));
        assert_eq!(meta.read_symlink_target(ino), Err(MetaStatus::NotFound));
        assert!(!meta.remove(ROOT_INODE, "l"));
    }
}
