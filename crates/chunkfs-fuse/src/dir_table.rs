//! Active child entries per parent directory.
//!
//! File nodes refer to their parent by inode and reach this table through a
//! weak handle, so a directory never owns a file and a file never owns a
//! directory. Entries are a cache: readers may briefly see a stale name.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::file::FileNode;
use crate::meta::InodeId;

/// Parent inode -> (name -> node) for every name currently in use.
#[derive(Default)]
pub struct DirectoryTable {
    active: DashMap<InodeId, HashMap<String, Arc<FileNode>>>,
}

impl DirectoryTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Active node for `name` under `parent`, if any.
    pub fn get(&self, parent: InodeId, name: &str) -> Option<Arc<FileNode>> {
        self.active
            .get(&parent)
            .and_then(|children| children.get(name).cloned())
    }

    /// Returns the active node for `name`, inserting the one built by `make`
    /// when there is none.
    pub fn get_or_insert_with(
        &self,
        parent: InodeId,
        name: &str,
        make: impl FnOnce() -> Arc<FileNode>,
    ) -> Arc<FileNode> {
        let mut children = self.active.entry(parent).or_default();
        children
            .entry(name.to_string())
            .or_insert_with(make)
            .clone()
    }

    /// Maps `name` to `node`, replacing any previous entry.
    pub fn insert(&self, parent: InodeId, name: &str, node: Arc<FileNode>) {
        debug!("active entry added: parent={} name={}", parent, name);
        self.active
            .entry(parent)
            .or_default()
            .insert(name.to_string(), node);
    }

    /// Drops whatever entry `name` currently maps to.
    pub fn invalidate(&self, parent: InodeId, name: &str) -> Option<Arc<FileNode>> {
        let removed = self
            .active
            .get_mut(&parent)
            .and_then(|mut children| children.remove(name));
        if removed.is_some() {
            debug!("active entry invalidated: parent={} name={}", parent, name);
        }
        self.prune(parent);
        removed
    }

    /// Drops `name` only if it still maps to `node`; a newer node that took
    /// over the name is left alone.
    pub fn forget_child(&self, parent: InodeId, name: &str, node: &FileNode) -> bool {
        let removed = match self.active.get_mut(&parent) {
            Some(mut children) => match children.get(name) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), node) => {
                    children.remove(name);
                    true
                }
                _ => false,
            },
            None => false,
        };
        if removed {
            debug!("active entry forgotten: parent={} name={}", parent, name);
            self.prune(parent);
        }
        removed
    }

    /// Moves the entry for `old_name` to `new_name` and updates the node.
    pub fn rename_child(
        &self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> bool {
        // The node lock must not be taken while a shard guard is held.
        let Some(node) = self.invalidate(old_parent, old_name) else {
            return false;
        };
        node.set_parent(new_parent);
        node.set_name(new_name);
        self.insert(new_parent, new_name, node);
        true
    }

    /// Whether `name` has an active node under `parent`.
    pub fn contains(&self, parent: InodeId, name: &str) -> bool {
        self.active
            .get(&parent)
            .map(|children| children.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of active names under `parent`.
    pub fn active_count(&self, parent: InodeId) -> usize {
        self.active
            .get(&parent)
            .map(|children| children.len())
            .unwrap_or(0)
    }

    fn prune(&self, parent: InodeId) {
        self.active.remove_if(&parent, |_, children| children.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileKind;
    use crate::memory::MemoryMeta;
    use crate::meta::ROOT_INODE;
    use std::time::Duration;

    fn node(table: &Arc<DirectoryTable>, name: &str) -> Arc<FileNode> {
        let meta = Arc::new(MemoryMeta::new());
        FileNode::new(
            FileKind::Regular,
            0,
            ROOT_INODE,
            name,
            meta,
            Arc::downgrade(table),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let table = Arc::new(DirectoryTable::new());
        let n = node(&table, "a");
        table.insert(ROOT_INODE, "a", n.clone());
        let got = table.get(ROOT_INODE, "a").unwrap();
        assert!(Arc::ptr_eq(&got, &n));
        assert_eq!(table.active_count(ROOT_INODE), 1);
    }

    #[test]
    fn test_get_or_insert_keeps_existing() {
        let table = Arc::new(DirectoryTable::new());
        let first = node(&table, "a");
        table.insert(ROOT_INODE, "a", first.clone());
        let got = table.get_or_insert_with(ROOT_INODE, "a", || node(&table, "a"));
        assert!(Arc::ptr_eq(&got, &first));
    }

    #[test]
    fn test_invalidate_removes_and_prunes() {
        let table = Arc::new(DirectoryTable::new());
        table.insert(ROOT_INODE, "a", node(&table, "a"));
        assert!(table.invalidate(ROOT_INODE, "a").is_some());
        assert!(!table.contains(ROOT_INODE, "a"));
        assert_eq!(table.active_count(ROOT_INODE), 0);
        assert!(table.invalidate(ROOT_INODE, "a").is_none());
    }

    #[test]
    fn test_forget_child_ignores_replaced_node() {
        let table = Arc::new(DirectoryTable::new());
        let old = node(&table, "a");
        let new = node(&table, "a");
        table.insert(ROOT_INODE, "a", new.clone());

        assert!(!table.forget_child(ROOT_INODE, "a", &old));
        assert!(table.contains(ROOT_INODE, "a"));

        assert!(table.forget_child(ROOT_INODE, "a", &new));
        assert!(!table.contains(ROOT_INODE, "a"));
    }

    #[test]
    fn test_rename_child_moves_entry_and_updates_node() {
        let table = Arc::new(DirectoryTable::new());
        let n = node(&table, "old");
        table.insert(ROOT_INODE, "old", n.clone());

        assert!(table.rename_child(ROOT_INODE, "old", 5, "new"));
        assert!(!table.contains(ROOT_INODE, "old"));
        assert!(table.contains(5, "new"));
        assert_eq!(n.name(), "new");
        assert_eq!(n.parent(), 5);
    }

    #[test]
    fn test_rename_missing_entry_is_false() {
        let table = DirectoryTable::new();
        assert!(!table.rename_child(ROOT_INODE, "nope", ROOT_INODE, "x"));
    }
}
