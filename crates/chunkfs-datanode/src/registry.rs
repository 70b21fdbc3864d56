//! Stream registries.
//!
//! A DataNode keeps one registry for streams it receives from a client and
//! one for streams it opens toward the next replica. Lookups come from the
//! data-plane loop and take the shared lock; registration and teardown take
//! the exclusive lock once per stream. No lock is held across network I/O:
//! callers get an `Arc` back and stream through it after the lock is gone.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DataNodeError, Result};
use crate::session::ReplicationSession;

/// Identifier of one replication stream.
pub type StreamId = u64;

/// Registry of sessions this node serves for a client.
pub type ReplicationStreamRegistry = StreamRegistry<ReplicationSession>;

struct RegistryInner<S> {
    sessions: HashMap<StreamId, Arc<S>>,
    /// `None` once the id space is used up.
    next_id: Option<StreamId>,
}

/// Map of live streams keyed by stream id.
pub struct StreamRegistry<S> {
    name: &'static str,
    inner: RwLock<RegistryInner<S>>,
}

impl<S> StreamRegistry<S> {
    /// Creates an empty registry; `name` appears in errors and logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_id: Some(1),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hands out a fresh stream id. Ids are never reused for the lifetime
    /// of the registry, so allocation fails once `u64::MAX` is taken.
    pub fn allocate_stream_id(&self) -> Result<StreamId> {
        let mut inner = self.inner.write();
        let id = inner.next_id.ok_or(DataNodeError::StreamIdsExhausted {
            registry: self.name,
        })?;
        inner.next_id = id.checked_add(1);
        Ok(id)
    }

    /// Registers `session` under `stream_id`.
    ///
    /// The entry stays visible until the returned guard is dropped, so every
    /// exit path of the owning handler, including cancellation, unregisters
    /// it exactly once.
    pub fn register(&self, stream_id: StreamId, session: Arc<S>) -> Result<SessionGuard<'_, S>> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&stream_id) {
            warn!(registry = self.name, stream_id, "duplicate stream registration");
            return Err(DataNodeError::DuplicateStream {
                registry: self.name,
                stream_id,
            });
        }
        if inner.next_id.is_some_and(|next| stream_id >= next) {
            inner.next_id = stream_id.checked_add(1);
        }
        inner.sessions.insert(stream_id, Arc::clone(&session));
        debug!(registry = self.name, stream_id, "stream registered");
        Ok(SessionGuard {
            registry: self,
            stream_id,
            session,
        })
    }

    /// Returns the live session for `stream_id`.
    pub fn lookup(&self, stream_id: StreamId) -> Result<Arc<S>> {
        self.inner
            .read()
            .sessions
            .get(&stream_id)
            .cloned()
            .ok_or(DataNodeError::UnknownStream {
                registry: self.name,
                stream_id,
            })
    }

    /// Removes `stream_id`. Removing an absent id is a no-op.
    pub fn unregister(&self, stream_id: StreamId) -> Option<Arc<S>> {
        let removed = self.inner.write().sessions.remove(&stream_id);
        match removed {
            Some(_) => debug!(registry = self.name, stream_id, "stream unregistered"),
            None => debug!(registry = self.name, stream_id, "unregister of absent stream"),
        }
        removed
    }

    /// Removes `stream_id` only while it still maps to `session`.
    fn remove_session(&self, stream_id: StreamId, session: &Arc<S>) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get(&stream_id) {
            Some(live) if Arc::ptr_eq(live, session) => {
                inner.sessions.remove(&stream_id);
                debug!(registry = self.name, stream_id, "stream unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.inner.read().sessions.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Ids of all live streams, in no particular order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.inner.read().sessions.keys().copied().collect()
    }
}

/// Unregisters its stream when dropped. An entry that was already removed,
/// or replaced by a later registration of the same id, is left alone.
#[must_use = "dropping the guard unregisters the stream immediately"]
pub struct SessionGuard<'a, S> {
    registry: &'a StreamRegistry<S>,
    stream_id: StreamId,
    session: Arc<S>,
}

impl<S> SessionGuard<'_, S> {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl<S> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        self.registry.remove_session(self.stream_id, &self.session);
    }
}
