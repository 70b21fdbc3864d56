//! Replication sessions: one leg of a chunk relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::link::TcpLink;
use crate::registry::StreamId;

/// Which side of the relay this node is on for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node receives bytes from a client.
    Inbound,
    /// This node forwards bytes to the next replica.
    Outbound,
}

/// A live replication leg. Owns its link; the link closes when the last
/// reference to the session goes away.
pub struct ReplicationSession {
    stream_id: StreamId,
    direction: Direction,
    chunk_id: u64,
    remote_stream_id: Option<StreamId>,
    link: TcpLink,
    bytes: AtomicU64,
    opened_at: Instant,
}

impl ReplicationSession {
    /// Session for bytes arriving from a client.
    pub fn inbound(stream_id: StreamId, chunk_id: u64, link: TcpLink) -> Self {
        Self::new(stream_id, Direction::Inbound, chunk_id, None, link)
    }

    /// Session toward the next replica, which knows the stream as
    /// `remote_stream_id`.
    pub fn outbound(
        stream_id: StreamId,
        chunk_id: u64,
        remote_stream_id: StreamId,
        link: TcpLink,
    ) -> Self {
        Self::new(
            stream_id,
            Direction::Outbound,
            chunk_id,
            Some(remote_stream_id),
            link,
        )
    }

    fn new(
        stream_id: StreamId,
        direction: Direction,
        chunk_id: u64,
        remote_stream_id: Option<StreamId>,
        link: TcpLink,
    ) -> Self {
        Self {
            stream_id,
            direction,
            chunk_id,
            remote_stream_id,
            link,
            bytes: AtomicU64::new(0),
            opened_at: Instant::now(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    /// Stream id to put on frames sent over this session's link.
    pub fn wire_stream_id(&self) -> StreamId {
        self.remote_stream_id.unwrap_or(self.stream_id)
    }

    pub fn peer(&self) -> &str {
        self.link.peer_addr()
    }

    pub fn link(&self) -> &TcpLink {
        &self.link
    }

    /// Records `len` more bytes moved over this leg.
    pub fn add_bytes(&self, len: u64) -> u64 {
        self.bytes.fetch_add(len, Ordering::Relaxed) + len
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

impl std::fmt::Debug for ReplicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSession")
            .field("stream_id", &self.stream_id)
            .field("direction", &self.direction)
            .field("chunk_id", &self.chunk_id)
            .field("remote_stream_id", &self.remote_stream_id)
            .field("peer", &self.link.peer_addr())
            .field("bytes", &self.bytes())
            .finish()
    }
}
