use thiserror::Error;

use crate::registry::StreamId;

#[derive(Debug, Error)]
pub enum DataNodeError {
    #[error("stream {stream_id} already registered in {registry} registry")]
    DuplicateStream {
        registry: &'static str,
        stream_id: StreamId,
    },

    #[error("stream {stream_id} not found in {registry} registry")]
    UnknownStream {
        registry: &'static str,
        stream_id: StreamId,
    },

    #[error("stream ids exhausted in {registry} registry")]
    StreamIdsExhausted { registry: &'static str },

    #[error("link to {peer} failed: {reason}")]
    Link { peer: String, reason: String },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("registration with volmgr failed: {reason}")]
    Registration { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DataNodeError {
    pub(crate) fn link(peer: &str, reason: impl Into<String>) -> Self {
        DataNodeError::Link {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        DataNodeError::Protocol {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataNodeError>;
