//! Wire frames exchanged between clients, DataNodes and the volume manager.
//!
//! Every frame is a bincode-encoded [`Frame`] preceded by a 4-byte
//! big-endian length.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{DataNodeError, Result};
use crate::register::NodeRegistration;
use crate::registry::StreamId;

/// Length prefix size in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Default cap on an encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Starts a replication stream for `chunk_id`. `downstream` lists the
    /// remaining replicas, nearest first.
    Open {
        chunk_id: u64,
        downstream: Vec<String>,
    },
    /// Stream accepted; later frames carry `stream_id`.
    Opened { stream_id: StreamId },
    Data {
        stream_id: StreamId,
        offset: u64,
        payload: Bytes,
    },
    /// Bytes at `offset..offset+len` are stored on this node and every
    /// replica behind it.
    Ack {
        stream_id: StreamId,
        offset: u64,
        len: u64,
    },
    Close { stream_id: StreamId },
    Closed { stream_id: StreamId, bytes: u64 },
    /// Ends the stream. `stream_id` is unset when the failure happened
    /// before an id was handed out.
    Error {
        stream_id: Option<StreamId>,
        reason: String,
    },
    HealthCheck,
    HealthAck { status: i32, used_gib: u64 },
    Register(NodeRegistration),
    RegisterAck { ret: i32 },
}

impl Frame {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open { .. } => "open",
            Frame::Opened { .. } => "opened",
            Frame::Data { .. } => "data",
            Frame::Ack { .. } => "ack",
            Frame::Close { .. } => "close",
            Frame::Closed { .. } => "closed",
            Frame::Error { .. } => "error",
            Frame::HealthCheck => "health_check",
            Frame::HealthAck { .. } => "health_ack",
            Frame::Register(_) => "register",
            Frame::RegisterAck { .. } => "register_ack",
        }
    }

    /// Encodes the frame with its length prefix.
    pub fn encode(&self, max_frame_bytes: u32) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| DataNodeError::protocol(format!("encode {}: {}", self.kind(), e)))?;
        if body.len() > max_frame_bytes as usize {
            return Err(DataNodeError::protocol(format!(
                "{} frame of {} bytes exceeds limit {}",
                self.kind(),
                body.len(),
                max_frame_bytes
            )));
        }
        let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        bincode::deserialize(body).map_err(|e| DataNodeError::protocol(format!("decode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_body_length() {
        let frame = Frame::Close { stream_id: 3 };
        let encoded = frame.encode(DEFAULT_MAX_FRAME_BYTES).unwrap();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - FRAME_PREFIX_SIZE);
        assert_eq!(Frame::decode(&encoded[FRAME_PREFIX_SIZE..]).unwrap(), frame);
    }

    #[test]
    fn test_data_frame_keeps_payload() {
        let frame = Frame::Data {
            stream_id: 1,
            offset: 4096,
            payload: Bytes::from_static(b"chunk bytes"),
        };
        let encoded = frame.encode(DEFAULT_MAX_FRAME_BYTES).unwrap();
        match Frame::decode(&encoded[FRAME_PREFIX_SIZE..]).unwrap() {
            Frame::Data { offset, payload, .. } => {
                assert_eq!(offset, 4096);
                assert_eq!(&payload[..], b"chunk bytes");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let frame = Frame::Data {
            stream_id: 1,
            offset: 0,
            payload: Bytes::from(vec![0u8; 128]),
        };
        assert!(matches!(
            frame.encode(64),
            Err(DataNodeError::Protocol { .. })
        ));
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        assert!(matches!(
            Frame::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(DataNodeError::Protocol { .. })
        ));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Frame::HealthCheck.kind(), "health_check");
        assert_eq!(Frame::RegisterAck { ret: 0 }.kind(), "register_ack");
    }
}
