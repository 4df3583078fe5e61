// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane wire metadata and frame format.
//!
//! - **Fixed 10-byte header**: version, protocol tag, metadata length, body length
//! - **Versioned**: protocol evolution support
//! - **Metadata section**: JSON-encoded [`MessageMeta`] (request id + sender identity)
//!
//! Transports remain external collaborators; this module only defines the
//! encoding they share.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame protocol version
pub const FRAME_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const FRAME_HEADER_SIZE: usize = 10;

/// Role of a node in the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Worker,
    Server,
    Scheduler,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Server => write!(f, "server"),
            NodeRole::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// Encoding of a message body. The core never inspects the body; the tag
/// travels with the frame so the receiving side can dispatch decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Raw,
    Protobuf,
    Flatbuffers,
}

impl Protocol {
    fn to_wire(self) -> u8 {
        match self {
            Protocol::Raw => 0,
            Protocol::Protobuf => 1,
            Protocol::Flatbuffers => 2,
        }
    }

    fn from_wire(tag: u8) -> Result<Self, FrameError> {
        match tag {
            0 => Ok(Protocol::Raw),
            1 => Ok(Protocol::Protobuf),
            2 => Ok(Protocol::Flatbuffers),
            other => Err(FrameError::UnknownProtocol(other)),
        }
    }
}

/// Wire metadata stamped onto every request by the sending node and read
/// back by the message tracker on response arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Correlation token; 0 until the sending node stamps it.
    pub request_id: u64,
    /// Sender role, embedded for log diagnosis on the receiving side.
    pub role: NodeRole,
    /// Sender node id.
    pub node_id: String,
    /// Sender cluster-wide ordinal.
    pub rank_id: u32,
}

impl MessageMeta {
    pub fn new(role: NodeRole, node_id: impl Into<String>, rank_id: u32) -> Self {
        MessageMeta {
            request_id: 0,
            role,
            node_id: node_id.into(),
            rank_id,
        }
    }
}

/// A complete control-plane message: metadata, body encoding tag, body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub meta: MessageMeta,
    pub protocol: Protocol,
    pub body: Bytes,
}

impl Message {
    pub fn new(meta: MessageMeta, protocol: Protocol, body: Bytes) -> Self {
        Message {
            meta,
            protocol,
            body,
        }
    }
}

/// Frame encoding/decoding errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Incomplete frame header: expected {FRAME_HEADER_SIZE} bytes, got {0} bytes")]
    IncompleteHeader(usize),

    #[error("Incomplete frame payload: expected {expected} bytes, got {available} bytes")]
    IncompletePayload { expected: usize, available: usize },

    #[error("Unsupported frame version: {0} (expected {FRAME_VERSION})")]
    UnsupportedVersion(u8),

    #[error("Unknown protocol tag: {0}")]
    UnknownProtocol(u8),

    #[error("Error decoding metadata: {0}")]
    MetaDecode(#[from] serde_json::Error),
}

impl Message {
    /// Encode to wire format.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let meta = serde_json::to_vec(&self.meta)?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + meta.len() + self.body.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.protocol.to_wire());
        buf.put_u32(meta.len() as u32);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&meta);
        buf.put(self.body.clone());
        Ok(buf.freeze())
    }

    /// Decode from wire format.
    pub fn decode(mut buf: impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(FrameError::IncompleteHeader(buf.remaining()));
        }
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let protocol = Protocol::from_wire(buf.get_u8())?;
        let meta_len = buf.get_u32() as usize;
        let body_len = buf.get_u32() as usize;

        if buf.remaining() < meta_len + body_len {
            return Err(FrameError::IncompletePayload {
                expected: meta_len + body_len,
                available: buf.remaining(),
            });
        }
        let meta_bytes = buf.copy_to_bytes(meta_len);
        let meta: MessageMeta = serde_json::from_slice(&meta_bytes)?;
        let body = buf.copy_to_bytes(body_len);

        Ok(Message {
            meta,
            protocol,
            body,
        })
    }

    /// Total encoded size.
    pub fn encoded_size(&self) -> Result<usize, FrameError> {
        let meta = serde_json::to_vec(&self.meta)?;
        Ok(FRAME_HEADER_SIZE + meta.len() + self.body.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut meta = MessageMeta::new(NodeRole::Worker, "node-a", 3);
        meta.request_id = 42;
        Message::new(meta, Protocol::Raw, Bytes::from_static(b"pull weights"))
    }

    #[test]
    fn test_round_trip_preserves_meta_and_body() {
        let message = sample_message();
        let wire = message.encode().unwrap();
        assert_eq!(wire.len(), message.encoded_size().unwrap());

        let decoded = Message::decode(wire).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.meta.request_id, 42);
        assert_eq!(decoded.meta.role, NodeRole::Worker);
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut wire = BytesMut::from(&sample_message().encode().unwrap()[..]);
        wire[0] = 9;
        let err = Message::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_rejects_unknown_protocol_tag() {
        let mut wire = BytesMut::from(&sample_message().encode().unwrap()[..]);
        wire[1] = 200;
        let err = Message::decode(wire.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownProtocol(200)));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let wire = sample_message().encode().unwrap();
        let truncated = wire.slice(..wire.len() - 4);
        let err = Message::decode(truncated).unwrap_err();
        assert!(matches!(err, FrameError::IncompletePayload { .. }));
    }

    #[test]
    fn test_rejects_short_header() {
        let err = Message::decode(Bytes::from_static(&[1, 0, 0])).unwrap_err();
        assert!(matches!(err, FrameError::IncompleteHeader(3)));
    }
}
