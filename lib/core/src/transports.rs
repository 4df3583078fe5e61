// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport seam of the control plane.
//!
//! Framing, retries and connection management live behind this trait in the
//! transport layer; [`crate::node::Node`] purely delegates.

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocols::{Message, MessageMeta, Protocol};

pub mod mock;

/// A client capable of dispatching one message to a remote peer.
///
/// Sends are fire-and-forget from the node's perspective: a transport error
/// is reported but retrying is the transport's (or its caller's) concern.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Dispatches a complete, already-assembled message.
    async fn send_message(&self, message: &Message) -> anyhow::Result<()>;

    /// Dispatches a message assembled from parts.
    async fn send_parts(
        &self,
        meta: &MessageMeta,
        protocol: Protocol,
        body: Bytes,
    ) -> anyhow::Result<()>;
}
