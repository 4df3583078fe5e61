// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loopback transport for tests and local wiring.
//!
//! Round-trips every message through the wire codec and feeds the decoded
//! metadata back into the owning node's arrival path, as a remote responder
//! would.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::TransportClient;
use crate::node::Node;
use crate::protocols::{Message, MessageMeta, Protocol};

/// Echoes one response per request back to the owning node.
#[derive(Clone)]
pub struct LoopbackClient {
    node: Node,
    delay: Duration,
    respond: bool,
}

impl LoopbackClient {
    /// Responds immediately.
    pub fn new(node: Node) -> Self {
        LoopbackClient {
            node,
            delay: Duration::ZERO,
            respond: true,
        }
    }

    /// Responds after `delay`.
    pub fn with_delay(node: Node, delay: Duration) -> Self {
        LoopbackClient {
            node,
            delay,
            respond: true,
        }
    }

    /// Accepts sends but never responds; waits against this client time out.
    pub fn silent(node: Node) -> Self {
        LoopbackClient {
            node,
            delay: Duration::ZERO,
            respond: false,
        }
    }

    fn dispatch(&self, message: &Message) -> anyhow::Result<()> {
        // exercise the real wire encoding both ways
        let wire = message.encode()?;
        let decoded = Message::decode(wire)?;
        if !self.respond {
            return Ok(());
        }
        let node = self.node.clone();
        let delay = self.delay;
        let meta = decoded.meta;
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            node.notify_message_arrival(&meta);
        });
        Ok(())
    }
}

#[async_trait]
impl TransportClient for LoopbackClient {
    async fn send_message(&self, message: &Message) -> anyhow::Result<()> {
        self.dispatch(message)
    }

    async fn send_parts(
        &self,
        meta: &MessageMeta,
        protocol: Protocol,
        body: Bytes,
    ) -> anyhow::Result<()> {
        let message = Message::new(meta.clone(), protocol, body);
        self.dispatch(&message)
    }
}
