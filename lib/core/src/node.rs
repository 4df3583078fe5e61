// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster-member identity and request/response primitives.
//!
//! A [`Node`] owns its immutable identity, a [`MessageTracker`] for
//! correlating responses, and a forward-only bring-up state. Message bytes
//! travel through an injected [`TransportClient`]; the node never frames,
//! retries or manages connections.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::metrics::CoreMetrics;
use crate::protocols::{Message, MessageMeta, NodeRole, Protocol};
use crate::tracker::MessageTracker;
use crate::transports::TransportClient;

/// Identity of one cluster member. Immutable after node start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique id assigned at registration.
    pub node_id: String,
    /// Cluster-wide ordinal.
    pub rank_id: u32,
    pub role: NodeRole,
    /// Address the node's listener is bound to.
    pub ip: String,
    pub port: u16,
}

impl NodeInfo {
    /// Registers a fresh identity with a generated node id.
    pub fn new(role: NodeRole, rank_id: u32, ip: impl Into<String>, port: u16) -> Self {
        NodeInfo {
            node_id: Uuid::new_v4().to_string(),
            rank_id,
            role,
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} rank={} {}:{}",
            self.role, self.node_id, self.rank_id, self.ip, self.port
        )
    }
}

/// Bring-up state. Transitions are forward-only:
/// `Uninitialized -> Starting -> Ready`. A node that loses its connection is
/// an external reconnection concern, not modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Starting,
    Ready,
}

/// One process participating in the distributed control plane.
///
/// Cloning shares the identity, the tracker and the readiness gate.
#[derive(Clone)]
pub struct Node {
    info: NodeInfo,
    tracker: Arc<MessageTracker>,
    state_tx: watch::Sender<NodeState>,
    metrics: Option<CoreMetrics>,
}

impl Node {
    pub fn new(info: NodeInfo) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Uninitialized);
        Node {
            info,
            tracker: Arc::new(MessageTracker::new()),
            state_tx,
            metrics: None,
        }
    }

    /// Attaches a metrics counter set to the send/receive paths.
    pub fn with_metrics(mut self, metrics: CoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.info.node_id
    }

    pub fn rank_id(&self) -> u32 {
        self.info.rank_id
    }

    pub fn role(&self) -> NodeRole {
        self.info.role
    }

    pub fn bound_ip(&self) -> &str {
        &self.info.ip
    }

    pub fn bound_port(&self) -> u16 {
        self.info.port
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn state(&self) -> NodeState {
        *self.state_tx.borrow()
    }

    /// Marks the transport as connecting. Only valid from `Uninitialized`;
    /// any other state is left untouched.
    pub fn start_connecting(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == NodeState::Uninitialized {
                *state = NodeState::Starting;
                true
            } else {
                tracing::warn!(node_id = %self.info.node_id, ?state, "ignoring backwards state transition");
                false
            }
        });
    }

    /// Marks the node ready, waking every `wait_for_start` caller. Called by
    /// the external event that establishes the transport connection.
    pub fn mark_ready(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == NodeState::Ready {
                false
            } else {
                *state = NodeState::Ready;
                true
            }
        });
    }

    /// Suspends until the node is ready or `timeout` elapses.
    pub async fn wait_for_start(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        let result = match tokio::time::timeout(timeout, state_rx.wait_for(|s| *s == NodeState::Ready)).await {
            Ok(Ok(_)) => {
                tracing::info!(node_id = %self.info.node_id, "node started");
                true
            }
            Ok(Err(_)) | Err(_) => false,
        };
        result
    }

    /// Sends a message and suspends until its single expected response
    /// arrives or `timeout` elapses. The transport send is fire-and-forget:
    /// a send error is logged and surfaces as a timeout, no retry happens
    /// here.
    pub async fn send_message_sync(
        &self,
        client: &dyn TransportClient,
        message: &mut Message,
        timeout: Duration,
    ) -> bool {
        let request_id = self.register_request(&mut message.meta);
        if let Err(err) = client.send_message(message).await {
            tracing::warn!(error = %err, request_id, "transport send failed");
        }
        self.log_sent(request_id);
        self.wait(request_id, timeout).await
    }

    /// Parts-shaped variant of [`Node::send_message_sync`].
    pub async fn send_parts_sync(
        &self,
        client: &dyn TransportClient,
        meta: &mut MessageMeta,
        protocol: Protocol,
        body: Bytes,
        timeout: Duration,
    ) -> bool {
        let request_id = self.register_request(meta);
        if let Err(err) = client.send_parts(meta, protocol, body).await {
            tracing::warn!(error = %err, request_id, "transport send failed");
        }
        self.log_sent(request_id);
        self.wait(request_id, timeout).await
    }

    /// Sends without waiting and returns the request id. Completion is
    /// observed through [`Node::wait`] or an out-of-band path.
    pub async fn send_message_async(
        &self,
        client: &dyn TransportClient,
        meta: &mut MessageMeta,
        protocol: Protocol,
        body: Bytes,
    ) -> u64 {
        let request_id = self.register_request(meta);
        if let Err(err) = client.send_parts(meta, protocol, body).await {
            tracing::warn!(error = %err, request_id, "transport send failed");
        }
        self.log_sent(request_id);
        request_id
    }

    /// Suspends until all expected responses for `request_id` arrived or
    /// `timeout` elapsed; `false` on timeout.
    pub async fn wait(&self, request_id: u64, timeout: Duration) -> bool {
        let completed = self.tracker.wait(request_id, timeout).await;
        if !completed {
            if let Some(metrics) = &self.metrics {
                metrics.wait_timeouts.inc();
            }
        }
        completed
    }

    /// Response ingress path: records the arrival carried by `meta`.
    pub fn notify_message_arrival(&self, meta: &MessageMeta) {
        if let Some(metrics) = &self.metrics {
            metrics.responses_received.inc();
        }
        self.tracker.notify_message_arrival(meta.request_id);
    }

    /// Advisory probe, see [`MessageTracker::check_message_track`].
    pub fn check_message_track(&self, request_id: u64) -> bool {
        self.tracker.check_message_track(request_id)
    }

    fn register_request(&self, meta: &mut MessageMeta) -> u64 {
        let request_id = self.tracker.add_message_track(1);
        meta.request_id = request_id;
        if let Some(metrics) = &self.metrics {
            metrics.requests_sent.inc();
        }
        request_id
    }

    fn log_sent(&self, request_id: u64) {
        tracing::debug!(
            role = %self.info.role,
            node_id = %self.info.node_id,
            request_id,
            "sent request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::mock::LoopbackClient;
    use std::time::Instant;

    fn worker_node() -> Node {
        Node::new(NodeInfo::new(NodeRole::Worker, 0, "127.0.0.1", 9000))
    }

    fn request_meta(node: &Node) -> MessageMeta {
        MessageMeta::new(node.role(), node.node_id(), node.rank_id())
    }

    #[test]
    fn test_identity_accessors() {
        let node = Node::new(NodeInfo::new(NodeRole::Scheduler, 7, "10.0.0.1", 1234));
        assert_eq!(node.role(), NodeRole::Scheduler);
        assert_eq!(node.rank_id(), 7);
        assert_eq!(node.bound_ip(), "10.0.0.1");
        assert_eq!(node.bound_port(), 1234);
        assert!(!node.node_id().is_empty());
    }

    #[test]
    fn test_state_transitions_are_forward_only() {
        let node = worker_node();
        assert_eq!(node.state(), NodeState::Uninitialized);
        node.start_connecting();
        assert_eq!(node.state(), NodeState::Starting);
        node.mark_ready();
        assert_eq!(node.state(), NodeState::Ready);
        // no way back
        node.start_connecting();
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[tokio::test]
    async fn test_wait_for_start_times_out() {
        let node = worker_node();
        node.start_connecting();
        let started = Instant::now();
        assert!(!node.wait_for_start(Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_for_start_unblocks_on_ready() {
        let node = worker_node();
        node.start_connecting();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.wait_for_start(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        node.mark_ready();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_message_sync_round_trip() {
        let node = worker_node();
        let client = LoopbackClient::with_delay(node.clone(), Duration::from_millis(20));

        let mut message = Message::new(
            request_meta(&node),
            Protocol::Raw,
            Bytes::from_static(b"push gradients"),
        );
        assert!(
            node.send_message_sync(&client, &mut message, Duration::from_secs(5))
                .await
        );
        // the node stamped a real request id before dispatch
        assert_eq!(message.meta.request_id, 1);
    }

    #[tokio::test]
    async fn test_send_message_sync_times_out_without_responder() {
        let node = worker_node();
        let client = LoopbackClient::silent(node.clone());

        let mut message = Message::new(request_meta(&node), Protocol::Raw, Bytes::new());
        let started = Instant::now();
        assert!(
            !node
                .send_message_sync(&client, &mut message, Duration::from_secs(1))
                .await
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_message_async_then_wait() {
        let node = worker_node();
        let client = LoopbackClient::new(node.clone());

        let mut meta = request_meta(&node);
        let request_id = node
            .send_message_async(&client, &mut meta, Protocol::Protobuf, Bytes::new())
            .await;
        assert_eq!(meta.request_id, request_id);
        assert!(node.wait(request_id, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_request_ids_survive_reaping() {
        let node = worker_node();
        let client = LoopbackClient::silent(node.clone());

        let mut first = request_meta(&node);
        let first_id = node
            .send_message_async(&client, &mut first, Protocol::Raw, Bytes::new())
            .await;
        assert!(!node.wait(first_id, Duration::from_millis(50)).await);

        // ids keep increasing after the first entry was reaped
        let mut second = request_meta(&node);
        let second_id = node
            .send_message_async(&client, &mut second, Protocol::Raw, Bytes::new())
            .await;
        assert!(second_id > first_id);

        // a straggler response for the reaped id must not complete the new one
        node.notify_message_arrival(&first);
        assert!(!node.wait(second_id, Duration::from_millis(50)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_observe_sends_and_timeouts() {
        let registry = prometheus::Registry::new();
        let metrics = CoreMetrics::new(&registry).unwrap();
        let node = worker_node().with_metrics(metrics.clone());

        let responsive = LoopbackClient::new(node.clone());
        let mut message = Message::new(request_meta(&node), Protocol::Raw, Bytes::new());
        assert!(
            node.send_message_sync(&responsive, &mut message, Duration::from_secs(5))
                .await
        );

        let silent = LoopbackClient::silent(node.clone());
        let mut message = Message::new(request_meta(&node), Protocol::Raw, Bytes::new());
        assert!(
            !node
                .send_message_sync(&silent, &mut message, Duration::from_millis(50))
                .await
        );

        assert_eq!(metrics.requests_sent.get(), 2);
        assert_eq!(metrics.responses_received.get(), 1);
        assert_eq!(metrics.wait_timeouts.get(), 1);
    }
}
