// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus counters for the control plane.

use prometheus::{IntCounter, Registry};

/// Metric names, prefixed per component hierarchy.
pub mod names {
    pub const REQUESTS_SENT: &str = "gradmesh_core_requests_sent_total";
    pub const RESPONSES_RECEIVED: &str = "gradmesh_core_responses_received_total";
    pub const WAIT_TIMEOUTS: &str = "gradmesh_core_wait_timeouts_total";
}

/// Counter set tracking the request/response exchange of one node.
///
/// Counters are shared handles; cloning the set observes the same series.
#[derive(Debug, Clone)]
pub struct CoreMetrics {
    pub requests_sent: IntCounter,
    pub responses_received: IntCounter,
    pub wait_timeouts: IntCounter,
}

impl CoreMetrics {
    /// Creates the counter set and registers it on the given registry.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.requests_sent.clone()))?;
        registry.register(Box::new(metrics.responses_received.clone()))?;
        registry.register(Box::new(metrics.wait_timeouts.clone()))?;
        Ok(metrics)
    }

    /// Creates the counter set without attaching it to a registry.
    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(CoreMetrics {
            requests_sent: IntCounter::new(
                names::REQUESTS_SENT,
                "Requests dispatched through a transport client",
            )?,
            responses_received: IntCounter::new(
                names::RESPONSES_RECEIVED,
                "Responses that reached the message tracker",
            )?,
            wait_timeouts: IntCounter::new(
                names::WAIT_TIMEOUTS,
                "Synchronous waits that expired before all responses arrived",
            )?,
        })
    }
}
