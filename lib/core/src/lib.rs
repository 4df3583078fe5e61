// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gradmesh core
//!
//! Control-plane coordination for a distributed parameter-server cluster:
//! request/response correlation ([`MessageTracker`]), node identity and
//! send primitives ([`Node`]), TLS bootstrap for the control listener
//! ([`tls::TlsContext`]) and cross-process kernel-build coordination
//! ([`KernelPool`]). Transports are injected collaborators; this crate does
//! not implement framing, retries or connection management.

#![allow(dead_code)]

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

mod config;
pub use config::{CoreConfig, KernelPoolConfig, TlsConfig};

pub mod kernel_pool;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod protocols;
pub mod tls;
pub mod tracker;
pub mod transports;

pub use kernel_pool::{KernelPool, PoolError};
pub use metrics::CoreMetrics;
pub use node::{Node, NodeInfo, NodeState};
pub use protocols::{Message, MessageMeta, NodeRole, Protocol};
pub use tracker::MessageTracker;
pub use transports::TransportClient;
