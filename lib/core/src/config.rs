// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Environment variable pointing at the optional TOML configuration file.
pub const ENV_CONFIG_PATH: &str = "GRADMESH_CONFIG";

/// Default timeout for a synchronous message exchange, in seconds.
const DEFAULT_MESSAGE_TIMEOUT_SECS: u64 = 300;

/// Default timeout for waiting on node start-up, in seconds.
const DEFAULT_START_TIMEOUT_SECS: u64 = 30;

/// Default capacity of the shared kernel-build pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Well-known file name of the shared kernel-build pool region.
pub const POOL_FILE_NAME: &str = "kernel_build.pool";

const DEFAULT_POOL_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_POOL_WAIT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_POOL_LOCK_ATTEMPTS: u32 = 200;
const DEFAULT_POOL_LOCK_BACKOFF_MS: u64 = 10;

/// Core coordination configuration.
///
/// Loaded from defaults, then the optional TOML file pointed to by
/// `GRADMESH_CONFIG`, then `GRADMESH_*` environment variables (highest
/// priority).
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone)]
pub struct CoreConfig {
    /// Timeout for a synchronous message exchange, in seconds.
    /// Set at runtime with environment variable GRADMESH_MESSAGE_TIMEOUT_SECS.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_MESSAGE_TIMEOUT_SECS")]
    pub message_timeout_secs: u64,

    /// Timeout for waiting on node start-up, in seconds.
    /// Set at runtime with environment variable GRADMESH_START_TIMEOUT_SECS.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_START_TIMEOUT_SECS")]
    pub start_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            message_timeout_secs: DEFAULT_MESSAGE_TIMEOUT_SECS,
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Reads configuration from the appropriate sources and validates it.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment.merge(Env::prefixed("GRADMESH_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

impl fmt::Display for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message_timeout_secs={}, ", self.message_timeout_secs)?;
        write!(f, "start_timeout_secs={}", self.start_timeout_secs)
    }
}

/// TLS bootstrap configuration for the control-plane listener.
///
/// All keys are required; there are no defaults. A missing key fails
/// extraction, and the caller treats that as fatal: a control plane must
/// not come up without verified TLS.
#[derive(Serialize, Deserialize, Validate, Clone)]
pub struct TlsConfig {
    /// Path of the password-protected PKCS12 certificate bundle.
    /// Set at runtime with environment variable GRADMESH_TLS_SERVER_CERT_PATH
    /// or the `server_cert_path` key of the `[tls]` table.
    pub server_cert_path: String,

    /// Password protecting the PKCS12 bundle. Must not be empty.
    pub server_password: String,

    /// Explicit list of permitted cipher suites. Implicit defaults are not
    /// permitted; an empty list fails bootstrap.
    #[validate(length(min = 1))]
    pub cipher_list: Vec<String>,
}

impl TlsConfig {
    /// Reads the `[tls]` table of the configuration file plus
    /// `GRADMESH_TLS_*` environment variables. Any missing key is an error.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::new();
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            figment = figment.merge(Toml::file(path)).focus("tls");
        }
        let config: Self = figment.merge(Env::prefixed("GRADMESH_TLS_")).extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_cert_path", &self.server_cert_path)
            .field("server_password", &"<redacted>")
            .field("cipher_list", &self.cipher_list)
            .finish()
    }
}

/// Shared kernel-build pool configuration.
#[derive(Serialize, Deserialize, Validate, Debug, Clone)]
pub struct KernelPoolConfig {
    /// Directory holding the well-known pool region file.
    pub dir: PathBuf,

    /// Maximum number of kernels the shared region can track. All attached
    /// processes must agree on this value.
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// Interval between completion polls, in milliseconds.
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Hard budget for waiting on other builders, in seconds.
    #[validate(range(min = 1))]
    pub wait_timeout_secs: u64,

    /// Bounded try-lock attempts before reporting the lock as busy.
    #[validate(range(min = 1))]
    pub lock_attempts: u32,

    /// Backoff between try-lock attempts, in milliseconds.
    pub lock_backoff_ms: u64,
}

impl Default for KernelPoolConfig {
    fn default() -> Self {
        KernelPoolConfig {
            dir: PathBuf::from("."),
            capacity: DEFAULT_POOL_CAPACITY,
            poll_interval_ms: DEFAULT_POOL_POLL_INTERVAL_MS,
            wait_timeout_secs: DEFAULT_POOL_WAIT_TIMEOUT_SECS,
            lock_attempts: DEFAULT_POOL_LOCK_ATTEMPTS,
            lock_backoff_ms: DEFAULT_POOL_LOCK_BACKOFF_MS,
        }
    }
}

impl KernelPoolConfig {
    /// Reads the `[kernel_pool]` table of the configuration file plus
    /// `GRADMESH_POOL_*` environment variables.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            figment = figment.merge(Toml::file(path)).focus("kernel_pool");
        }
        let config: Self = figment.merge(Env::prefixed("GRADMESH_POOL_")).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Full path of the shared region file.
    pub fn pool_path(&self) -> PathBuf {
        self.dir.join(POOL_FILE_NAME)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }
}
