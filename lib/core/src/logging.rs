// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Gradmesh logging bootstrap.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `GRADMESH_LOGGING_CONFIG_PATH`
//!      environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is
//! `READABLE`. `JSONL` can be enabled by setting the `GRADMESH_LOGGING_JSONL`
//! environment variable to `1`.
//!
//! Filters are comma-separated key-value pairs where the key is the crate or
//! module name and the value is the log level, either via the `GRADMESH_LOG`
//! environment variable or the `log_filters` key of the TOML file.
//!
//! Example:
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "gradmesh_core" = "debug"
//! "gradmesh_core::tracker" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Environment variable holding an EnvFilter directive string.
const ENV_LOG: &str = "GRADMESH_LOG";

/// Environment variable pointing at the optional logging TOML file.
const ENV_LOGGING_CONFIG_PATH: &str = "GRADMESH_LOGGING_CONFIG_PATH";

/// Environment variable enabling JSONL output.
const ENV_LOGGING_JSONL: &str = "GRADMESH_LOGGING_JSONL";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("rustls".to_string(), "error".to_string())]),
        }
    }
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(ENV_LOGGING_CONFIG_PATH) {
        figment = figment.merge(Toml::file(path));
    }
    figment.extract().unwrap_or_else(|err| {
        eprintln!("invalid logging configuration, using defaults: {err}");
        LoggingConfig::default()
    })
}

fn env_is_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("on")
    )
}

fn jsonl_logging_enabled() -> bool {
    env_is_truthy(ENV_LOGGING_JSONL)
}

/// Builds the filter from `GRADMESH_LOG` if set, otherwise from the loaded
/// configuration (`log_level` plus per-target `log_filters`).
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(directives) = std::env::var(ENV_LOG) {
        return EnvFilter::new(directives);
    }
    let mut directives = vec![config.log_level.clone()];
    for (target, level) in &config.log_filters {
        directives.push(format!("{target}={level}"));
    }
    EnvFilter::new(directives.join(","))
}

/// Initializes the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let config = load_config();
        let filter = build_filter(&config);
        let registry = tracing_subscriber::registry().with(filter);
        if jsonl_logging_enabled() {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .init();
        }
    });
}
