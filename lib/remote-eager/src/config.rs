// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Execution context configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file named by `REMOTE_EAGER_CONFIG_PATH`
//! 3. Environment variables (`REMOTE_EAGER_*`), e.g.
//!    `REMOTE_EAGER_EXECUTION_MODE=async` or
//!    `REMOTE_EAGER_CONNECTION_CONNECT_TIMEOUT_MS=250`

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::error::RemoteError;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

impl From<ConfigError> for RemoteError {
    fn from(err: ConfigError) -> Self {
        RemoteError::Config(err.to_string())
    }
}

/// How the context runs enqueued calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Dispatch inline; `enqueue` returns once the call is terminal.
    #[default]
    Sync,
    /// Dispatch on the runtime; `enqueue` returns a pending handle.
    Async,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectionConfig {
    /// Bound on establishing one worker connection.
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Bound on one call once sent. None = wait for the worker.
    #[validate(range(min = 1))]
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            call_timeout_ms: None,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MembershipConfig {
    /// How long `update_server_def` waits for calls of the outgoing view.
    #[validate(range(min = 1))]
    pub quiesce_timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            quiesce_timeout_ms: 30_000,
        }
    }
}

impl MembershipConfig {
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HealthConfig {
    #[validate(range(min = 1))]
    pub check_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 1000,
        }
    }
}

impl HealthConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// Top-level configuration of an execution context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RemoteEagerConfig {
    #[validate(nested)]
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub membership: MembershipConfig,

    #[validate(nested)]
    #[serde(default)]
    pub health: HealthConfig,
}

impl RemoteEagerConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("REMOTE_EAGER_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(RemoteEagerConfig::default()))
            .merge(Toml::file(&config_path))
            // REMOTE_EAGER_EXECUTION_MODE
            .merge(
                Env::prefixed("REMOTE_EAGER_EXECUTION_")
                    .map(|k| format!("execution.{}", k.as_str().to_lowercase()).into()),
            )
            // REMOTE_EAGER_CONNECTION_CONNECT_TIMEOUT_MS, REMOTE_EAGER_CONNECTION_CALL_TIMEOUT_MS
            .merge(
                Env::prefixed("REMOTE_EAGER_CONNECTION_")
                    .map(|k| format!("connection.{}", k.as_str().to_lowercase()).into()),
            )
            // REMOTE_EAGER_MEMBERSHIP_QUIESCE_TIMEOUT_MS
            .merge(
                Env::prefixed("REMOTE_EAGER_MEMBERSHIP_")
                    .map(|k| format!("membership.{}", k.as_str().to_lowercase()).into()),
            )
            // REMOTE_EAGER_HEALTH_CHECK_TIMEOUT_MS
            .merge(
                Env::prefixed("REMOTE_EAGER_HEALTH_")
                    .map(|k| format!("health.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Load configuration with JSON overrides at highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    /// Defaults with the given execution mode.
    pub fn with_mode(mode: ExecutionMode) -> Self {
        let mut config = Self::default();
        config.execution.mode = mode;
        config
    }
}

impl Provider for RemoteEagerConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("RemoteEagerConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
