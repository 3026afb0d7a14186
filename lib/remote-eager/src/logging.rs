// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `REMOTE_EAGER_LOGGING_CONFIG_PATH` environment variable.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `REMOTE_EAGER_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters can be configured using the `REMOTE_EAGER_LOG` environment variable or by setting
//! the `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "remote_eager::pool" = "debug"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "REMOTE_EAGER_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "REMOTE_EAGER_LOGGING_CONFIG_PATH";

/// ENV used to switch to JSON lines output
const JSONL_ENV: &str = "REMOTE_EAGER_LOGGING_JSONL";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("tokio_util".to_string(), "error".to_string())]),
        }
    }
}

/// Initialize the logger. Subsequent calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn jsonl_logging_enabled() -> bool {
    std::env::var(JSONL_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        // try_init: an embedding process may already own the global subscriber.
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| tracing::level_filters::LevelFilter::INFO.into());

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Ignoring invalid logging configuration: {e}");
        LoggingConfig::default()
    })
}
