// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for processes embedding the transfer engine.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `DYN_LOGGING_CONFIG_PATH` environment variable.
//!
//! Output is human readable by default. JSON lines can be enabled by setting
//! `DYN_LOGGING_JSONL` to `1`, and colors are turned off with
//! `DYN_SDK_DISABLE_ANSI_LOGGING`.
//!
//! Filters come from `DYN_LOG` or from the `log_filters` table of the TOML file:
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "dynamo_xfer::backends" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

use crate::config::env_is_truthy;

const DYN_LOG: &str = "DYN_LOG";
const DYN_LOGGING_CONFIG_PATH: &str = "DYN_LOGGING_CONFIG_PATH";
const DYN_LOGGING_JSONL: &str = "DYN_LOGGING_JSONL";
const DYN_SDK_DISABLE_ANSI_LOGGING: &str = "DYN_SDK_DISABLE_ANSI_LOGGING";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("nix".to_string(), "error".to_string())]),
        }
    }
}

/// Install the global subscriber. Only the first call has an effect.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = setup_logging() {
            eprintln!("Failed to initialize logging: {e:#}");
        }
    });
}

fn setup_logging() -> Result<()> {
    let filter = filters(load_config()?)?;

    if env_is_truthy(DYN_LOGGING_JSONL) {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_ansi(std::env::var(DYN_SDK_DISABLE_ANSI_LOGGING).is_err())
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    }
    Ok(())
}

fn filters(config: LoggingConfig) -> Result<EnvFilter> {
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(config.log_level.parse::<Directive>()?)
        .with_env_var(DYN_LOG)
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
    Ok(filter_layer)
}

fn load_config() -> Result<LoggingConfig> {
    let mut figment = Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
    if let Ok(path) = std::env::var(DYN_LOGGING_CONFIG_PATH) {
        figment = figment.merge(Toml::file(path));
    }
    Ok(figment.extract()?)
}
