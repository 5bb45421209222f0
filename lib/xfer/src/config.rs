// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Agent and backend configuration.
//!
//! [`AgentConfig`] is loaded with figment from defaults overlaid with
//! `DYN_XFER_` environment variables. Backends can additionally be enabled
//! and tuned from the environment through [`BackendEnvConfig`]:
//!
//! - `DYN_XFER_BACKEND_POSIX=true` enables the POSIX backend with defaults
//! - `DYN_XFER_BACKEND_POSIX__SYNC_WRITES=1` sets one of its options
//! - `DYN_XFER_BACKEND_MEMCPY=off` keeps MEMCPY disabled even if options are set

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::backends::BackendParams;

const ENV_PREFIX: &str = "DYN_XFER_";
const BACKEND_ENV_PREFIX: &str = "DYN_XFER_BACKEND_";

/// Check if a string is truthy: "1", "true", "on", "yes" (case-insensitive).
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey: "0", "false", "off", "no" (case-insensitive).
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

/// Parse a string as a boolean value, returning an error if it is neither
/// truthy nor falsey.
pub fn parse_bool(val: &str) -> Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if is_falsey(val) {
        Ok(false)
    } else {
        bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

/// Returns `false` if the environment variable is unset or not truthy.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Agent configuration.
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
pub struct AgentConfig {
    /// Worker threads of the runtime the agent builds when it is not created
    /// inside an existing tokio runtime.
    /// Set with DYN_XFER_NUM_WORKERS.
    #[validate(range(min = 1))]
    #[builder(default = "2")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub num_workers: usize,

    /// Upper bound on blocking threads used by backends for I/O.
    /// Set with DYN_XFER_MAX_BLOCKING_THREADS.
    #[validate(range(min = 1))]
    #[builder(default = "16")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub max_blocking_threads: usize,

    /// Completion notifications pending longer than this are logged.
    /// Set with DYN_XFER_SLOW_TRANSFER_WARN_SECS.
    #[validate(range(min = 1))]
    #[builder(default = "60")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub slow_transfer_warn_secs: u64,

    /// Backends created when the agent is constructed, by type name, with
    /// their option overrides.
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub backends: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            max_blocking_threads: 16,
            slow_transfer_warn_secs: 60,
            backends: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AgentConfig::default()))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .filter(|k| !k.as_str().to_ascii_lowercase().starts_with("backend_")),
            )
    }

    /// Load the configuration from defaults and `DYN_XFER_` environment
    /// variables, including backends enabled through [`BackendEnvConfig`].
    pub fn from_settings() -> Result<AgentConfig> {
        let mut config: AgentConfig = Self::figment().extract()?;
        config.validate()?;

        let env_backends = BackendEnvConfig::from_env()?;
        for (name, params) in env_backends.backends() {
            let entry = config.backends.entry(name.to_string()).or_default();
            for (k, v) in params.iter() {
                entry.insert(k.to_string(), v.to_string());
            }
        }
        Ok(config)
    }

    /// Options for a configured backend as [`BackendParams`].
    pub fn backend_params(&self, backend: &str) -> Option<BackendParams> {
        self.backends
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(backend))
            .map(|(_, opts)| opts.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl AgentConfigBuilder {
    /// Build and validate the agent configuration
    pub fn build(&self) -> Result<AgentConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }

    /// Create a backend of this type at construction with default options.
    pub fn backend(&mut self, backend: impl Into<String>) -> &mut Self {
        self.backends
            .get_or_insert_with(BTreeMap::new)
            .entry(backend.into().to_uppercase())
            .or_default();
        self
    }
}

/// Backends enabled from the environment.
#[derive(Debug, Clone, Default)]
pub struct BackendEnvConfig {
    backends: BTreeMap<String, BackendParams>,
}

impl BackendEnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `DYN_XFER_BACKEND_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Parse backend settings from `(name, value)` pairs.
    ///
    /// # Errors
    /// Returns an error if an enable flag is not a valid boolean, or if an
    /// option variable has an empty backend or option name.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut enabled: BTreeMap<String, BackendParams> = BTreeMap::new();
        let mut disabled: BTreeSet<String> = BTreeSet::new();

        for (key, value) in vars {
            let Some(remainder) = key.strip_prefix(BACKEND_ENV_PREFIX) else {
                continue;
            };

            match remainder.split_once("__") {
                Some((backend, option)) => {
                    if backend.is_empty() || option.is_empty() {
                        bail!("Malformed backend option variable: {}", key);
                    }
                    enabled
                        .entry(backend.to_uppercase())
                        .or_default()
                        .set(option.to_lowercase(), value);
                }
                None => {
                    let backend = remainder.to_uppercase();
                    match parse_bool(&value) {
                        Ok(true) => {
                            enabled.entry(backend).or_default();
                        }
                        Ok(false) => {
                            disabled.insert(backend);
                        }
                        Err(e) => bail!("Invalid value for {}: {}", key, e),
                    }
                }
            }
        }

        for backend in &disabled {
            enabled.remove(backend);
        }

        Ok(Self { backends: enabled })
    }

    /// Enable a backend with default options.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backends.entry(backend.into().to_uppercase()).or_default();
        self
    }

    pub fn has_backend(&self, backend: &str) -> bool {
        self.backends.contains_key(&backend.to_uppercase())
    }

    pub fn params(&self, backend: &str) -> Option<&BackendParams> {
        self.backends.get(&backend.to_uppercase())
    }

    pub fn backends(&self) -> impl Iterator<Item = (&str, &BackendParams)> {
        self.backends.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Backends from `other` are added; options in `other` win.
    pub fn merge(mut self, other: BackendEnvConfig) -> Self {
        for (name, params) in other.backends {
            let merged = self.backends.remove(&name).unwrap_or_default().merged(&params);
            self.backends.insert(name, merged);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case("1", true)]
    #[case("TRUE", true)]
    #[case("on", true)]
    #[case("Yes", true)]
    #[case("0", false)]
    #[case("false", false)]
    #[case("OFF", false)]
    #[case("no", false)]
    fn test_parse_bool(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(parse_bool(input).unwrap(), expected);
    }

    #[rstest]
    #[case("maybe")]
    #[case("")]
    #[case("2")]
    fn test_parse_bool_rejects(#[case] input: &str) {
        assert!(parse_bool(input).is_err());
        assert!(!is_truthy(input));
        assert!(!is_falsey(input));
    }

    #[test]
    fn test_builder_defaults_and_validation() {
        let config = AgentConfig::builder().build().unwrap();
        assert_eq!(config, AgentConfig::default());

        let config = AgentConfig::builder()
            .num_workers(4)
            .backend("posix")
            .build()
            .unwrap();
        assert_eq!(config.num_workers, 4);
        assert!(config.backends.contains_key("POSIX"));
        assert_eq!(config.backend_params("Posix"), Some(BackendParams::new()));

        assert!(AgentConfig::builder().num_workers(0).build().is_err());
        assert!(AgentConfig::builder().max_blocking_threads(0).build().is_err());
    }

    #[test]
    fn test_backend_env_parsing() {
        let config = BackendEnvConfig::from_vars(vars(&[
            ("DYN_XFER_BACKEND_POSIX", "true"),
            ("DYN_XFER_BACKEND_POSIX__SYNC_WRITES", "1"),
            ("DYN_XFER_BACKEND_MEMCPY__MAX_INFLIGHT", "8"),
            ("DYN_XFER_BACKEND_GDS", "off"),
            ("DYN_XFER_BACKEND_GDS__BATCH", "4"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        assert!(config.has_backend("posix"));
        assert!(config.has_backend("MEMCPY"));
        assert!(!config.has_backend("GDS"));
        assert_eq!(
            config.params("POSIX").and_then(|p| p.get("sync_writes")),
            Some("1")
        );
        assert_eq!(
            config.params("memcpy").and_then(|p| p.get("max_inflight")),
            Some("8")
        );
    }

    #[test]
    fn test_backend_env_rejects_bad_values() {
        assert!(BackendEnvConfig::from_vars(vars(&[("DYN_XFER_BACKEND_POSIX", "maybe")])).is_err());
        assert!(BackendEnvConfig::from_vars(vars(&[("DYN_XFER_BACKEND___X", "1")])).is_err());
    }

    #[test]
    fn test_merge_backend_configs() {
        let a = BackendEnvConfig::new().with_backend("posix");
        let b = BackendEnvConfig::from_vars(vars(&[("DYN_XFER_BACKEND_POSIX__MAX_INFLIGHT", "2")]))
            .unwrap()
            .with_backend("memcpy");

        let merged = a.merge(b);
        assert!(merged.has_backend("MEMCPY"));
        assert_eq!(
            merged.params("POSIX").and_then(|p| p.get("max_inflight")),
            Some("2")
        );
    }

    #[test]
    fn test_from_settings_reads_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DYN_XFER_NUM_WORKERS", "3");
            jail.set_env("DYN_XFER_SLOW_TRANSFER_WARN_SECS", "5");
            jail.set_env("DYN_XFER_BACKEND_POSIX", "1");
            jail.set_env("DYN_XFER_BACKEND_POSIX__MAX_INFLIGHT", "4");

            let config = AgentConfig::from_settings().unwrap();
            assert_eq!(config.num_workers, 3);
            assert_eq!(config.slow_transfer_warn_secs, 5);
            assert_eq!(config.max_blocking_threads, 16);
            assert_eq!(
                config.backend_params("POSIX"),
                Some(BackendParams::new().with("max_inflight", "4"))
            );
            Ok(())
        });
    }

    #[test]
    fn test_from_settings_rejects_invalid() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DYN_XFER_NUM_WORKERS", "0");
            assert!(AgentConfig::from_settings().is_err());
            Ok(())
        });
    }
}
