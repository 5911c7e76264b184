// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Values are layered in priority order, highest last:
//! 1. Defaults
//! 2. YAML file (the `--config` path, when given)
//! 3. Environment variables prefixed `SIEM_AGENT_`, with `__` separating the section from
//!    the key (`SIEM_AGENT_SENDER__ENDPOINT=https://siem.internal/api`)
//!
//! ```yaml
//! shutdown_timeout_secs: 30
//! collector:
//!   paths: ["/var/log/auth.log", "/var/log/syslog"]
//!   syslog_udp_bind: "0.0.0.0:5514"
//! processor:
//!   processing_rules:
//!     - type: exclude_at_match
//!       name: drop_cron
//!       pattern: "CRON\\["
//! sender:
//!   endpoint: "https://siem.internal/api"
//!   api_key: "..."
//! monitor:
//!   heartbeat_url: "https://siem.internal/api"
//! ```
//!
//! Loading only parses. Each section is validated by the stage built from it, so a bad
//! section surfaces as a construction error of that stage.

pub mod processing_rule;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use processing_rule::{deserialize_processing_rules, ProcessingRule};

pub const ENV_PREFIX: &str = "SIEM_AGENT_";

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("configuration file {} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid {section} configuration: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            section,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct AgentConfig {
    /// Budget for the whole shutdown sequence.
    pub shutdown_timeout_secs: u64,
    pub collector: CollectorConfig,
    pub processor: ProcessorConfig,
    pub sender: SenderConfig,
    pub monitor: MonitorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 30,
            collector: CollectorConfig::default(),
            processor: ProcessorConfig::default(),
            sender: SenderConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl AgentConfig {
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Checks the agent-wide settings. Each section is validated by the stage it configures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "agent",
                "shutdown_timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Loads the configuration from defaults, the optional YAML file and the environment.
///
/// A path that was given but does not exist is an error; a missing path means defaults
/// and environment only.
pub fn load(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        figment = figment.merge(Yaml::file(path));
    }

    let config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<AgentConfig>()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct CollectorConfig {
    /// Files to tail.
    pub paths: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    /// Read existing content on start instead of only new lines.
    pub read_from_start: bool,
    /// Address to receive syslog datagrams on, e.g. `0.0.0.0:5514`.
    pub syslog_udp_bind: Option<String>,
    /// Longer lines are truncated.
    pub max_line_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            poll_interval_ms: 500,
            read_from_start: false,
            syslog_udp_bind: None,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl CollectorConfig {
    /// Checks the section and returns the parsed syslog bind address, if any.
    pub fn validate(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "collector",
                "poll_interval_ms must be greater than zero",
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::invalid(
                "collector",
                "max_line_bytes must be greater than zero",
            ));
        }
        if self.paths.is_empty() && self.syslog_udp_bind.is_none() {
            return Err(ConfigError::invalid(
                "collector",
                "no input configured, set paths or syslog_udp_bind",
            ));
        }
        self.syslog_udp_bind
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::invalid("collector", format!("syslog_udp_bind '{addr}': {e}"))
                })
            })
            .transpose()
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct ProcessorConfig {
    #[serde(deserialize_with = "deserialize_processing_rules")]
    pub processing_rules: Option<Vec<ProcessingRule>>,
    /// Host name stamped on events. Resolved from the system when unset.
    pub hostname: Option<String>,
    /// Capacity of the processor's input queue.
    pub channel_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processing_rules: None,
            hostname: None,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct SenderConfig {
    /// Base URL of the SIEM backend.
    pub endpoint: String,
    pub events_path: String,
    pub health_path: String,
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub timeout_secs: u64,
    /// Attempts per batch, including the first one.
    pub retry_count: u32,
    pub use_compression: bool,
    pub compression_level: i32,
    /// Probe the backend health endpoint during start.
    pub verify_on_start: bool,
    /// Capacity of the sender's input queue.
    pub channel_capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
            events_path: "/alerts".to_string(),
            health_path: "/health".to_string(),
            api_key: None,
            batch_size: 100,
            flush_interval_secs: 5,
            timeout_secs: 10,
            retry_count: 3,
            use_compression: false,
            compression_level: 3,
            verify_on_start: true,
            channel_capacity: 1024,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "sender",
                format!("endpoint '{endpoint}' must be an http(s) URL"),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("sender", "batch_size must be greater than zero"));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "sender",
                "flush_interval_secs must be greater than zero",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid("sender", "timeout_secs must be greater than zero"));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::invalid("sender", "retry_count must be at least 1"));
        }
        if self.use_compression && !zstd::compression_level_range().contains(&self.compression_level)
        {
            return Err(ConfigError::invalid(
                "sender",
                format!("compression_level {} is out of range", self.compression_level),
            ));
        }
        Ok(())
    }

    /// `endpoint` joined with `path`, without doubled slashes.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Base URL for heartbeats; heartbeats are disabled when unset.
    pub heartbeat_url: Option<String>,
    /// Resident set size above which a warning is logged.
    pub max_rss_mb: Option<u64>,
    pub timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            heartbeat_url: None,
            max_rss_mb: None,
            timeout_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "monitor",
                "interval_secs must be greater than zero",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "monitor",
                "timeout_secs must be greater than zero",
            ));
        }
        if let Some(url) = &self.heartbeat_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::invalid(
                    "monitor",
                    format!("heartbeat_url '{url}' must be an http(s) URL"),
                ));
            }
        }
        Ok(())
    }
}
