// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::collect::DEFAULT_SECTION_TIMEOUT;
use crate::inventory::DEFAULT_TOP_PROCESSES;

/// Upper bound for `section_timeout_secs`
pub const MAX_SECTION_TIMEOUT_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for crate::error::AccessError {
    fn from(err: ConfigError) -> Self {
        crate::error::AccessError::Configuration(err.to_string())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Stamped on every report; the host name when unset
    pub device_id: Option<String>,
    pub section_timeout_secs: u64,
    /// Applied to monitors started without their own maximum duration
    pub default_session_max_duration_secs: Option<u64>,
    pub audit_capacity: usize,
    pub top_processes: usize,
    pub log_level: LogLevel,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            section_timeout_secs: DEFAULT_SECTION_TIMEOUT.as_secs(),
            default_session_max_duration_secs: None,
            audit_capacity: 256,
            top_processes: DEFAULT_TOP_PROCESSES,
            log_level: LogLevel::Info,
        }
    }
}

impl AgentConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Config(format!("Cannot read {}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.section_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "section_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.section_timeout_secs > MAX_SECTION_TIMEOUT_SECS {
            return Err(ConfigError::Invalid {
                field: "section_timeout_secs",
                reason: format!("must be at most {}", MAX_SECTION_TIMEOUT_SECS),
            });
        }
        if self.default_session_max_duration_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "default_session_max_duration_secs",
                reason: "must be at least 1 when set".into(),
            });
        }
        if let Some(id) = &self.device_id {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "device_id",
                    reason: "must not be blank".into(),
                });
            }
        }
        Ok(())
    }

    /// Configured device id, falling back to the host name
    pub fn device_id(&self) -> String {
        if let Some(id) = &self.device_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown-device".to_string())
    }

    pub fn section_timeout(&self) -> Duration {
        Duration::from_secs(self.section_timeout_secs)
    }

    pub fn default_session_max_duration(&self) -> Option<Duration> {
        self.default_session_max_duration_secs.map(Duration::from_secs)
    }

    /// Generate sample config
    pub fn sample_toml() -> String {
        r#"# Privilege Gate Agent Configuration
# device_id = "workstation-042"
section_timeout_secs = 15
# default_session_max_duration_secs = 3600
audit_capacity = 256
top_processes = 10
log_level = "Info"
"#
        .into()
    }
}
