//! Daemon configuration loaded from TOML.
//!
//! `SKILLTRACKD_CONFIG` names the file. When unset, or when the file cannot be
//! read or parsed, defaults are used and the problem is logged.

use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const CONFIG_ENV: &str = "SKILLTRACKD_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub assignments: AssignmentsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AssignmentsConfig {
    pub default_required_submissions: i64,
    pub page_size: i64,
}

impl Default for AssignmentsConfig {
    fn default() -> Self {
        Self {
            default_required_submissions: 1,
            page_size: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directives; `SKILLTRACKD_LOG` takes precedence.
    pub filter: Option<String>,
    /// "pretty" or "json"; `SKILLTRACKD_LOG_FORMAT` takes precedence.
    pub format: Option<String>,
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let display = path.to_string_lossy().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    parse_config(&text).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

pub fn parse_config(text: &str) -> Result<DaemonConfig, toml::de::Error> {
    toml::from_str::<DaemonConfig>(text)
}

/// Called before tracing is installed, so failures are returned for logging later.
pub fn load_config_from_env() -> (DaemonConfig, Option<ConfigError>) {
    let Ok(path) = std::env::var(CONFIG_ENV) else {
        return (DaemonConfig::default(), None);
    };
    match load_config(Path::new(&path)) {
        Ok(cfg) => (cfg, None),
        Err(e) => (DaemonConfig::default(), Some(e)),
    }
}

pub fn report_load(cfg_err: Option<&ConfigError>) {
    match cfg_err {
        Some(e) => error!(error = %e, "config not loaded; using defaults"),
        None => match std::env::var(CONFIG_ENV) {
            Ok(path) => info!(%path, "loaded config"),
            Err(_) => info!("no config file; using defaults"),
        },
    }
}
