use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{limits::LimitsConfig, rpc::RpcConfig};

/// Heartbeat expectations advertised to monitors.
///
/// The engine answers `__heartbeat` probes and records activity; it
/// never closes stale sockets itself. These values parameterize
/// whatever external monitor the host installs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

fn default_validate_outgoing() -> bool {
    true
}

/// Engine configuration. Every field has a serde default, so a partial
/// TOML file (or an empty one) yields a usable config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Validate outbound payloads (send/reply/publish) when a validator
    /// is installed.
    #[serde(default = "default_validate_outgoing")]
    pub validate_outgoing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rpc: RpcConfig::default(),
            validate_outgoing: true,
        }
    }
}

/// Errors loading a [`RouterConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RouterConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
