use serde::{Deserialize, Serialize};

/// What `send` does while the connection is not open.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Drop immediately; `send` returns `false`.
    #[default]
    Off,
    /// Enqueue until full, then refuse new messages.
    DropNewest,
    /// Enqueue always, evicting the oldest message when full.
    DropOldest,
}

/// Reconnect policy for unexpected closes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Jitter factor: each delay is scaled uniformly within
    /// `1 ± jitter`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    300
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_queue_size() -> usize {
    64
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Client configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    #[serde(default)]
    pub queue: QueuePolicy,
    /// Bound for the `drop-newest` / `drop-oldest` policies.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Default deadline for `request` when the call has none.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: QueuePolicy::default(),
            queue_size: default_queue_size(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}
