//! Configuration management for cmdflow.

use crate::error::CoreError;
use crate::types::{QueueState, Significance};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and collaborator paths
    pub node: NodeConfig,
    /// Logging setup
    #[serde(default)]
    pub logging: LoggingConfig,
    /// History log tuning
    #[serde(default)]
    pub history: HistoryConfig,
    /// Command queues, in selection order
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, used as the default command origin
    pub node_id: String,
    /// Path to the command dictionary TOML file
    #[serde(default)]
    pub dictionary_path: Option<PathBuf>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What to do with a subscriber whose buffer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered attribute
    #[default]
    DropOldest,
    /// Close the subscription
    Disconnect,
}

/// History log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum buffered attributes per subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Overflow policy for slow subscribers
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Optional SQLite database for the history store
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            overflow: OverflowPolicy::DropOldest,
            sqlite_path: None,
        }
    }
}

fn default_subscriber_buffer() -> usize {
    1024
}

/// Admission behavior of a BLOCKED queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockedPolicy {
    /// Hold commands until released
    #[default]
    Hold,
    /// Reject commands unless the issuer overrides the block
    Reject,
}

/// Command queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name
    pub name: String,
    /// Initial (and default) state
    #[serde(default = "default_queue_state")]
    pub state: QueueState,
    /// Minimum significance accepted by this queue
    #[serde(default)]
    pub min_level: Significance,
    /// Issuers matched by this queue; empty with empty `groups` matches everyone
    #[serde(default)]
    pub users: Vec<String>,
    /// Issuer groups matched by this queue
    #[serde(default)]
    pub groups: Vec<String>,
    /// Seconds after which a non-default state reverts to `state`
    #[serde(default)]
    pub state_expiration_secs: Option<u64>,
    /// Admission behavior while BLOCKED
    #[serde(default)]
    pub blocked_policy: BlockedPolicy,
}

fn default_queue_state() -> QueueState {
    QueueState::Enabled
}

impl QueueConfig {
    /// Create an open queue with the given name and state
    pub fn new(name: impl Into<String>, state: QueueState) -> Self {
        Self {
            name: name.into(),
            state,
            min_level: Significance::None,
            users: Vec::new(),
            groups: Vec::new(),
            state_expiration_secs: None,
            blocked_policy: BlockedPolicy::Hold,
        }
    }

    /// Check whether the queue accepts commands from this issuer
    pub fn matches_issuer(&self, user: &str, groups: &[String]) -> bool {
        if self.users.is_empty() && self.groups.is_empty() {
            return true;
        }
        self.users.iter().any(|u| u == user) || self.groups.iter().any(|g| groups.contains(g))
    }
}

impl Config {
    /// Load configuration from a TOML file
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Built-in configuration with a single enabled `default` queue
    pub fn default_config() -> Self {
        let mut config = Self {
            node: NodeConfig {
                node_id: "cmdflow-node".to_string(),
                dictionary_path: None,
            },
            logging: LoggingConfig::default(),
            history: HistoryConfig::default(),
            queues: Vec::new(),
        };
        config.apply_defaults();
        config
    }

    /// Insert the `default` queue when none is configured
    pub fn apply_defaults(&mut self) {
        if self.queues.is_empty() {
            self.queues
                .push(QueueConfig::new("default", QueueState::Enabled));
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.history.subscriber_buffer == 0 {
            return Err(CoreError::Config(
                "history.subscriber_buffer must be greater than 0".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(CoreError::Config("queue name must not be empty".to_string()));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate queue name '{}'",
                    queue.name
                )));
            }
            if queue.state_expiration_secs == Some(0) {
                return Err(CoreError::Config(format!(
                    "queue '{}': state_expiration_secs must be greater than 0",
                    queue.name
                )));
            }
        }
        Ok(())
    }
}
