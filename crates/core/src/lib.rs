//! Core functionality for the cmdflow command lifecycle engine.
//!
//! This crate provides the fundamental types shared by the history log and
//! the commanding engine: command identities, significance levels, queue
//! states, attribute values, configuration and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;
pub mod value;

pub use config::{
    BlockedPolicy, Config, HistoryConfig, LogFormat, LoggingConfig, NodeConfig, OverflowPolicy,
    QueueConfig,
};
pub use error::{CoreError, Result};
pub use types::{current_timestamp_ms, CommandIdentity, QueueState, Significance};
pub use value::Value;
