//! Core error types

use thiserror::Error;

/// Core error type for cmdflow
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result alias used across the core crate
pub type Result<T> = std::result::Result<T, CoreError>;
