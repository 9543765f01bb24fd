//! Core types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique key of an issued command.
///
/// Immutable once created; every history attribute and queue entry refers
/// back to the command through this identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandIdentity {
    /// Fully qualified command name (e.g. `/REFMDB/SUBSYS1/CRITICAL_TC1`)
    pub name: String,
    /// Sequence number assigned by the issuer
    pub sequence_number: u32,
    /// Origin of the command (client, script, host)
    pub origin: String,
    /// Generation time (Unix epoch milliseconds)
    pub generation_time_ms: u64,
}

impl CommandIdentity {
    /// Create a new identity stamped with the current wall-clock time
    pub fn new(name: impl Into<String>, sequence_number: u32, origin: impl Into<String>) -> Self {
        Self::at(name, sequence_number, origin, current_timestamp_ms())
    }

    /// Create an identity with an explicit generation time
    pub fn at(
        name: impl Into<String>,
        sequence_number: u32,
        origin: impl Into<String>,
        generation_time_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            sequence_number,
            origin: origin.into(),
            generation_time_ms,
        }
    }

    /// Short identifier for log lines: command name and sequence number
    pub fn logging_id(&self) -> String {
        format!("{}-{}", self.name, self.sequence_number)
    }
}

impl fmt::Display for CommandIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.generation_time_ms, self.origin, self.sequence_number, self.name
        )
    }
}

/// Significance (criticality) level attached to a command.
///
/// Variants are declared in increasing order of risk so that the derived
/// ordering can be used for queue thresholds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    /// No particular significance
    #[default]
    None,
    /// Watch level
    Watch,
    /// Warning level
    Warning,
    /// Distress level
    Distress,
    /// Critical level
    Critical,
    /// Severe level
    Severe,
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Significance::None => "NONE",
            Significance::Watch => "WATCH",
            Significance::Warning => "WARNING",
            Significance::Distress => "DISTRESS",
            Significance::Critical => "CRITICAL",
            Significance::Severe => "SEVERE",
        };
        f.write_str(s)
    }
}

/// Admission state of a command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Commands are released as soon as their constraints allow
    Enabled,
    /// Commands are held until released by an operator or the queue is enabled
    Blocked,
    /// Commands are rejected
    Disabled,
}

impl QueueState {
    /// Check if the state releases commands without operator action
    pub fn releases(&self) -> bool {
        matches!(self, QueueState::Enabled)
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueState::Enabled => "ENABLED",
            QueueState::Blocked => "BLOCKED",
            QueueState::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enabled" => Ok(QueueState::Enabled),
            "blocked" => Ok(QueueState::Blocked),
            "disabled" => Ok(QueueState::Disabled),
            other => Err(format!(
                "'{}' is not a valid queue state. Use one of enabled, disabled or blocked",
                other
            )),
        }
    }
}

/// Get current timestamp in milliseconds
///
/// Returns 0 if system time is before Unix epoch (should never happen in practice)
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
