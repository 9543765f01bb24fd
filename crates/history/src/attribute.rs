//! History attributes and acknowledgment keys

use cmdflow_core::{CommandIdentity, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One entry of a command's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAttribute {
    /// Command the attribute belongs to
    pub command_id: CommandIdentity,
    /// Attribute name (e.g. `AcknowledgeQueued_Status`)
    pub name: String,
    /// Attribute value
    pub value: Value,
    /// Wall-clock time of the append (Unix epoch milliseconds)
    pub timestamp_ms: u64,
}

/// Status of an acknowledgment or verification stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    /// Not applicable
    Na,
    /// Waiting for a result
    Pending,
    /// Succeeded
    Ok,
    /// Failed
    Nok,
    /// Check window or constraint timeout elapsed
    Timeout,
    /// Abandoned before a result was reached
    Cancelled,
    /// Disabled for this command
    Disabled,
}

impl AckStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Na => "NA",
            AckStatus::Pending => "PENDING",
            AckStatus::Ok => "OK",
            AckStatus::Nok => "NOK",
            AckStatus::Timeout => "TIMEOUT",
            AckStatus::Cancelled => "CANCELLED",
            AckStatus::Disabled => "DISABLED",
        }
    }

    /// Check if the status is final for its stage
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckStatus::Pending)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NA" => Ok(AckStatus::Na),
            "PENDING" => Ok(AckStatus::Pending),
            "OK" => Ok(AckStatus::Ok),
            "NOK" => Ok(AckStatus::Nok),
            "TIMEOUT" => Ok(AckStatus::Timeout),
            "CANCELLED" => Ok(AckStatus::Cancelled),
            "DISABLED" => Ok(AckStatus::Disabled),
            other => Err(format!("unknown ack status '{}'", other)),
        }
    }
}

/// Standard attribute keys written by the lifecycle
pub mod keys {
    /// Name of the queue the command was assigned to
    pub const QUEUE: &str = "Queue";
    /// Time of the last rebuild on release
    pub const REBUILT: &str = "Rebuilt";
    /// Admission to a queue
    pub const ACK_QUEUED: &str = "AcknowledgeQueued";
    /// Transmission constraint check
    pub const TRANSMISSION_CONSTRAINTS: &str = "TransmissionConstraints";
    /// Hand-off to the uplink
    pub const ACK_RELEASED: &str = "AcknowledgeReleased";
    /// Terminal disposition
    pub const COMMAND_COMPLETE: &str = "CommandComplete";
    /// Prefix of per-stage verifier keys
    pub const VERIFIER_PREFIX: &str = "Verifier_";

    /// Suffix of status attributes
    pub const STATUS_SUFFIX: &str = "_Status";
    /// Suffix of time attributes
    pub const TIME_SUFFIX: &str = "_Time";
    /// Suffix of message attributes
    pub const MESSAGE_SUFFIX: &str = "_Message";

    /// Key of a verifier stage, e.g. `Verifier_Execution`
    pub fn verifier(stage: &str) -> String {
        format!("{}{}", VERIFIER_PREFIX, stage)
    }

    /// `<key>_Status`
    pub fn status(key: &str) -> String {
        format!("{}{}", key, STATUS_SUFFIX)
    }

    /// `<key>_Time`
    pub fn time(key: &str) -> String {
        format!("{}{}", key, TIME_SUFFIX)
    }

    /// `<key>_Message`
    pub fn message(key: &str) -> String {
        format!("{}{}", key, MESSAGE_SUFFIX)
    }

    /// Check if an attribute name belongs to the standard stage sequence
    pub fn is_protected(name: &str) -> bool {
        if name == QUEUE || name == REBUILT {
            return true;
        }
        let base = [STATUS_SUFFIX, TIME_SUFFIX, MESSAGE_SUFFIX]
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix));
        match base {
            Some(base) => {
                [ACK_QUEUED, TRANSMISSION_CONSTRAINTS, ACK_RELEASED, COMMAND_COMPLETE]
                    .contains(&base)
                    || base.starts_with(VERIFIER_PREFIX)
            }
            None => false,
        }
    }
}
