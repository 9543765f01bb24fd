//! Commanding errors

use cmdflow_core::QueueState;
use cmdflow_history::HistoryError;
use thiserror::Error;

/// Errors raised by the mission database while preparing a command
#[derive(Debug, Error)]
pub enum MdbError {
    /// Unknown command or parameter
    #[error("Invalid identification: {0}")]
    InvalidIdentification(String),

    /// Argument missing, unknown, out of range or of the wrong type
    #[error("Argument validation failed for '{argument}': {reason}")]
    ArgumentValidation {
        /// Argument name
        argument: String,
        /// Human readable reason
        reason: String,
    },

    /// Payload could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Dictionary could not be loaded
    #[error("Dictionary load error: {0}")]
    Load(String),
}

/// Reasons a queue refuses a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Requested queue does not exist
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// No configured queue accepts the issuer and significance
    #[error("No matching queue")]
    NoMatchingQueue,

    /// Queue is disabled
    #[error("Queue disabled")]
    Disabled {
        /// Queue name
        queue: String,
    },

    /// Queue is blocked and rejects commands without override
    #[error("Queue blocked")]
    Blocked {
        /// Queue name
        queue: String,
    },

    /// A command with the same identity is already pending
    #[error("Command {0} is already pending")]
    DuplicateCommand(String),
}

impl AdmissionError {
    /// Queue resolved before the command was refused, if any
    pub fn queue(&self) -> Option<&str> {
        match self {
            AdmissionError::Disabled { queue } | AdmissionError::Blocked { queue } => Some(queue),
            AdmissionError::UnknownQueue(_)
            | AdmissionError::NoMatchingQueue
            | AdmissionError::DuplicateCommand(_) => None,
        }
    }
}

/// Errors raised by queue control operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue does not exist
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// Command is not pending in any queue
    #[error("Command {0} is not pending in any queue")]
    CommandNotFound(String),

    /// Command is pending but not held (its release is already in progress)
    #[error("Command {command} is not held in queue '{queue}'")]
    NotHeld {
        /// Command identity
        command: String,
        /// Queue name
        queue: String,
    },

    /// Requested state change is not allowed
    #[error("Queue '{queue}' cannot go to {state}")]
    InvalidState {
        /// Queue name
        queue: String,
        /// Requested state
        state: QueueState,
    },
}

/// Uplink failures
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Link is down or the receiving side went away
    #[error("Uplink unavailable: {0}")]
    Unavailable(String),

    /// Link rejected the command
    #[error("Uplink rejected command: {0}")]
    Rejected(String),
}

/// Top-level error returned by the commanding service
#[derive(Debug, Error)]
pub enum CommandingError {
    /// Command could not be prepared
    #[error(transparent)]
    Mdb(#[from] MdbError),

    /// Issuer may not send this command
    #[error("Permission denied: {user} may not send {command}")]
    PermissionDenied {
        /// Issuer
        user: String,
        /// Command name
        command: String,
    },

    /// Command was refused by the queue manager
    #[error("Command rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// Queue control operation failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// History log failure
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Service is shutting down
    #[error("Commanding service stopped")]
    Stopped,
}

/// Failures inside a command lifecycle task; they never leave the task
#[derive(Debug, Error)]
pub(crate) enum LifecycleError {
    /// History write failed
    #[error(transparent)]
    History(#[from] HistoryError),
}
