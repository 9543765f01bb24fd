//! Uplink collaborators

use crate::command::PreparedCommand;
use crate::error::UplinkError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::info;

/// Hands released commands to the link.
///
/// Success only means the command left the ground system; the effect is
/// confirmed later through telemetry by the verifiers.
pub trait Uplink: Send + Sync {
    /// Transmit a command
    fn send_tc(&self, command: &PreparedCommand) -> Result<(), UplinkError>;
}

/// Forwards released commands to a channel
pub struct ChannelUplink {
    tx: mpsc::UnboundedSender<PreparedCommand>,
}

impl ChannelUplink {
    /// Create the uplink and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PreparedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Uplink for ChannelUplink {
    fn send_tc(&self, command: &PreparedCommand) -> Result<(), UplinkError> {
        self.tx
            .send(command.clone())
            .map_err(|_| UplinkError::Unavailable("receiver dropped".to_string()))
    }
}

/// Logs every released command
#[derive(Default)]
pub struct LoggingUplink {
    sent: AtomicU64,
}

impl LoggingUplink {
    /// Create the uplink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands sent so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Uplink for LoggingUplink {
    fn send_tc(&self, command: &PreparedCommand) -> Result<(), UplinkError> {
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            command = %command.identity,
            bytes = command.payload.len(),
            total = count,
            "Command sent"
        );
        Ok(())
    }
}
