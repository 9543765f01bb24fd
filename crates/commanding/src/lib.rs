//! Command lifecycle engine for cmdflow.
//!
//! Takes prepared commands through queueing, transmission constraints,
//! uplink and post-release verification, recording every transition in the
//! [`cmdflow_history::HistoryLog`]. The [`Commanding`] service is the entry
//! point; mission database, uplink and telemetry are collaborators behind
//! the [`MissionDatabase`], [`Uplink`] and [`TelemetryFeed`] traits.

#![warn(missing_docs)]

pub mod command;
pub mod constraint;
pub mod criteria;
pub mod dictionary;
pub mod error;
pub mod lifecycle;
pub mod mdb;
pub mod queue;
pub mod service;
pub mod telemetry;
pub mod uplink;
pub mod verifier;

pub use command::{CommandOptions, Issuer, PreparedCommand, VerifierOverride};
pub use constraint::{ConstraintChecker, ConstraintStatus};
pub use criteria::{CompareOp, Criteria, EvalContext, Literal, Operand};
pub use dictionary::{ArgumentDefinition, ArgumentType, CommandDefinition, CommandDictionary};
pub use error::{AdmissionError, CommandingError, MdbError, QueueError, UplinkError};
pub use lifecycle::{LifecycleStage, CONSTRAINTS_FAILED, HISTORY_UNAVAILABLE};
pub use mdb::{
    CheckWindow, CommandPreparation, ConstraintDefinition, ContainerPattern, MissionDatabase,
    VerifierDefinition, VerifierKind, WindowAnchor,
};
pub use queue::{QueueEvent, QueueInfo};
pub use service::{Commanding, COMMENT_ATTRIBUTE};
pub use telemetry::{
    ContainerOccurrence, ParameterValue, SubscriptionGuard, TelemetryBus, TelemetryEvent,
    TelemetryFeed, TelemetryKey,
};
pub use uplink::{ChannelUplink, LoggingUplink, Uplink};
pub use verifier::{Completion, VerifierEngine, VerifierStatus};
