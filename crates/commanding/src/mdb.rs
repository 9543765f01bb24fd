//! Mission database interface and command definitions

use crate::criteria::{Criteria, Literal};
use crate::error::MdbError;
use crate::telemetry::ContainerOccurrence;
use cmdflow_core::{Significance, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point a check window is measured from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAnchor {
    /// The instant the command was handed to the uplink
    #[default]
    CommandRelease,
    /// The instant the previous verifier stage resolved
    LastVerifier,
}

/// Interval during which a verifier may resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckWindow {
    /// Offset before which telemetry is ignored
    #[serde(default)]
    pub start_ms: u64,
    /// Offset at which the stage times out
    pub stop_ms: u64,
    /// Anchor of both offsets
    #[serde(default)]
    pub relative_to: WindowAnchor,
}

impl CheckWindow {
    /// Window anchored on the command release
    pub fn new(start_ms: u64, stop_ms: u64) -> Self {
        Self {
            start_ms,
            stop_ms,
            relative_to: WindowAnchor::CommandRelease,
        }
    }
}

/// Container name plus field equalities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPattern {
    /// Qualified container name
    pub name: String,
    /// Fields that must be present with these values
    #[serde(default)]
    pub fields: BTreeMap<String, Literal>,
}

impl ContainerPattern {
    /// Check whether an occurrence matches the pattern
    pub fn matches(&self, occurrence: &ContainerOccurrence) -> bool {
        occurrence.name == self.name
            && self.fields.iter().all(|(field, expected)| {
                occurrence
                    .fields
                    .get(field)
                    .and_then(|actual| actual.compare(&Value::from(expected)))
                    == Some(std::cmp::Ordering::Equal)
            })
    }
}

/// How a verifier decides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierKind {
    /// OK when a matching container is observed
    Container(ContainerPattern),
    /// OK/NOK when the expression becomes true/false
    Algorithm(Criteria),
}

/// A post-release verification stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierDefinition {
    /// Stage name, e.g. `Execution` or `Complete`
    pub stage: String,
    /// Decision rule
    pub check: VerifierKind,
    /// Check window
    pub window: CheckWindow,
}

/// A pre-transmission condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDefinition {
    /// Condition that must hold
    pub criteria: Criteria,
    /// Time allowed for the condition to become true; 0 checks once
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Result of preparing a command
#[derive(Debug, Clone)]
pub struct CommandPreparation {
    /// Qualified command name
    pub qualified_name: String,
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Significance level
    pub significance: Significance,
    /// Queue the definition routes the command to, if any
    pub queue: Option<String>,
    /// Argument assignments including defaults
    pub assignments: BTreeMap<String, Value>,
    /// Transmission constraints
    pub constraints: Vec<ConstraintDefinition>,
    /// Verifiers in declared order
    pub verifiers: Vec<VerifierDefinition>,
    /// Users allowed to send the command; empty means everyone
    pub privileged_users: Vec<String>,
}

/// Mission database collaborator
pub trait MissionDatabase: Send + Sync {
    /// Resolve a command name and arguments into a prepared command
    fn prepare(
        &self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<CommandPreparation, MdbError>;
}
