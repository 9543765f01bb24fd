//! Prepared commands and issue options

use crate::mdb::{CheckWindow, ConstraintDefinition, VerifierDefinition};
use cmdflow_core::{CommandIdentity, Significance, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-stage verifier override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifierOverride {
    /// Do not run the stage
    #[serde(default)]
    pub disable: bool,
    /// Replace the stage's check window
    #[serde(default)]
    pub window: Option<CheckWindow>,
}

/// Who issues a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuer {
    /// User name
    pub user: String,
    /// Groups the user belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Issuer {
    /// Issuer without groups
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            groups: Vec::new(),
        }
    }
}

impl Default for Issuer {
    fn default() -> Self {
        Self::user("anonymous")
    }
}

/// Options supplied with `issue_command`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Skip transmission constraints (recorded as NA)
    #[serde(default)]
    pub disable_transmission_constraints: bool,
    /// Skip every verifier
    #[serde(default)]
    pub disable_all_verifiers: bool,
    /// Per-stage overrides keyed by stage name
    #[serde(default)]
    pub verifier_overrides: BTreeMap<String, VerifierOverride>,
    /// Admit to a BLOCKED queue whose policy is to reject
    #[serde(default)]
    pub override_block: bool,
    /// Target queue, overriding dictionary routing and issuer matching
    #[serde(default)]
    pub queue: Option<String>,
    /// Free-text comment recorded in the history
    #[serde(default)]
    pub comment: Option<String>,
    /// Issuer
    #[serde(default)]
    pub issuer: Issuer,
}

impl CommandOptions {
    /// Disable a single verifier stage
    pub fn disable_verifier(mut self, stage: impl Into<String>) -> Self {
        self.verifier_overrides.entry(stage.into()).or_default().disable = true;
        self
    }

    /// Replace the check window of a verifier stage
    pub fn verifier_window(mut self, stage: impl Into<String>, window: CheckWindow) -> Self {
        self.verifier_overrides.entry(stage.into()).or_default().window = Some(window);
        self
    }

    /// Issue as the given user
    pub fn issued_by(mut self, issuer: Issuer) -> Self {
        self.issuer = issuer;
        self
    }
}

/// A command ready for queueing.
///
/// Created once at submission; only a rebuild on release replaces the
/// payload and significance and refreshes the preparation time.
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    /// Unique identity
    pub identity: CommandIdentity,
    /// Encoded payload handed to the uplink
    pub payload: Vec<u8>,
    /// When the payload was last prepared, ms since the Unix epoch
    pub prepared_at_ms: u64,
    /// Significance level
    pub significance: Significance,
    /// Assigned queue
    pub queue: String,
    /// Argument assignments including defaults
    pub arguments: BTreeMap<String, Value>,
    /// Transmission constraints
    pub constraints: Vec<ConstraintDefinition>,
    /// Verifiers in declared order
    pub verifiers: Vec<VerifierDefinition>,
    /// Issue options
    pub options: CommandOptions,
}

impl PreparedCommand {
    /// Check if a constraint check must run before release
    pub fn has_active_constraints(&self) -> bool {
        !self.constraints.is_empty() && !self.options.disable_transmission_constraints
    }
}
