//! Transmission constraint checking
//!
//! The checker is a plain state machine driven by the lifecycle task: it is
//! re-evaluated on every update of a referenced parameter and when its
//! deadline passes. Each constraint latches once satisfied; the aggregate
//! leaves PENDING exactly once.

use crate::command::PreparedCommand;
use crate::criteria::EvalContext;
use crate::mdb::ConstraintDefinition;
use crate::telemetry::{ParameterValue, TelemetryFeed, TelemetryKey};
use cmdflow_core::Value;
use cmdflow_history::AckStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// Aggregate state of a command's transmission constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintStatus {
    /// No constraint configured, or constraints disabled
    Na,
    /// Waiting for the condition to hold
    Pending,
    /// Every constraint was satisfied
    Ok,
    /// A constraint expired unsatisfied
    Nok,
}

impl ConstraintStatus {
    /// Check if the status is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConstraintStatus::Pending)
    }

    /// History representation
    pub fn ack_status(&self) -> AckStatus {
        match self {
            ConstraintStatus::Na => AckStatus::Na,
            ConstraintStatus::Pending => AckStatus::Pending,
            ConstraintStatus::Ok => AckStatus::Ok,
            ConstraintStatus::Nok => AckStatus::Nok,
        }
    }
}

struct ConstraintSlot {
    definition: ConstraintDefinition,
    expires_at: Instant,
    satisfied: bool,
}

/// Evaluates the constraints of one command
pub struct ConstraintChecker {
    slots: Vec<ConstraintSlot>,
    status: ConstraintStatus,
}

impl ConstraintChecker {
    /// Build a checker for a command; timeouts start counting at `started_at`
    pub fn for_command(command: &PreparedCommand, started_at: Instant) -> Self {
        if !command.has_active_constraints() {
            return Self {
                slots: Vec::new(),
                status: ConstraintStatus::Na,
            };
        }
        Self::new(&command.constraints, started_at)
    }

    /// Build a checker over explicit constraints
    pub fn new(constraints: &[ConstraintDefinition], started_at: Instant) -> Self {
        let slots: Vec<_> = constraints
            .iter()
            .map(|definition| ConstraintSlot {
                definition: definition.clone(),
                expires_at: started_at + Duration::from_millis(definition.timeout_ms),
                satisfied: false,
            })
            .collect();
        let status = if slots.is_empty() {
            ConstraintStatus::Na
        } else {
            ConstraintStatus::Pending
        };
        Self { slots, status }
    }

    /// Current aggregate status
    pub fn status(&self) -> ConstraintStatus {
        self.status
    }

    /// Parameters whose updates should trigger a re-check
    pub fn telemetry_keys(&self) -> Vec<TelemetryKey> {
        let mut names = BTreeSet::new();
        for slot in &self.slots {
            names.extend(slot.definition.criteria.parameters());
        }
        names.into_iter().map(TelemetryKey::Parameter).collect()
    }

    /// Re-evaluate every unsatisfied constraint
    pub fn check(&mut self, now: Instant, ctx: &dyn EvalContext) -> ConstraintStatus {
        if self.status.is_terminal() {
            return self.status;
        }

        let mut aggregate = ConstraintStatus::Ok;
        for slot in self.slots.iter_mut().filter(|s| !s.satisfied) {
            if now > slot.expires_at {
                aggregate = ConstraintStatus::Nok;
                break;
            }
            match slot.definition.criteria.evaluate(ctx) {
                Some(true) => slot.satisfied = true,
                _ if now < slot.expires_at => aggregate = ConstraintStatus::Pending,
                _ => {
                    aggregate = ConstraintStatus::Nok;
                    break;
                }
            }
        }
        self.status = aggregate;
        self.status
    }

    /// Earliest expiry among unsatisfied constraints while pending
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.status != ConstraintStatus::Pending {
            return None;
        }
        self.slots
            .iter()
            .filter(|s| !s.satisfied)
            .map(|s| s.expires_at)
            .min()
    }
}

/// Evaluation context backed by the telemetry last-value cache
pub struct LiveContext<'a> {
    feed: &'a dyn TelemetryFeed,
    arguments: &'a BTreeMap<String, Value>,
    update: Option<&'a ParameterValue>,
}

impl<'a> LiveContext<'a> {
    /// Create a context over a feed and a command's arguments
    pub fn new(feed: &'a dyn TelemetryFeed, arguments: &'a BTreeMap<String, Value>) -> Self {
        Self {
            feed,
            arguments,
            update: None,
        }
    }

    /// Evaluate against the value carried by an update rather than the
    /// cache, which may already hold a later one
    pub fn with_update(mut self, update: &'a ParameterValue) -> Self {
        self.update = Some(update);
        self
    }
}

impl EvalContext for LiveContext<'_> {
    fn parameter(&self, name: &str) -> Option<Value> {
        match self.update {
            Some(update) if update.name == name => Some(update.value.clone()),
            _ => self.feed.last_value(name).map(|p| p.value),
        }
    }

    fn argument(&self, name: &str) -> Option<Value> {
        self.arguments.get(name).cloned()
    }
}
