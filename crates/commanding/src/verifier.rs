//! Post-release verification
//!
//! Stages resolve strictly in declared order. Only the current stage is
//! armed; an OK arms the next one, anything else ends verification. The
//! engine is synchronous and deterministic: the lifecycle task feeds it
//! telemetry events and timer expiries and writes the transitions it
//! returns.

use crate::command::CommandOptions;
use crate::criteria::EvalContext;
use crate::mdb::{CheckWindow, VerifierDefinition, VerifierKind, WindowAnchor};
use crate::telemetry::{TelemetryEvent, TelemetryKey};
use cmdflow_core::Value;
use cmdflow_history::AckStatus;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Status of one verifier instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierStatus {
    /// Armed and waiting
    Pending,
    /// Verified
    Ok,
    /// Failed
    Nok,
    /// Not run for this command
    Disabled,
    /// Window elapsed without a result
    Timeout,
}

impl VerifierStatus {
    /// History representation
    pub fn ack_status(&self) -> AckStatus {
        match self {
            VerifierStatus::Pending => AckStatus::Pending,
            VerifierStatus::Ok => AckStatus::Ok,
            VerifierStatus::Nok => AckStatus::Nok,
            VerifierStatus::Disabled => AckStatus::Disabled,
            VerifierStatus::Timeout => AckStatus::Timeout,
        }
    }
}

impl fmt::Display for VerifierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ack_status().as_str())
    }
}

/// Final verdict of a command's verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every enabled stage verified
    Ok,
    /// A stage failed; message names it
    Nok(String),
}

/// A status change to record in the history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransition {
    /// Stage name
    pub stage: String,
    /// New status
    pub status: VerifierStatus,
}

#[derive(Debug, Clone, Copy)]
struct ArmedWindow {
    start: Instant,
    stop: Instant,
}

/// Runtime state of one verifier
#[derive(Debug, Clone)]
pub struct VerifierState {
    /// Stage name
    pub name: String,
    /// Decision rule
    pub kind: VerifierKind,
    /// Effective check window
    pub window: CheckWindow,
    /// `None` until the stage is reached
    pub status: Option<VerifierStatus>,
    armed: Option<ArmedWindow>,
    observed: HashMap<String, Value>,
}

struct WindowContext<'a> {
    observed: &'a HashMap<String, Value>,
    arguments: &'a BTreeMap<String, Value>,
}

impl EvalContext for WindowContext<'_> {
    fn parameter(&self, name: &str) -> Option<Value> {
        self.observed.get(name).cloned()
    }

    fn argument(&self, name: &str) -> Option<Value> {
        self.arguments.get(name).cloned()
    }
}

/// Verification state machine for one command
#[derive(Debug)]
pub struct VerifierEngine {
    states: Vec<VerifierState>,
    current: usize,
    released_at: Option<Instant>,
    last_resolved_at: Option<Instant>,
    completion: Option<Completion>,
}

impl VerifierEngine {
    /// Build the engine from definitions and per-command overrides
    pub fn new(definitions: &[VerifierDefinition], options: &CommandOptions) -> Self {
        let states = if options.disable_all_verifiers {
            Vec::new()
        } else {
            definitions
                .iter()
                .map(|def| {
                    let overrides = options.verifier_overrides.get(&def.stage);
                    VerifierState {
                        name: def.stage.clone(),
                        kind: def.check.clone(),
                        window: overrides.and_then(|o| o.window).unwrap_or(def.window),
                        status: overrides
                            .filter(|o| o.disable)
                            .map(|_| VerifierStatus::Disabled),
                        armed: None,
                        observed: HashMap::new(),
                    }
                })
                .collect()
        };
        Self {
            states,
            current: 0,
            released_at: None,
            last_resolved_at: None,
            completion: None,
        }
    }

    /// Check if there is nothing to verify (no stage, or all disabled by option)
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Verifier states in declared order
    pub fn states(&self) -> &[VerifierState] {
        &self.states
    }

    /// Final verdict, once reached
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Telemetry the enabled stages listen to
    pub fn telemetry_keys(&self) -> Vec<TelemetryKey> {
        let mut keys = BTreeSet::new();
        for state in self
            .states
            .iter()
            .filter(|s| s.status != Some(VerifierStatus::Disabled))
        {
            match &state.kind {
                VerifierKind::Container(pattern) => {
                    keys.insert(TelemetryKey::Container(pattern.name.clone()));
                }
                VerifierKind::Algorithm(criteria) => {
                    keys.extend(criteria.parameters().into_iter().map(TelemetryKey::Parameter));
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Start verification at release time
    pub fn start(&mut self, released_at: Instant, now: Instant) -> Vec<StageTransition> {
        self.released_at = Some(released_at);
        self.last_resolved_at = Some(released_at);
        let mut transitions = Vec::new();
        self.advance(now, &mut transitions);
        transitions
    }

    /// Feed a telemetry event
    pub fn on_event(
        &mut self,
        event: &TelemetryEvent,
        now: Instant,
        arguments: &BTreeMap<String, Value>,
    ) -> Vec<StageTransition> {
        let mut transitions = Vec::new();
        if self.completion.is_some() {
            return transitions;
        }
        let Some(state) = self.states.get_mut(self.current) else {
            return transitions;
        };
        let Some(window) = state.armed else {
            return transitions;
        };
        if state.status != Some(VerifierStatus::Pending) || now < window.start || now >= window.stop
        {
            return transitions;
        }

        let verdict = match (&state.kind, event) {
            (VerifierKind::Container(pattern), TelemetryEvent::Container(occurrence)) => {
                pattern.matches(occurrence).then_some(VerifierStatus::Ok)
            }
            (VerifierKind::Algorithm(criteria), TelemetryEvent::Parameter(pv)) => {
                state.observed.insert(pv.name.clone(), pv.value.clone());
                let ctx = WindowContext {
                    observed: &state.observed,
                    arguments,
                };
                criteria.evaluate(&ctx).map(|ok| {
                    if ok {
                        VerifierStatus::Ok
                    } else {
                        VerifierStatus::Nok
                    }
                })
            }
            _ => None,
        };

        if let Some(status) = verdict {
            self.resolve(status, now, &mut transitions);
        }
        transitions
    }

    /// Handle the expiry of the current stage's window
    pub fn on_timer(&mut self, now: Instant) -> Vec<StageTransition> {
        let mut transitions = Vec::new();
        if let Some(deadline) = self.next_deadline() {
            if now >= deadline {
                self.resolve(VerifierStatus::Timeout, now, &mut transitions);
            }
        }
        transitions
    }

    /// Stop instant of the pending stage
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.completion.is_some() {
            return None;
        }
        let state = self.states.get(self.current)?;
        match state.status {
            Some(VerifierStatus::Pending) => state.armed.map(|w| w.stop),
            _ => None,
        }
    }

    fn resolve(&mut self, status: VerifierStatus, now: Instant, transitions: &mut Vec<StageTransition>) {
        let Some(state) = self.states.get_mut(self.current) else {
            return;
        };
        state.status = Some(status);
        state.observed.clear();
        transitions.push(StageTransition {
            stage: state.name.clone(),
            status,
        });

        if status == VerifierStatus::Ok {
            self.last_resolved_at = Some(now);
            self.current += 1;
            self.advance(now, transitions);
        } else {
            self.completion = Some(Completion::Nok(format!(
                "Verifier {} result: {}",
                state.name, status
            )));
            // later stages are never reached; disabled ones are still marked
            for state in &self.states[self.current + 1..] {
                if state.status == Some(VerifierStatus::Disabled) {
                    transitions.push(StageTransition {
                        stage: state.name.clone(),
                        status: VerifierStatus::Disabled,
                    });
                }
            }
        }
    }

    fn advance(&mut self, now: Instant, transitions: &mut Vec<StageTransition>) {
        loop {
            let Some(state) = self.states.get_mut(self.current) else {
                self.completion = Some(Completion::Ok);
                return;
            };

            if state.status == Some(VerifierStatus::Disabled) {
                transitions.push(StageTransition {
                    stage: state.name.clone(),
                    status: VerifierStatus::Disabled,
                });
                self.current += 1;
                continue;
            }

            let anchor = match state.window.relative_to {
                WindowAnchor::CommandRelease => self.released_at,
                WindowAnchor::LastVerifier => self.last_resolved_at,
            }
            .unwrap_or(now);
            let window = ArmedWindow {
                start: anchor + Duration::from_millis(state.window.start_ms),
                stop: anchor + Duration::from_millis(state.window.stop_ms),
            };
            state.armed = Some(window);
            state.status = Some(VerifierStatus::Pending);
            transitions.push(StageTransition {
                stage: state.name.clone(),
                status: VerifierStatus::Pending,
            });

            if window.stop <= now {
                self.resolve(VerifierStatus::Timeout, now, transitions);
            }
            return;
        }
    }
}
