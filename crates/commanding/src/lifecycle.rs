//! Per-command lifecycle task
//!
//! Every admitted command is driven by one task that owns its
//! `PreparedCommand` and is the only writer of its history. Queue decisions
//! reach the task through its inbox; telemetry reaches it through a
//! subscription channel opened for the constraint check and again for
//! verification. Exactly one `CommandComplete` is written when the task ends.

use crate::command::PreparedCommand;
use crate::constraint::{ConstraintChecker, ConstraintStatus, LiveContext};
use crate::error::{LifecycleError, MdbError};
use crate::mdb::MissionDatabase;
use crate::queue::{Admission, QueueEvent, QueueManager};
use crate::telemetry::{SubscriptionGuard, TelemetryEvent, TelemetryFeed};
use crate::uplink::Uplink;
use crate::verifier::{Completion, StageTransition, VerifierEngine};
use cmdflow_core::Value;
use cmdflow_history::{keys, AckStatus, HistoryLog};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Message recorded when the constraint check fails
pub const CONSTRAINTS_FAILED: &str = "Transmission constraints check failed";

/// Message recorded when the history log cannot be written
pub const HISTORY_UNAVAILABLE: &str = "Command history unavailable";

const SERVICE_STOPPED: &str = "Commanding service stopped";

/// Decisions delivered to a lifecycle task
#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    /// Leave the hold and go to the release decision
    Release {
        /// Re-prepare the payload first
        rebuild: bool,
        /// Signalled once the release decision is reached
        done: Option<oneshot::Sender<()>>,
    },
    /// Fail the command without transmission
    Cancel {
        /// Reason recorded in the history
        message: String,
    },
}

/// Lifecycle states of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStage {
    /// Prepared, not yet admitted
    Created,
    /// Pending in a queue
    Queued,
    /// Waiting for transmission constraints
    ConstraintPending,
    /// Handed to the uplink
    Released,
    /// Failed before transmission
    Rejected,
    /// Verifiers running
    Verifying,
    /// Terminal
    Complete,
}

impl LifecycleStage {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleStage::Complete)
    }

    /// Check if transition to new state is valid
    pub fn can_transition_to(&self, next: LifecycleStage) -> bool {
        use LifecycleStage::*;
        match (self, next) {
            (Created, Queued) => true,
            (Queued, ConstraintPending) | (Queued, Released) | (Queued, Rejected) => true,
            (ConstraintPending, Released) | (ConstraintPending, Rejected) => true,
            (Released, Verifying) => true,
            // any non-terminal state may complete
            (Complete, _) => false,
            (_, Complete) => true,
            _ => false,
        }
    }
}

/// Collaborators shared by every lifecycle task
pub(crate) struct Engine {
    pub(crate) history: Arc<HistoryLog>,
    pub(crate) queues: QueueManager,
    pub(crate) telemetry: Arc<dyn TelemetryFeed>,
    pub(crate) uplink: Arc<dyn Uplink>,
    pub(crate) mdb: Arc<dyn MissionDatabase>,
}

fn signal(done: Option<oneshot::Sender<()>>) {
    if let Some(tx) = done {
        // the requester may have stopped waiting
        let _ = tx.send(());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// State machine of one admitted command
pub(crate) struct CommandLifecycle {
    engine: Arc<Engine>,
    command: PreparedCommand,
    inbox: mpsc::UnboundedReceiver<LifecycleEvent>,
    stage: LifecycleStage,
}

impl CommandLifecycle {
    pub(crate) fn new(
        engine: Arc<Engine>,
        command: PreparedCommand,
        inbox: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) -> Self {
        Self {
            engine,
            command,
            inbox,
            stage: LifecycleStage::Created,
        }
    }

    /// Drive the command to completion
    pub(crate) async fn run(mut self, admission: Admission) {
        let id = self.command.identity.clone();
        let result = self.drive(admission).await;

        // a failed lifecycle may leave its entry behind
        self.engine.queues.remove(&id);

        let history = &self.engine.history;
        let written = match &result {
            Ok(Completion::Ok) => history.ack(&id, keys::COMMAND_COMPLETE, AckStatus::Ok, None),
            Ok(Completion::Nok(message)) => {
                history.ack(&id, keys::COMMAND_COMPLETE, AckStatus::Nok, Some(message))
            }
            Err(e) => {
                error!(command = %id, error = %e, "Command lifecycle aborted");
                history.ack(
                    &id,
                    keys::COMMAND_COMPLETE,
                    AckStatus::Nok,
                    Some(HISTORY_UNAVAILABLE),
                )
            }
        };
        if let Err(e) = written {
            error!(command = %id, error = %e, "Failed to record command completion");
        }

        self.transition(LifecycleStage::Complete);
        match &result {
            Ok(Completion::Ok) => info!(command = %id, "Command complete"),
            Ok(Completion::Nok(message)) => info!(command = %id, reason = %message, "Command failed"),
            Err(_) => {}
        }

        self.inbox.close();
        while let Ok(event) = self.inbox.try_recv() {
            warn!(command = %id, event = ?event, "Discarding event for completed command");
        }
    }

    async fn drive(&mut self, admission: Admission) -> Result<Completion, LifecycleError> {
        self.transition(LifecycleStage::Queued);

        let mut done = None;
        if admission == Admission::Hold {
            debug!(command = %self.command.identity, queue = %self.command.queue, "Command held");
            match self.inbox.recv().await {
                Some(LifecycleEvent::Release { rebuild, done: d }) => {
                    done = d;
                    if rebuild {
                        if let Err(e) = self.rebuild() {
                            return self.fail_rebuild(e, done);
                        }
                        self.engine.history.append(
                            &self.command.identity,
                            keys::REBUILT,
                            Value::Timestamp(self.command.prepared_at_ms),
                        )?;
                    }
                }
                Some(LifecycleEvent::Cancel { message }) => return self.cancel(message, false),
                None => return Ok(Completion::Nok(SERVICE_STOPPED.to_string())),
            }
        }

        self.release(done).await
    }

    fn rebuild(&mut self) -> Result<(), MdbError> {
        let preparation = self
            .engine
            .mdb
            .prepare(&self.command.identity.name, &self.command.arguments)?;
        self.command.payload = preparation.payload;
        self.command.significance = preparation.significance;
        self.command.constraints = preparation.constraints;
        self.command.prepared_at_ms = cmdflow_core::current_timestamp_ms();
        info!(
            command = %self.command.identity,
            prepared_at_ms = self.command.prepared_at_ms,
            "Command rebuilt"
        );
        Ok(())
    }

    fn fail_rebuild(
        &mut self,
        err: MdbError,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<Completion, LifecycleError> {
        let message = format!("Rebuild failed: {}", err);
        warn!(command = %self.command.identity, error = %err, "Command rebuild failed");
        self.engine.queues.remove(&self.command.identity);
        signal(done);
        self.transition(LifecycleStage::Rejected);
        self.ack(keys::ACK_RELEASED, AckStatus::Nok, Some(&message))?;
        self.publish_rejected(&message);
        Ok(Completion::Nok(message))
    }

    /// Constraint check, then transmission
    async fn release(
        &mut self,
        mut done: Option<oneshot::Sender<()>>,
    ) -> Result<Completion, LifecycleError> {
        let mut checker = ConstraintChecker::for_command(&self.command, Instant::now());

        if checker.status() == ConstraintStatus::Na {
            if self.engine.queues.remove(&self.command.identity).is_none() {
                signal(done);
                return self.await_cancel(false).await;
            }
            self.ack(keys::TRANSMISSION_CONSTRAINTS, AckStatus::Na, None)?;
            return self.transmit(done).await;
        }

        self.transition(LifecycleStage::ConstraintPending);
        let (tm_tx, mut tm_rx) = mpsc::unbounded_channel();
        let subscription = SubscriptionGuard::subscribe(
            Arc::clone(&self.engine.telemetry),
            checker.telemetry_keys(),
            tm_tx,
        );

        let mut status = self.check_constraints(&mut checker, None);
        let tc_pending = status == ConstraintStatus::Pending;
        if tc_pending {
            self.ack(keys::TRANSMISSION_CONSTRAINTS, AckStatus::Pending, None)?;
            debug!(command = %self.command.identity, "Waiting for transmission constraints");
            signal(done.take());
        }

        while status == ConstraintStatus::Pending {
            let deadline = checker.next_deadline();
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(LifecycleEvent::Cancel { message }) => return self.cancel(message, true),
                    Some(LifecycleEvent::Release { done: d, .. }) => signal(d),
                    None => return Ok(Completion::Nok(SERVICE_STOPPED.to_string())),
                },
                Some(event) = tm_rx.recv() => {
                    status = self.check_constraints(&mut checker, Some(&event));
                }
                _ = sleep_until_opt(deadline) => {
                    status = self.check_constraints(&mut checker, None);
                }
            }
        }
        drop(subscription);

        let Some(queue) = self.engine.queues.remove(&self.command.identity) else {
            signal(done);
            return self.await_cancel(tc_pending).await;
        };

        if status == ConstraintStatus::Ok {
            self.ack(keys::TRANSMISSION_CONSTRAINTS, AckStatus::Ok, None)?;
            return self.transmit(done).await;
        }

        info!(command = %self.command.identity, queue = %queue, "Transmission constraints check failed");
        self.transition(LifecycleStage::Rejected);
        let written = self
            .ack(keys::TRANSMISSION_CONSTRAINTS, AckStatus::Nok, None)
            .and_then(|_| self.ack(keys::ACK_RELEASED, AckStatus::Nok, Some(CONSTRAINTS_FAILED)));
        signal(done);
        self.publish_rejected(CONSTRAINTS_FAILED);
        written?;
        Ok(Completion::Nok(CONSTRAINTS_FAILED.to_string()))
    }

    fn check_constraints(
        &self,
        checker: &mut ConstraintChecker,
        trigger: Option<&TelemetryEvent>,
    ) -> ConstraintStatus {
        let ctx = LiveContext::new(self.engine.telemetry.as_ref(), &self.command.arguments);
        let ctx = match trigger {
            Some(TelemetryEvent::Parameter(update)) => ctx.with_update(update),
            _ => ctx,
        };
        checker.check(Instant::now(), &ctx)
    }

    /// The queue entry is gone without our doing; its cancellation is in the inbox
    async fn await_cancel(&mut self, tc_pending: bool) -> Result<Completion, LifecycleError> {
        loop {
            match self.inbox.recv().await {
                Some(LifecycleEvent::Cancel { message }) => return self.cancel(message, tc_pending),
                Some(LifecycleEvent::Release { done, .. }) => signal(done),
                None => return Ok(Completion::Nok(SERVICE_STOPPED.to_string())),
            }
        }
    }

    fn cancel(&mut self, message: String, tc_pending: bool) -> Result<Completion, LifecycleError> {
        info!(command = %self.command.identity, reason = %message, "Command cancelled before release");
        self.transition(LifecycleStage::Rejected);
        if tc_pending {
            self.ack(keys::TRANSMISSION_CONSTRAINTS, AckStatus::Cancelled, None)?;
        }
        self.ack(keys::ACK_RELEASED, AckStatus::Nok, Some(&message))?;
        Ok(Completion::Nok(message))
    }

    async fn transmit(
        &mut self,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<Completion, LifecycleError> {
        self.transition(LifecycleStage::Released);

        if let Err(e) = self.engine.uplink.send_tc(&self.command) {
            let message = format!("Uplink failure: {}", e);
            error!(command = %self.command.identity, error = %e, "Uplink failed to send command");
            let written = self.ack(keys::ACK_RELEASED, AckStatus::Nok, Some(&message));
            signal(done);
            self.publish_rejected(&message);
            written?;
            return Ok(Completion::Nok(message));
        }

        let released_at = Instant::now();
        info!(command = %self.command.identity, queue = %self.command.queue, "Command released");
        let written = self.ack(keys::ACK_RELEASED, AckStatus::Ok, None);
        self.engine.queues.publish(QueueEvent::CommandReleased {
            queue: self.command.queue.clone(),
            command: self.command.identity.clone(),
        });
        signal(done);
        written?;

        self.verify(released_at).await
    }

    async fn verify(&mut self, released_at: Instant) -> Result<Completion, LifecycleError> {
        let mut verifiers = VerifierEngine::new(&self.command.verifiers, &self.command.options);
        if verifiers.is_empty() {
            return Ok(Completion::Ok);
        }
        self.transition(LifecycleStage::Verifying);

        // subscribe before the first PENDING becomes visible
        let (tm_tx, mut tm_rx) = mpsc::unbounded_channel();
        let _subscription = SubscriptionGuard::subscribe(
            Arc::clone(&self.engine.telemetry),
            verifiers.telemetry_keys(),
            tm_tx,
        );
        let transitions = verifiers.start(released_at, Instant::now());
        self.record(&transitions)?;

        let mut inbox_open = true;
        loop {
            if let Some(completion) = verifiers.completion() {
                return Ok(completion.clone());
            }
            let deadline = verifiers.next_deadline();
            tokio::select! {
                event = self.inbox.recv(), if inbox_open => match event {
                    Some(event) => {
                        warn!(command = %self.command.identity, event = ?event, "Ignoring queue event for released command");
                    }
                    None => inbox_open = false,
                },
                Some(event) = tm_rx.recv() => {
                    let transitions = verifiers.on_event(&event, Instant::now(), &self.command.arguments);
                    self.record(&transitions)?;
                }
                _ = sleep_until_opt(deadline) => {
                    let transitions = verifiers.on_timer(Instant::now());
                    self.record(&transitions)?;
                }
            }
        }
    }

    fn record(&self, transitions: &[StageTransition]) -> Result<(), LifecycleError> {
        for transition in transitions {
            debug!(
                command = %self.command.identity,
                stage = %transition.stage,
                status = %transition.status,
                "Verifier transition"
            );
            self.ack(
                &keys::verifier(&transition.stage),
                transition.status.ack_status(),
                None,
            )?;
        }
        Ok(())
    }

    fn ack(&self, key: &str, status: AckStatus, message: Option<&str>) -> Result<(), LifecycleError> {
        self.engine
            .history
            .ack(&self.command.identity, key, status, message)?;
        Ok(())
    }

    fn publish_rejected(&self, reason: &str) {
        self.engine.queues.publish(QueueEvent::CommandRejected {
            queue: self.command.queue.clone(),
            command: self.command.identity.clone(),
            reason: reason.to_string(),
        });
    }

    fn transition(&mut self, next: LifecycleStage) {
        if !self.stage.can_transition_to(next) {
            warn!(command = %self.command.identity, from = ?self.stage, to = ?next, "Invalid lifecycle transition ignored");
            return;
        }
        debug!(command = %self.command.identity, from = ?self.stage, to = ?next, "Lifecycle transition");
        self.stage = next;
    }
}
