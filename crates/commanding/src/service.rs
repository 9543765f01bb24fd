//! Commanding service facade
//!
//! Entry point for callers: issues commands, controls queues and exposes
//! the history stream. Synchronous validation errors are returned here;
//! everything after admission is only observable through the history log.

use crate::command::{CommandOptions, PreparedCommand};
use crate::error::{AdmissionError, CommandingError, QueueError};
use crate::lifecycle::{CommandLifecycle, Engine, LifecycleEvent};
use crate::mdb::MissionDatabase;
use crate::queue::{QueueEvent, QueueInfo, QueueManager, ReleaseTicket};
use crate::telemetry::TelemetryFeed;
use crate::uplink::Uplink;
use cmdflow_core::{CommandIdentity, QueueConfig, QueueState, Value};
use cmdflow_history::{
    keys, AckStatus, HistoryAttribute, HistoryError, HistoryFilter, HistoryLog,
    HistorySubscription,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Attribute carrying the free-text comment of an issue request
pub const COMMENT_ATTRIBUTE: &str = "Comment";

/// Command lifecycle engine
#[derive(Clone)]
pub struct Commanding {
    engine: Arc<Engine>,
}

impl Commanding {
    /// Create the service over its collaborators
    pub fn new(
        queues: &[QueueConfig],
        history: Arc<HistoryLog>,
        mdb: Arc<dyn MissionDatabase>,
        uplink: Arc<dyn Uplink>,
        telemetry: Arc<dyn TelemetryFeed>,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                history,
                queues: QueueManager::new(queues),
                telemetry,
                uplink,
                mdb,
            }),
        }
    }

    /// Submit a command.
    ///
    /// Returns once the command is queued; its lifecycle then runs on its
    /// own task. Must be called from within a tokio runtime.
    pub fn issue_command(
        &self,
        name: &str,
        args: BTreeMap<String, Value>,
        origin: &str,
        sequence_number: u32,
        options: CommandOptions,
    ) -> Result<PreparedCommand, CommandingError> {
        let preparation = self.engine.mdb.prepare(name, &args)?;

        if !preparation.privileged_users.is_empty()
            && !preparation.privileged_users.contains(&options.issuer.user)
        {
            warn!(user = %options.issuer.user, command = %preparation.qualified_name, "Permission denied");
            return Err(CommandingError::PermissionDenied {
                user: options.issuer.user.clone(),
                command: preparation.qualified_name,
            });
        }

        let mut identity =
            CommandIdentity::new(preparation.qualified_name.as_str(), sequence_number, origin);
        for stage in options.verifier_overrides.keys() {
            if !preparation.verifiers.iter().any(|v| &v.stage == stage) {
                warn!(command = %identity, stage = %stage, "Override for unknown verifier stage ignored");
            }
        }

        let target = options.queue.as_deref().or(preparation.queue.as_deref());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        // identities are unique: step the generation time past any clash
        let admitted = loop {
            if self.engine.history.contains(&identity)? {
                debug!(command = %identity, "Identity already recorded, adjusting generation time");
                identity.generation_time_ms += 1;
                continue;
            }
            let attempt = self
                .engine
                .queues
                .select(target, &options.issuer, preparation.significance)
                .and_then(|queue| {
                    self.engine
                        .queues
                        .admit(&queue, &identity, options.override_block, inbox_tx.clone())
                        .map(|admission| (queue, admission))
                });
            match attempt {
                Err(AdmissionError::DuplicateCommand(_)) => {
                    debug!(command = %identity, "Identity already pending, adjusting generation time");
                    identity.generation_time_ms += 1;
                }
                other => break other,
            }
        };
        let (queue, admission) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                self.record_admission_failure(&identity, &e);
                return Err(e.into());
            }
        };

        let mut entries = vec![
            (keys::QUEUE.to_string(), Value::from(queue.as_str())),
            (keys::status(keys::ACK_QUEUED), Value::from(AckStatus::Ok.as_str())),
            (
                keys::time(keys::ACK_QUEUED),
                Value::Timestamp(cmdflow_core::current_timestamp_ms()),
            ),
        ];
        if let Some(comment) = &options.comment {
            entries.push((COMMENT_ATTRIBUTE.to_string(), Value::from(comment.as_str())));
        }
        if let Err(e) = self.engine.history.append_all(&identity, entries) {
            error!(command = %identity, error = %e, "Failed to record command admission");
            self.engine.queues.remove(&identity);
            return Err(e.into());
        }

        let command = PreparedCommand {
            identity,
            payload: preparation.payload,
            prepared_at_ms: cmdflow_core::current_timestamp_ms(),
            significance: preparation.significance,
            queue,
            arguments: preparation.assignments,
            constraints: preparation.constraints,
            verifiers: preparation.verifiers,
            options,
        };
        info!(
            command = %command.identity,
            queue = %command.queue,
            significance = %command.significance,
            admission = ?admission,
            "Command queued"
        );

        let lifecycle = CommandLifecycle::new(Arc::clone(&self.engine), command.clone(), inbox_rx);
        tokio::spawn(lifecycle.run(admission));
        Ok(command)
    }

    fn record_admission_failure(&self, identity: &CommandIdentity, err: &AdmissionError) {
        warn!(command = %identity, reason = %err, "Command rejected at admission");
        let reason = err.to_string();
        let history = &self.engine.history;
        let mut written = Ok(());
        if let Some(queue) = err.queue() {
            written = history.append(identity, keys::QUEUE, Value::from(queue)).map(|_| ());
        }
        let written = written
            .and_then(|_| history.ack(identity, keys::ACK_QUEUED, AckStatus::Nok, Some(&reason)))
            .and_then(|_| {
                history.ack(identity, keys::COMMAND_COMPLETE, AckStatus::Nok, Some(&reason))
            });
        if let Err(e) = written {
            error!(command = %identity, error = %e, "Failed to record admission rejection");
        }
    }

    /// Change a queue's state.
    ///
    /// Enabling a queue releases its held commands one at a time in arrival
    /// order; each has reached its release decision before the next starts.
    pub async fn set_queue_state(
        &self,
        name: &str,
        state: QueueState,
    ) -> Result<QueueInfo, CommandingError> {
        let change = self.engine.queues.set_state(name, state)?;
        release_in_order(change.to_release).await;

        if let Some((secs, generation, default_state)) = change.expiration {
            debug!(queue = %name, secs, state = %default_state, "Queue state expiration scheduled");
            let engine = Arc::clone(&self.engine);
            let name = name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if !engine.queues.expiration_is_current(&name, generation) {
                    return;
                }
                info!(queue = %name, state = %default_state, "Queue state expired, restoring default");
                match engine.queues.set_state(&name, default_state) {
                    Ok(change) => release_in_order(change.to_release).await,
                    Err(e) => warn!(queue = %name, error = %e, "Queue state expiration failed"),
                }
            });
        }

        self.engine
            .queues
            .queue(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()).into())
    }

    /// Release a held command; resolves once its release decision is reached
    pub async fn release_command(
        &self,
        identity: &CommandIdentity,
        rebuild: bool,
    ) -> Result<(), CommandingError> {
        let done = self.engine.queues.release(identity, rebuild)?;
        // a dropped sender means the lifecycle already finished
        let _ = done.await;
        Ok(())
    }

    /// Reject a pending command without transmission
    pub fn reject_command(&self, identity: &CommandIdentity, user: &str) -> Result<(), CommandingError> {
        self.engine.queues.reject(identity, user)?;
        Ok(())
    }

    /// Append an external attribute outside the standard stage sequence
    pub fn update_history(
        &self,
        identity: &CommandIdentity,
        name: &str,
        value: Value,
    ) -> Result<HistoryAttribute, CommandingError> {
        if keys::is_protected(name) {
            return Err(HistoryError::ProtectedAttribute(name.to_string()).into());
        }
        if !self.engine.history.contains(identity)? {
            return Err(HistoryError::UnknownCommand(identity.to_string()).into());
        }
        let attr = self.engine.history.append(identity, name, value)?;
        debug!(command = %identity, attribute = %name, "External history attribute recorded");
        Ok(attr)
    }

    /// Live history feed; no replay of earlier attributes
    pub fn subscribe_history(&self, filter: HistoryFilter) -> HistorySubscription {
        self.engine.history.subscribe(filter)
    }

    /// Recorded history of one command in append order
    pub fn query_history(
        &self,
        identity: &CommandIdentity,
    ) -> Result<Vec<HistoryAttribute>, CommandingError> {
        Ok(self.engine.history.query(identity)?)
    }

    /// Snapshots of all queues
    pub fn queues(&self) -> Vec<QueueInfo> {
        self.engine.queues.queues()
    }

    /// Snapshot of one queue
    pub fn queue(&self, name: &str) -> Option<QueueInfo> {
        self.engine.queues.queue(name)
    }

    /// Pending command with this sequence number
    pub fn find_pending(&self, sequence_number: u32) -> Option<CommandIdentity> {
        self.engine.queues.find_pending(sequence_number)
    }

    /// Queue events as a broadcast receiver
    pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.engine.queues.subscribe()
    }

    /// Queue events as a stream; lagging yields an error item
    pub fn queue_event_stream(&self) -> BroadcastStream<QueueEvent> {
        BroadcastStream::new(self.engine.queues.subscribe())
    }

    /// The history log
    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.engine.history
    }
}

async fn release_in_order(tickets: Vec<ReleaseTicket>) {
    for ticket in tickets {
        let (done_tx, done_rx) = oneshot::channel();
        let event = LifecycleEvent::Release {
            rebuild: false,
            done: Some(done_tx),
        };
        if ticket.inbox.send(event).is_err() {
            debug!(command = %ticket.identity, "Lifecycle already finished, skipping release");
            continue;
        }
        let _ = done_rx.await;
    }
}
