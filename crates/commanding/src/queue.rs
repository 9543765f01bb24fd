//! Command queues
//!
//! Each queue owns a mutex-guarded FIFO of pending commands; no lock is ever
//! held across two queues. Admissions are serialized so that an identity is
//! pending in at most one place. Pending entries carry the inbox of their command's
//! lifecycle task, and every decision taken here (release, reject, disable)
//! is delivered to that task as a message rather than applied directly.

use crate::command::Issuer;
use crate::error::{AdmissionError, QueueError};
use crate::lifecycle::LifecycleEvent;
use cmdflow_core::{BlockedPolicy, CommandIdentity, QueueConfig, QueueState, Significance};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the queue event broadcast channel
const QUEUE_EVENT_CAPACITY: usize = 1000;

/// Whether an admitted command may go straight to its release decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queue is enabled
    Release,
    /// Queue is blocked; wait for an operator or the queue to be enabled
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Held,
    Releasing,
}

struct QueueEntry {
    identity: CommandIdentity,
    status: EntryStatus,
    inbox: mpsc::UnboundedSender<LifecycleEvent>,
}

/// Snapshot of a queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    /// Queue name
    pub name: String,
    /// Current state
    pub state: QueueState,
    /// State the queue returns to on expiration
    pub default_state: QueueState,
    /// Minimum significance accepted
    pub min_level: Significance,
    /// Pending commands in arrival order
    pub pending: Vec<CommandIdentity>,
}

/// Notifications for queue monitors
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Command admitted to a queue
    CommandAdded {
        /// Queue name
        queue: String,
        /// Command
        command: CommandIdentity,
    },
    /// Command left a queue towards the uplink
    CommandReleased {
        /// Queue name
        queue: String,
        /// Command
        command: CommandIdentity,
    },
    /// Command left a queue without being sent
    CommandRejected {
        /// Queue name
        queue: String,
        /// Command
        command: CommandIdentity,
        /// Reason
        reason: String,
    },
    /// Queue state or content changed
    QueueUpdated(QueueInfo),
}

/// A held command whose release was triggered by enabling its queue
pub(crate) struct ReleaseTicket {
    pub(crate) identity: CommandIdentity,
    pub(crate) inbox: mpsc::UnboundedSender<LifecycleEvent>,
}

/// Outcome of a state change
pub(crate) struct StateChange {
    /// Held commands to release, in arrival order
    pub(crate) to_release: Vec<ReleaseTicket>,
    /// Expiration to schedule: (seconds, generation, default state)
    pub(crate) expiration: Option<(u64, u64, QueueState)>,
}

struct QueueInner {
    state: QueueState,
    pending: VecDeque<QueueEntry>,
    expiration_generation: u64,
}

struct CommandQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info_locked(&self, inner: &QueueInner) -> QueueInfo {
        QueueInfo {
            name: self.config.name.clone(),
            state: inner.state,
            default_state: self.config.state,
            min_level: self.config.min_level,
            pending: inner.pending.iter().map(|e| e.identity.clone()).collect(),
        }
    }
}

/// Owner of all command queues
pub struct QueueManager {
    queues: Vec<CommandQueue>,
    events: broadcast::Sender<QueueEvent>,
    admission: Mutex<()>,
}

impl QueueManager {
    /// Create queues from configuration, keeping configuration order
    pub fn new(configs: &[QueueConfig]) -> Self {
        let (events, _) = broadcast::channel(QUEUE_EVENT_CAPACITY);
        let queues = configs
            .iter()
            .map(|config| {
                info!(queue = %config.name, state = %config.state, min_level = %config.min_level, "Command queue created");
                CommandQueue {
                    config: config.clone(),
                    inner: Mutex::new(QueueInner {
                        state: config.state,
                        pending: VecDeque::new(),
                        expiration_generation: 0,
                    }),
                }
            })
            .collect();
        Self {
            queues,
            events,
            admission: Mutex::new(()),
        }
    }

    /// Check whether a command is pending in any queue
    pub fn is_pending(&self, identity: &CommandIdentity) -> bool {
        self.queues
            .iter()
            .any(|q| q.lock().pending.iter().any(|e| &e.identity == identity))
    }

    fn find(&self, name: &str) -> Option<&CommandQueue> {
        self.queues.iter().find(|q| q.config.name == name)
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn publish_update(&self, queue: &CommandQueue, inner: &QueueInner) {
        self.publish(QueueEvent::QueueUpdated(queue.info_locked(inner)));
    }

    /// Resolve the queue for a command.
    ///
    /// An explicit target must exist. Otherwise the first queue whose issuer
    /// filter matches and whose minimum level is not above the command's
    /// significance is chosen.
    pub fn select(
        &self,
        target: Option<&str>,
        issuer: &Issuer,
        significance: Significance,
    ) -> Result<String, AdmissionError> {
        if let Some(name) = target {
            return self
                .find(name)
                .map(|q| q.config.name.clone())
                .ok_or_else(|| AdmissionError::UnknownQueue(name.to_string()));
        }
        self.queues
            .iter()
            .find(|q| {
                q.config.matches_issuer(&issuer.user, &issuer.groups)
                    && q.config.min_level <= significance
            })
            .map(|q| q.config.name.clone())
            .ok_or(AdmissionError::NoMatchingQueue)
    }

    /// Admit a command to a queue
    pub(crate) fn admit(
        &self,
        queue_name: &str,
        identity: &CommandIdentity,
        override_block: bool,
        inbox: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> Result<Admission, AdmissionError> {
        let queue = self
            .find(queue_name)
            .ok_or_else(|| AdmissionError::UnknownQueue(queue_name.to_string()))?;
        // entries are only added here, so the check holds until the push
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_pending(identity) {
            return Err(AdmissionError::DuplicateCommand(identity.to_string()));
        }
        let mut inner = queue.lock();

        let (admission, status) = match inner.state {
            QueueState::Disabled => {
                return Err(AdmissionError::Disabled {
                    queue: queue_name.to_string(),
                })
            }
            QueueState::Blocked
                if queue.config.blocked_policy == BlockedPolicy::Reject && !override_block =>
            {
                return Err(AdmissionError::Blocked {
                    queue: queue_name.to_string(),
                })
            }
            QueueState::Blocked => (Admission::Hold, EntryStatus::Held),
            QueueState::Enabled => (Admission::Release, EntryStatus::Releasing),
        };

        inner.pending.push_back(QueueEntry {
            identity: identity.clone(),
            status,
            inbox,
        });
        debug!(queue = %queue_name, command = %identity, admission = ?admission, "Command admitted");
        self.publish(QueueEvent::CommandAdded {
            queue: queue_name.to_string(),
            command: identity.clone(),
        });
        self.publish_update(queue, &inner);
        Ok(admission)
    }

    /// Remove a command whose lifecycle reached its release decision.
    ///
    /// Returns the queue name, or `None` if an operator or a state change
    /// already removed it (a cancellation is then waiting in its inbox).
    pub(crate) fn remove(&self, identity: &CommandIdentity) -> Option<String> {
        for queue in &self.queues {
            let mut inner = queue.lock();
            if let Some(pos) = inner.pending.iter().position(|e| &e.identity == identity) {
                inner.pending.remove(pos);
                self.publish_update(queue, &inner);
                return Some(queue.config.name.clone());
            }
        }
        None
    }

    /// Operator release of a held command
    pub(crate) fn release(
        &self,
        identity: &CommandIdentity,
        rebuild: bool,
    ) -> Result<oneshot::Receiver<()>, QueueError> {
        for queue in &self.queues {
            let mut inner = queue.lock();
            let Some(pos) = inner.pending.iter().position(|e| &e.identity == identity) else {
                continue;
            };
            if inner.pending[pos].status != EntryStatus::Held {
                return Err(QueueError::NotHeld {
                    command: identity.to_string(),
                    queue: queue.config.name.clone(),
                });
            }

            let (done_tx, done_rx) = oneshot::channel();
            let event = LifecycleEvent::Release {
                rebuild,
                done: Some(done_tx),
            };
            if inner.pending[pos].inbox.send(event).is_err() {
                warn!(command = %identity, "Lifecycle task gone, dropping queue entry");
                inner.pending.remove(pos);
                return Err(QueueError::CommandNotFound(identity.to_string()));
            }
            inner.pending[pos].status = EntryStatus::Releasing;
            info!(queue = %queue.config.name, command = %identity, rebuild, "Command released by operator");
            return Ok(done_rx);
        }
        Err(QueueError::CommandNotFound(identity.to_string()))
    }

    /// Operator rejection of a pending command
    pub(crate) fn reject(&self, identity: &CommandIdentity, user: &str) -> Result<String, QueueError> {
        let reason = format!("Rejected by {}", user);
        for queue in &self.queues {
            let mut inner = queue.lock();
            let Some(pos) = inner.pending.iter().position(|e| &e.identity == identity) else {
                continue;
            };
            if let Some(entry) = inner.pending.remove(pos) {
                if entry.inbox.send(LifecycleEvent::Cancel { message: reason.clone() }).is_err() {
                    debug!(command = %identity, "Lifecycle task already finished");
                }
            }
            info!(queue = %queue.config.name, command = %identity, user, "Command rejected by operator");
            self.publish(QueueEvent::CommandRejected {
                queue: queue.config.name.clone(),
                command: identity.clone(),
                reason,
            });
            self.publish_update(queue, &inner);
            return Ok(queue.config.name.clone());
        }
        Err(QueueError::CommandNotFound(identity.to_string()))
    }

    /// Change a queue's state.
    ///
    /// Enabling hands back the held commands so the caller can release them
    /// one at a time; disabling cancels every pending command.
    pub(crate) fn set_state(&self, name: &str, state: QueueState) -> Result<StateChange, QueueError> {
        let queue = self
            .find(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))?;
        let mut inner = queue.lock();
        let previous = inner.state;
        let mut to_release = Vec::new();

        if previous != state {
            inner.state = state;
            info!(queue = %name, from = %previous, to = %state, "Queue state changed");
            match state {
                QueueState::Enabled => {
                    for entry in inner.pending.iter_mut() {
                        if entry.status == EntryStatus::Held {
                            entry.status = EntryStatus::Releasing;
                            to_release.push(ReleaseTicket {
                                identity: entry.identity.clone(),
                                inbox: entry.inbox.clone(),
                            });
                        }
                    }
                }
                QueueState::Disabled => {
                    for entry in inner.pending.drain(..) {
                        let _ = entry.inbox.send(LifecycleEvent::Cancel {
                            message: "Queue disabled".to_string(),
                        });
                        self.publish(QueueEvent::CommandRejected {
                            queue: name.to_string(),
                            command: entry.identity,
                            reason: "Queue disabled".to_string(),
                        });
                    }
                }
                QueueState::Blocked => {}
            }
        }

        let expiration = match queue.config.state_expiration_secs {
            Some(secs) if state != queue.config.state => {
                inner.expiration_generation += 1;
                Some((secs, inner.expiration_generation, queue.config.state))
            }
            _ => {
                // returning to the default state cancels any pending expiration
                inner.expiration_generation += 1;
                None
            }
        };

        self.publish_update(queue, &inner);
        Ok(StateChange {
            to_release,
            expiration,
        })
    }

    /// Check whether a scheduled expiration is still the latest one
    pub(crate) fn expiration_is_current(&self, name: &str, generation: u64) -> bool {
        self.find(name)
            .map(|q| q.lock().expiration_generation == generation)
            .unwrap_or(false)
    }

    /// Snapshot of one queue
    pub fn queue(&self, name: &str) -> Option<QueueInfo> {
        self.find(name).map(|q| {
            let inner = q.lock();
            q.info_locked(&inner)
        })
    }

    /// Snapshots of all queues in configuration order
    pub fn queues(&self) -> Vec<QueueInfo> {
        self.queues
            .iter()
            .map(|q| {
                let inner = q.lock();
                q.info_locked(&inner)
            })
            .collect()
    }

    /// Find the pending command with this sequence number
    pub fn find_pending(&self, sequence_number: u32) -> Option<CommandIdentity> {
        self.queues.iter().find_map(|q| {
            q.lock()
                .pending
                .iter()
                .find(|e| e.identity.sequence_number == sequence_number)
                .map(|e| e.identity.clone())
        })
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
