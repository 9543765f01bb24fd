//! The history log: ordered appends with live fan-out

use crate::attribute::{keys, AckStatus, HistoryAttribute};
use crate::error::HistoryError;
use crate::filter::HistoryFilter;
use crate::store::{HistoryStore, MemoryHistoryStore};
use cmdflow_core::{current_timestamp_ms, CommandIdentity, HistoryConfig, OverflowPolicy, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Per-subscriber buffering settings
#[derive(Debug, Clone, Copy)]
pub struct SubscriberSettings {
    /// Maximum buffered attributes per subscriber
    pub buffer: usize,
    /// What to do when the buffer is full
    pub overflow: OverflowPolicy,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            buffer: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl From<&HistoryConfig> for SubscriberSettings {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            buffer: config.subscriber_buffer.max(1),
            overflow: config.overflow,
        }
    }
}

struct SubscriberQueue {
    buffer: Mutex<VecDeque<HistoryAttribute>>,
    notify: Notify,
    closed: AtomicBool,
    detached: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<HistoryAttribute>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct Subscriber {
    id: u64,
    filter: HistoryFilter,
    queue: Arc<SubscriberQueue>,
}

struct Inner {
    store: Box<dyn HistoryStore>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Append-only command history with live subscribers.
///
/// Appends from any number of tasks are serialized by one lock, which also
/// covers fan-out; every subscriber therefore observes attributes in the
/// same order the store recorded them.
pub struct HistoryLog {
    inner: Mutex<Inner>,
    settings: SubscriberSettings,
}

impl HistoryLog {
    /// Create a log backed by an in-memory store
    pub fn new(settings: SubscriberSettings) -> Self {
        Self::with_store(Box::new(MemoryHistoryStore::new()), settings)
    }

    /// Create a log backed by the given store
    pub fn with_store(store: Box<dyn HistoryStore>, settings: SubscriberSettings) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store,
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            }),
            settings,
        }
    }

    /// Create a log from the `[history]` configuration section
    pub fn from_config(config: &HistoryConfig) -> Result<Self, HistoryError> {
        let settings = SubscriberSettings::from(config);
        match &config.sqlite_path {
            #[cfg(feature = "sqlite")]
            Some(path) => {
                let store = crate::store::SqliteHistoryStore::open(path)?;
                Ok(Self::with_store(Box::new(store), settings))
            }
            #[cfg(not(feature = "sqlite"))]
            Some(path) => Err(HistoryError::Storage(format!(
                "SQLite support not compiled in, cannot open {}",
                path.display()
            ))),
            None => Ok(Self::new(settings)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one attribute stamped with the current wall-clock time
    pub fn append(
        &self,
        id: &CommandIdentity,
        name: impl Into<String>,
        value: Value,
    ) -> Result<HistoryAttribute, HistoryError> {
        let attr = HistoryAttribute {
            command_id: id.clone(),
            name: name.into(),
            value,
            timestamp_ms: current_timestamp_ms(),
        };
        let mut inner = self.lock();
        self.append_locked(&mut inner, &attr)?;
        Ok(attr)
    }

    /// Append several attributes of one command without interleaving
    pub fn append_all(
        &self,
        id: &CommandIdentity,
        entries: Vec<(String, Value)>,
    ) -> Result<(), HistoryError> {
        let timestamp_ms = current_timestamp_ms();
        let mut inner = self.lock();
        for (name, value) in entries {
            let attr = HistoryAttribute {
                command_id: id.clone(),
                name,
                value,
                timestamp_ms,
            };
            self.append_locked(&mut inner, &attr)?;
        }
        Ok(())
    }

    /// Write an acknowledgment: `<key>_Status`, `<key>_Time` and optionally `<key>_Message`
    pub fn ack(
        &self,
        id: &CommandIdentity,
        key: &str,
        status: AckStatus,
        message: Option<&str>,
    ) -> Result<(), HistoryError> {
        let now = current_timestamp_ms();
        let mut entries = vec![
            (keys::status(key), Value::from(status.as_str())),
            (keys::time(key), Value::Timestamp(now)),
        ];
        if let Some(message) = message {
            entries.push((keys::message(key), Value::from(message)));
        }
        self.append_all(id, entries)
    }

    fn append_locked(&self, inner: &mut Inner, attr: &HistoryAttribute) -> Result<(), HistoryError> {
        if let Err(e) = inner.store.append(attr) {
            error!(command = %attr.command_id, attribute = %attr.name, error = %e, "History store append failed");
            return Err(e);
        }
        debug!(command = %attr.command_id, attribute = %attr.name, value = %attr.value, "History attribute appended");

        let settings = self.settings;
        inner.subscribers.retain(|sub| {
            if sub.queue.detached.load(Ordering::SeqCst) {
                debug!(subscriber = sub.id, "Removing detached history subscriber");
                return false;
            }
            if !sub.filter.matches(attr) {
                return true;
            }
            let mut buffer = sub.queue.buffer();
            if buffer.len() >= settings.buffer {
                match settings.overflow {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                        let dropped = sub.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 {
                            warn!(subscriber = sub.id, "History subscriber lagging, dropping oldest attributes");
                        }
                    }
                    OverflowPolicy::Disconnect => {
                        drop(buffer);
                        warn!(subscriber = sub.id, capacity = settings.buffer, "History subscriber overflowed, disconnecting");
                        sub.queue.close();
                        return false;
                    }
                }
            }
            buffer.push_back(attr.clone());
            drop(buffer);
            sub.queue.notify.notify_one();
            true
        });
        Ok(())
    }

    /// Subscribe to attributes appended from now on
    pub fn subscribe(&self, filter: HistoryFilter) -> HistorySubscription {
        let queue = Arc::new(SubscriberQueue::new(self.settings.buffer));
        let mut inner = self.lock();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            queue: queue.clone(),
        });
        info!(subscriber = id, "History subscriber registered");
        HistorySubscription { id, queue }
    }

    /// Remove a subscriber; its pending attributes remain readable
    pub fn unsubscribe(&self, subscriber_id: u64) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|sub| {
            if sub.id == subscriber_id {
                sub.queue.close();
                false
            } else {
                true
            }
        });
        before != inner.subscribers.len()
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.queue.detached.load(Ordering::SeqCst))
            .count()
    }

    /// All attributes of a command in append order
    pub fn query(&self, id: &CommandIdentity) -> Result<Vec<HistoryAttribute>, HistoryError> {
        self.lock().store.query(id)
    }

    /// Check whether the command has any recorded history
    pub fn contains(&self, id: &CommandIdentity) -> Result<bool, HistoryError> {
        self.lock().store.contains(id)
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(SubscriberSettings::default())
    }
}

impl Drop for HistoryLog {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for sub in inner.subscribers.drain(..) {
            sub.queue.close();
        }
    }
}

/// Receiving end of a history subscription.
///
/// Dropping the subscription unregisters it on the next append.
pub struct HistorySubscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

impl HistorySubscription {
    /// Subscriber identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next attribute; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<HistoryAttribute> {
        loop {
            if let Some(attr) = self.queue.buffer().pop_front() {
                return Some(attr);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next buffered attribute without waiting
    pub fn try_recv(&mut self) -> Option<HistoryAttribute> {
        self.queue.buffer().pop_front()
    }

    /// Number of attributes discarded because this subscriber lagged
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Check whether the log closed this subscription
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::SeqCst)
    }
}

impl Drop for HistorySubscription {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::SeqCst);
    }
}
