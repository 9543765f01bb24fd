//! Shared fixtures for the scenario tests

use cmdflow_commanding::{
    ChannelUplink, CommandDictionary, CommandOptions, Commanding, PreparedCommand, TelemetryBus,
    Uplink, UplinkError,
};
use cmdflow_core::{CommandIdentity, QueueConfig, QueueState, Value};
use cmdflow_history::{
    keys, HistoryAttribute, HistoryError, HistoryFilter, HistoryLog, HistoryStore,
    HistorySubscription, MemoryHistoryStore, SubscriberSettings,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

pub const ALLOW_TC1: &str = "/REFMDB/SUBSYS1/AllowCriticalTC1";
pub const ALLOW_TC2: &str = "/REFMDB/SUBSYS1/AllowCriticalTC2";
pub const VERIF_ACK: &str = "/REFMDB/tm2/CONT_VERIF_TC_ACK";
pub const ALGO_EXECUTION: &str = "/REFMDB/SUBSYS1/AlgoExecutionResult";
pub const ALGO_COMPLETE: &str = "/REFMDB/SUBSYS1/AlgoCompleteResult";

/// Reference dictionary used by every scenario
pub const REFERENCE_DICTIONARY: &str = r#"
[[commands]]
name = "/REFMDB/SUBSYS1/ONE_INT_ARG_TC"

[[commands.arguments]]
name = "uint32_arg"
type = "integer"
min = 0
default = 1

[[commands]]
name = "/REFMDB/SUBSYS1/CRITICAL_TC1"
significance = "critical"

[[commands.arguments]]
name = "p1"
type = "integer"

[[commands.constraints]]
criteria = { compare = { left = { parameter = "/REFMDB/SUBSYS1/AllowCriticalTC1" }, op = "==", right = { literal = true } } }
timeout_ms = 0

[[commands]]
name = "/REFMDB/SUBSYS1/CRITICAL_TC2"
significance = "critical"

[[commands.arguments]]
name = "p1"
type = "integer"

[[commands.constraints]]
criteria = { compare = { left = { parameter = "/REFMDB/SUBSYS1/AllowCriticalTC2" }, op = "==", right = { literal = true } } }
timeout_ms = 2000

[[commands]]
name = "/REFMDB/SUBSYS1/CONT_VERIF_TC"

[[commands.verifiers]]
stage = "Execution"
window = { stop_ms = 1000 }
check = { container = { name = "/REFMDB/tm2/CONT_VERIF_TC_ACK", fields = { stage = "Execution" } } }

[[commands.verifiers]]
stage = "Complete"
window = { stop_ms = 1000 }
check = { container = { name = "/REFMDB/tm2/CONT_VERIF_TC_ACK", fields = { stage = "Complete" } } }

[[commands]]
name = "/REFMDB/SUBSYS1/DELAYED_VERIF_TC"

[[commands.verifiers]]
stage = "Execution"
window = { stop_ms = 1000 }
check = { container = { name = "/REFMDB/tm2/CONT_VERIF_TC_ACK", fields = { stage = "Execution" } } }

[[commands.verifiers]]
stage = "Complete"
window = { start_ms = 500, stop_ms = 1500, relative_to = "last_verifier" }
check = { container = { name = "/REFMDB/tm2/CONT_VERIF_TC_ACK", fields = { stage = "Complete" } } }

[[commands]]
name = "/REFMDB/SUBSYS1/ALG_VERIF_TC"

[[commands.arguments]]
name = "p1"
type = "integer"

[[commands.arguments]]
name = "p2"
type = "integer"

[[commands.verifiers]]
stage = "Execution"
window = { stop_ms = 5000 }
check = { algorithm = { compare = { left = { parameter = "/REFMDB/SUBSYS1/AlgoExecutionResult" }, op = "==", right = { argument = "p1" } } } }

[[commands.verifiers]]
stage = "Complete"
window = { stop_ms = 5000 }
check = { algorithm = { compare = { left = { parameter = "/REFMDB/SUBSYS1/AlgoCompleteResult" }, op = "==", right = { argument = "p2" } } } }
"#;

/// Longest a scenario waits for a history attribute
const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Commanding service wired to an in-process bus and a channel uplink
pub struct Harness {
    pub service: Commanding,
    pub bus: Arc<TelemetryBus>,
    pub sent: mpsc::UnboundedReceiver<PreparedCommand>,
    next_sequence: AtomicU32,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// One enabled `default` queue
    pub fn new() -> Self {
        Self::with_queues(&[QueueConfig::new("default", QueueState::Enabled)])
    }

    pub fn with_queues(queues: &[QueueConfig]) -> Self {
        let (uplink, sent) = ChannelUplink::channel();
        Self::build(
            queues,
            HistoryLog::new(SubscriberSettings::default()),
            Arc::new(uplink),
            sent,
        )
    }

    /// Custom history log and uplink; `sent` never receives anything
    pub fn with_collaborators(history: HistoryLog, uplink: Arc<dyn Uplink>) -> Self {
        let (_tx, sent) = mpsc::unbounded_channel();
        Self::build(
            &[QueueConfig::new("default", QueueState::Enabled)],
            history,
            uplink,
            sent,
        )
    }

    fn build(
        queues: &[QueueConfig],
        history: HistoryLog,
        uplink: Arc<dyn Uplink>,
        sent: mpsc::UnboundedReceiver<PreparedCommand>,
    ) -> Self {
        let dictionary = CommandDictionary::from_toml_str(REFERENCE_DICTIONARY)
            .expect("reference dictionary parses");
        let bus = Arc::new(TelemetryBus::new());
        let service = Commanding::new(
            queues,
            Arc::new(history),
            Arc::new(dictionary),
            uplink,
            bus.clone(),
        );
        Self {
            service,
            bus,
            sent,
            next_sequence: AtomicU32::new(1),
        }
    }

    /// Subscribe to every attribute from now on
    pub fn watch(&self) -> Watcher {
        Watcher {
            sub: self.service.subscribe_history(HistoryFilter::All),
            seen: Vec::new(),
        }
    }

    pub fn issue(
        &self,
        name: &str,
        args: &[(&str, Value)],
        options: CommandOptions,
    ) -> PreparedCommand {
        self.try_issue(name, args, options)
            .unwrap_or_else(|e| panic!("issue {} failed: {}", name, e))
    }

    pub fn try_issue(
        &self,
        name: &str,
        args: &[(&str, Value)],
        options: CommandOptions,
    ) -> Result<PreparedCommand, cmdflow_commanding::CommandingError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.service
            .issue_command(name, arguments(args), "integration", sequence, options)
    }

    /// Publish a `CONT_VERIF_TC_ACK` container for a stage
    pub fn ack_stage(&self, stage: &str) {
        let mut fields = BTreeMap::new();
        fields.insert("stage".to_string(), Value::from(stage));
        self.bus.publish_container(VERIF_ACK, fields);
    }
}

pub fn arguments(args: &[(&str, Value)]) -> BTreeMap<String, Value> {
    args.iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Accumulates history attributes and waits for specific ones
pub struct Watcher {
    sub: HistorySubscription,
    seen: Vec<HistoryAttribute>,
}

impl Watcher {
    /// Wait until `name` = `value` was recorded for the command
    pub async fn until(
        &mut self,
        id: &CommandIdentity,
        name: &str,
        value: &str,
    ) -> Vec<HistoryAttribute> {
        let expected = Value::from(value);
        let found = timeout(WAIT_LIMIT, async {
            loop {
                if self
                    .seen
                    .iter()
                    .any(|a| &a.command_id == id && a.name == name && a.value == expected)
                {
                    return;
                }
                match self.sub.recv().await {
                    Some(attr) => self.seen.push(attr),
                    None => panic!("history subscription closed"),
                }
            }
        })
        .await;
        if found.is_err() {
            panic!(
                "timed out waiting for {}={} on {}; got {:?}",
                name,
                value,
                id,
                statuses(&self.history(id))
            );
        }
        self.history(id)
    }

    /// Wait for the command's completion record
    pub async fn until_complete(&mut self, id: &CommandIdentity) -> Vec<HistoryAttribute> {
        let time_key = keys::time(keys::COMMAND_COMPLETE);
        let found = timeout(WAIT_LIMIT, async {
            loop {
                if self
                    .seen
                    .iter()
                    .any(|a| &a.command_id == id && a.name == time_key)
                {
                    return;
                }
                match self.sub.recv().await {
                    Some(attr) => self.seen.push(attr),
                    None => panic!("history subscription closed"),
                }
            }
        })
        .await;
        if found.is_err() {
            panic!(
                "timed out waiting for completion of {}; got {:?}",
                id,
                statuses(&self.history(id))
            );
        }
        // the message is appended together with the status
        while let Some(attr) = self.sub.try_recv() {
            self.seen.push(attr);
        }
        self.history(id)
    }

    /// Everything delivered so far, without waiting
    pub fn drain(&mut self) -> Vec<HistoryAttribute> {
        while let Some(attr) = self.sub.try_recv() {
            self.seen.push(attr);
        }
        self.seen.clone()
    }

    /// Everything seen so far for one command, in order
    pub fn history(&self, id: &CommandIdentity) -> Vec<HistoryAttribute> {
        self.seen
            .iter()
            .filter(|a| &a.command_id == id)
            .cloned()
            .collect()
    }
}

/// `(key, status)` for every `<key>_Status` attribute, in order
pub fn statuses(attrs: &[HistoryAttribute]) -> Vec<(String, String)> {
    attrs
        .iter()
        .filter_map(|a| {
            let key = a.name.strip_suffix(keys::STATUS_SUFFIX)?;
            Some((key.to_string(), a.value.to_string()))
        })
        .collect()
}

/// Expected `(key, status)` pairs for comparison with [`statuses`]
pub fn stages(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Value of `<key>_Message`, if recorded
pub fn message(attrs: &[HistoryAttribute], key: &str) -> Option<String> {
    let name = keys::message(key);
    attrs
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.value.to_string())
}

/// Check that exactly one completion status exists
pub fn completion_count(attrs: &[HistoryAttribute]) -> usize {
    let name = keys::status(keys::COMMAND_COMPLETE);
    attrs.iter().filter(|a| a.name == name).count()
}

/// Uplink that refuses every command
pub struct BrokenUplink;

impl Uplink for BrokenUplink {
    fn send_tc(&self, _command: &PreparedCommand) -> Result<(), UplinkError> {
        Err(UplinkError::Unavailable("link down".to_string()))
    }
}

/// Memory store that refuses attributes with a given name
pub struct FailingStore {
    inner: MemoryHistoryStore,
    refuse: String,
}

impl FailingStore {
    pub fn refusing(name: impl Into<String>) -> Self {
        Self {
            inner: MemoryHistoryStore::new(),
            refuse: name.into(),
        }
    }
}

impl HistoryStore for FailingStore {
    fn append(&mut self, attr: &HistoryAttribute) -> Result<(), HistoryError> {
        if attr.name == self.refuse {
            return Err(HistoryError::Storage("disk full".to_string()));
        }
        self.inner.append(attr)
    }

    fn query(&self, id: &CommandIdentity) -> Result<Vec<HistoryAttribute>, HistoryError> {
        self.inner.query(id)
    }
}
