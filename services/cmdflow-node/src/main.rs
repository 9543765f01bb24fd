use anyhow::{anyhow, bail, Context, Result};
use cmdflow_commanding::{CommandDictionary, Commanding, LoggingUplink, TelemetryBus};
use cmdflow_core::{logging, CommandIdentity, Config};
use cmdflow_history::{HistoryFilter, HistoryLog, HistorySubscription};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

mod console;

use console::ConsoleCommand;

const NODE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

struct Node {
    service: Commanding,
    telemetry: Arc<TelemetryBus>,
    origin: String,
    next_sequence: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = match parse_config_path(&args)? {
        Some(path) => {
            let config = Config::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            logging::init_with(&config.logging);
            config
        }
        None => {
            logging::init();
            info!("No --config given, using the built-in defaults");
            Config::default_config()
        }
    };

    let dictionary = match &config.node.dictionary_path {
        Some(path) => CommandDictionary::from_file(path)?,
        None => {
            warn!("No dictionary_path configured, every command will be rejected");
            CommandDictionary::new()
        }
    };
    let history = Arc::new(HistoryLog::from_config(&config.history)?);
    let telemetry = Arc::new(TelemetryBus::new());
    let service = Commanding::new(
        &config.queues,
        history,
        Arc::new(dictionary),
        Arc::new(LoggingUplink::new()),
        telemetry.clone(),
    );
    info!(
        node_id = %config.node.node_id,
        queues = config.queues.len(),
        "cmdflow node started"
    );

    let printer = tokio::spawn(print_history(service.subscribe_history(HistoryFilter::All)));
    let monitor = tokio::spawn(watch_queues(service.queue_event_stream()));

    let mut node = Node {
        service,
        telemetry,
        origin: config.node.node_id.clone(),
        next_sequence: 1,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match console::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = node.execute(command).await {
                    eprintln!("error: {:#}", e);
                }
            }
            Err(e) => eprintln!("error: {:#}", e),
        }
    }

    info!("cmdflow node shutting down");
    printer.abort();
    monitor.abort();
    Ok(())
}

impl Node {
    async fn execute(&mut self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Issue {
                name,
                args,
                options,
            } => {
                let sequence = self.next_sequence;
                let prepared =
                    self.service
                        .issue_command(&name, args, &self.origin, sequence, options)?;
                self.next_sequence += 1;
                eprintln!("issued {} as seq {}", prepared.identity.name, sequence);
            }
            ConsoleCommand::Telemetry(values) => {
                for (name, value) in values {
                    self.telemetry.publish_parameter(name, value);
                }
            }
            ConsoleCommand::Packet { container, fields } => {
                self.telemetry.publish_container(container, fields);
            }
            ConsoleCommand::SetQueue { queue, state } => {
                let info = self.service.set_queue_state(&queue, state).await?;
                println!("{}", serde_json::to_string(&info)?);
            }
            ConsoleCommand::Release { sequence, rebuild } => {
                let identity = self.pending(sequence)?;
                self.service.release_command(&identity, rebuild).await?;
            }
            ConsoleCommand::Reject { sequence } => {
                let identity = self.pending(sequence)?;
                self.service.reject_command(&identity, &self.origin)?;
            }
            ConsoleCommand::Queues => {
                for info in self.service.queues() {
                    println!("{}", serde_json::to_string(&info)?);
                }
            }
            ConsoleCommand::Help => eprintln!("{}", console::HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    fn pending(&self, sequence: u32) -> Result<CommandIdentity> {
        self.service
            .find_pending(sequence)
            .ok_or_else(|| anyhow!("no pending command with sequence number {}", sequence))
    }
}

async fn print_history(mut subscription: HistorySubscription) {
    while let Some(attr) = subscription.recv().await {
        match serde_json::to_string(&attr) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to encode history attribute"),
        }
    }
    if subscription.dropped() > 0 {
        warn!(dropped = subscription.dropped(), "History printer lost attributes");
    }
}

async fn watch_queues(mut events: BroadcastStream<cmdflow_commanding::QueueEvent>) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => debug!(event = ?event, "Queue event"),
            Err(e) => warn!(error = %e, "Queue monitor lagging"),
        }
    }
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }
    Ok(None)
}
