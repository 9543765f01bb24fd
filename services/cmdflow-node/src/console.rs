//! Line-oriented operator console

use anyhow::{anyhow, bail, Context, Result};
use cmdflow_commanding::{CheckWindow, CommandOptions, Issuer};
use cmdflow_core::{QueueState, Value};
use std::collections::BTreeMap;

pub const HELP: &str = "\
commands:
  issue <NAME> [arg=value ...] [--queue Q] [--user U] [--comment TEXT]
        [--no-constraints] [--no-verifiers] [--skip STAGE]
        [--window STAGE=START:STOP] [--override-block]
  tm <param>=<value> ...
  packet <container> [field=value ...]
  queue <name> <enabled|blocked|disabled>
  release <seq> [rebuild]
  reject <seq>
  queues
  help
  quit";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Issue {
        name: String,
        args: BTreeMap<String, Value>,
        options: CommandOptions,
    },
    Telemetry(Vec<(String, Value)>),
    Packet {
        container: String,
        fields: BTreeMap<String, Value>,
    },
    SetQueue {
        queue: String,
        state: QueueState,
    },
    Release {
        sequence: u32,
        rebuild: bool,
    },
    Reject {
        sequence: u32,
    },
    Queues,
    Help,
    Quit,
}

fn assignment(token: &str) -> Result<(String, Value)> {
    let (key, value) = token
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got '{}'", token))?;
    if key.is_empty() {
        bail!("empty name in '{}'", token);
    }
    Ok((key.to_string(), Value::parse_literal(value)))
}

fn sequence(token: Option<&str>) -> Result<u32> {
    let token = token.ok_or_else(|| anyhow!("missing sequence number"))?;
    token
        .parse()
        .with_context(|| format!("invalid sequence number '{}'", token))
}

fn window(token: &str) -> Result<(String, CheckWindow)> {
    let (stage, range) = token
        .split_once('=')
        .ok_or_else(|| anyhow!("expected STAGE=START:STOP, got '{}'", token))?;
    let (start, stop) = range
        .split_once(':')
        .ok_or_else(|| anyhow!("expected START:STOP, got '{}'", range))?;
    Ok((
        stage.to_string(),
        CheckWindow::new(start.parse()?, stop.parse()?),
    ))
}

fn flag_value<'a>(tokens: &mut impl Iterator<Item = &'a str>, flag: &str) -> Result<String> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} needs a value", flag))
}

fn parse_issue<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Result<ConsoleCommand> {
    let name = tokens
        .next()
        .ok_or_else(|| anyhow!("missing command name"))?
        .to_string();
    let mut args = BTreeMap::new();
    let mut options = CommandOptions::default();

    while let Some(token) = tokens.next() {
        match token {
            "--queue" => options.queue = Some(flag_value(&mut tokens, token)?),
            "--user" => options.issuer = Issuer::user(flag_value(&mut tokens, token)?),
            "--comment" => options.comment = Some(flag_value(&mut tokens, token)?),
            "--no-constraints" => options.disable_transmission_constraints = true,
            "--no-verifiers" => options.disable_all_verifiers = true,
            "--override-block" => options.override_block = true,
            "--skip" => options = options.disable_verifier(flag_value(&mut tokens, token)?),
            "--window" => {
                let (stage, w) = window(&flag_value(&mut tokens, token)?)?;
                options = options.verifier_window(stage, w);
            }
            flag if flag.starts_with("--") => bail!("unknown option '{}'", flag),
            _ => {
                let (key, value) = assignment(token)?;
                args.insert(key, value);
            }
        }
    }

    Ok(ConsoleCommand::Issue {
        name,
        args,
        options,
    })
}

/// Parse one console line; blank lines and `#` comments yield `None`
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut tokens = line.split_whitespace();
    let Some(verb) = tokens.next() else {
        return Ok(None);
    };

    let command = match verb {
        "issue" => parse_issue(tokens)?,
        "tm" => {
            let values = tokens.map(assignment).collect::<Result<Vec<_>>>()?;
            if values.is_empty() {
                bail!("tm needs at least one param=value");
            }
            ConsoleCommand::Telemetry(values)
        }
        "packet" => {
            let container = tokens
                .next()
                .ok_or_else(|| anyhow!("missing container name"))?
                .to_string();
            let fields = tokens.map(assignment).collect::<Result<BTreeMap<_, _>>>()?;
            ConsoleCommand::Packet { container, fields }
        }
        "queue" => {
            let queue = tokens
                .next()
                .ok_or_else(|| anyhow!("missing queue name"))?
                .to_string();
            let state = tokens
                .next()
                .ok_or_else(|| anyhow!("missing queue state"))?
                .parse::<QueueState>()
                .map_err(|e| anyhow!("{}", e))?;
            ConsoleCommand::SetQueue { queue, state }
        }
        "release" => {
            let sequence = sequence(tokens.next())?;
            let rebuild = match tokens.next() {
                None => false,
                Some("rebuild") => true,
                Some(other) => bail!("unexpected '{}'", other),
            };
            ConsoleCommand::Release { sequence, rebuild }
        }
        "reject" => ConsoleCommand::Reject {
            sequence: sequence(tokens.next())?,
        },
        "queues" => ConsoleCommand::Queues,
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command '{}', try 'help'", other),
    };
    Ok(Some(command))
}
