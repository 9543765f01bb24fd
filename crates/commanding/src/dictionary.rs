//! TOML command dictionary standing in for the mission database

use crate::criteria::Literal;
use crate::error::MdbError;
use crate::mdb::{
    CommandPreparation, ConstraintDefinition, MissionDatabase, VerifierDefinition,
};
use cmdflow_core::{Significance, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Argument type and range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArgumentType {
    /// Signed integer with optional inclusive bounds
    Integer {
        /// Lower bound
        #[serde(default)]
        min: Option<i64>,
        /// Upper bound
        #[serde(default)]
        max: Option<i64>,
    },
    /// Float with optional inclusive bounds
    Float {
        /// Lower bound
        #[serde(default)]
        min: Option<f64>,
        /// Upper bound
        #[serde(default)]
        max: Option<f64>,
    },
    /// String with optional maximum length
    String {
        /// Maximum length in characters
        #[serde(default)]
        max_len: Option<usize>,
    },
    /// Boolean
    Boolean,
    /// One of a fixed set of labels
    Enumeration {
        /// Allowed labels
        values: Vec<String>,
    },
}

/// Argument of a command definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    /// Argument name
    pub name: String,
    /// Type and range
    #[serde(flatten)]
    pub kind: ArgumentType,
    /// Value used when the argument is not supplied
    #[serde(default)]
    pub default: Option<Literal>,
}

impl ArgumentDefinition {
    fn validate(&self, value: &Value) -> Result<Value, MdbError> {
        let fail = |reason: String| MdbError::ArgumentValidation {
            argument: self.name.clone(),
            reason,
        };
        match (&self.kind, value) {
            (ArgumentType::Integer { min, max }, Value::Int(_) | Value::UInt(_)) => {
                let v = match *value {
                    Value::UInt(u) => i64::try_from(u)
                        .map_err(|_| fail(format!("{} does not fit a signed integer", u)))?,
                    Value::Int(i) => i,
                    _ => return Err(fail(format!("type mismatch: {}", value))),
                };
                if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                    return Err(fail(format!(
                        "{} out of range [{}, {}]",
                        v,
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("+inf".to_string(), |m| m.to_string())
                    )));
                }
                Ok(Value::Int(v))
            }
            (ArgumentType::Float { min, max }, v) => {
                let f = v
                    .as_f64()
                    .ok_or_else(|| fail(format!("type mismatch: {} is not a number", v)))?;
                if min.is_some_and(|m| f < m) || max.is_some_and(|m| f > m) {
                    return Err(fail(format!("{} out of range", f)));
                }
                Ok(Value::Float(f))
            }
            (ArgumentType::String { max_len }, Value::String(s)) => {
                if max_len.is_some_and(|m| s.chars().count() > m) {
                    return Err(fail(format!("string longer than {} characters", max_len.unwrap_or(0))));
                }
                Ok(value.clone())
            }
            (ArgumentType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ArgumentType::Enumeration { values }, Value::String(s)) => {
                if values.iter().any(|v| v == s) {
                    Ok(value.clone())
                } else {
                    Err(fail(format!("'{}' is not one of {:?}", s, values)))
                }
            }
            (kind, value) => Err(fail(format!("type mismatch: {} for {:?}", value, kind))),
        }
    }
}

/// A command definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Qualified name, e.g. `/REFMDB/SUBSYS1/CRITICAL_TC1`
    pub name: String,
    /// Significance level
    #[serde(default)]
    pub significance: Significance,
    /// Queue the command is routed to
    #[serde(default)]
    pub queue: Option<String>,
    /// Arguments
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
    /// Transmission constraints
    #[serde(default)]
    pub constraints: Vec<ConstraintDefinition>,
    /// Verifiers in declared order
    #[serde(default)]
    pub verifiers: Vec<VerifierDefinition>,
    /// Users allowed to send the command; empty means everyone
    #[serde(default)]
    pub privileged_users: Vec<String>,
}

impl CommandDefinition {
    /// Last path segment of the qualified name
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct DictionaryFile {
    #[serde(default)]
    commands: Vec<CommandDefinition>,
}

/// Command definitions indexed by qualified and short name
#[derive(Debug, Default, Clone)]
pub struct CommandDictionary {
    commands: BTreeMap<String, CommandDefinition>,
    aliases: HashMap<String, Option<String>>,
}

impl CommandDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a dictionary from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, MdbError> {
        let file: DictionaryFile =
            toml::from_str(text).map_err(|e| MdbError::Load(e.to_string()))?;
        let mut dictionary = Self::new();
        for command in file.commands {
            dictionary.insert(command);
        }
        Ok(dictionary)
    }

    /// Load a dictionary file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, MdbError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MdbError::Load(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let dictionary = Self::from_toml_str(&text)?;
        info!(path = %path.as_ref().display(), commands = dictionary.len(), "Loaded command dictionary");
        Ok(dictionary)
    }

    /// Add or replace a definition
    pub fn insert(&mut self, definition: CommandDefinition) {
        let short = definition.short_name().to_string();
        let qualified = definition.name.clone();
        // ambiguous short names resolve to nothing
        self.aliases
            .entry(short)
            .and_modify(|existing| {
                if existing.as_deref() != Some(qualified.as_str()) {
                    *existing = None;
                }
            })
            .or_insert_with(|| Some(qualified.clone()));
        self.commands.insert(qualified, definition);
    }

    /// Look up by qualified or unambiguous short name
    pub fn get(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.get(name).or_else(|| {
            self.aliases
                .get(name)
                .and_then(|q| q.as_ref())
                .and_then(|q| self.commands.get(q))
        })
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl MissionDatabase for CommandDictionary {
    fn prepare(
        &self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<CommandPreparation, MdbError> {
        let definition = self
            .get(name)
            .ok_or_else(|| MdbError::InvalidIdentification(name.to_string()))?;

        for supplied in args.keys() {
            if !definition.arguments.iter().any(|a| &a.name == supplied) {
                return Err(MdbError::ArgumentValidation {
                    argument: supplied.clone(),
                    reason: format!("unknown argument for {}", definition.name),
                });
            }
        }

        let mut assignments = BTreeMap::new();
        for arg in &definition.arguments {
            let value = match (args.get(&arg.name), &arg.default) {
                (Some(v), _) => v.clone(),
                (None, Some(default)) => Value::from(default),
                (None, None) => {
                    return Err(MdbError::ArgumentValidation {
                        argument: arg.name.clone(),
                        reason: "no value supplied and no default".to_string(),
                    })
                }
            };
            assignments.insert(arg.name.clone(), arg.validate(&value)?);
        }

        let payload = serde_json::to_vec(&(&definition.name, &assignments))
            .map_err(|e| MdbError::Encoding(e.to_string()))?;

        Ok(CommandPreparation {
            qualified_name: definition.name.clone(),
            payload,
            significance: definition.significance,
            queue: definition.queue.clone(),
            assignments,
            constraints: definition.constraints.clone(),
            verifiers: definition.verifiers.clone(),
            privileged_users: definition.privileged_users.clone(),
        })
    }
}
