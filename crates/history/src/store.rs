//! Pluggable history storage
//!
//! The log serializes all store access behind its own lock, so stores only
//! need to be `Send`.

use crate::attribute::HistoryAttribute;
use crate::error::HistoryError;
use cmdflow_core::CommandIdentity;
use std::collections::HashMap;

/// Backing storage for history attributes
pub trait HistoryStore: Send {
    /// Persist one attribute after all previously appended ones
    fn append(&mut self, attr: &HistoryAttribute) -> Result<(), HistoryError>;

    /// All attributes of a command in append order
    fn query(&self, id: &CommandIdentity) -> Result<Vec<HistoryAttribute>, HistoryError>;

    /// Check whether any attribute exists for the command
    fn contains(&self, id: &CommandIdentity) -> Result<bool, HistoryError> {
        Ok(!self.query(id)?.is_empty())
    }
}

/// In-memory store, kept for the lifetime of the process
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: HashMap<CommandIdentity, Vec<HistoryAttribute>>,
}

impl MemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commands with at least one attribute
    pub fn command_count(&self) -> usize {
        self.records.len()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&mut self, attr: &HistoryAttribute) -> Result<(), HistoryError> {
        self.records
            .entry(attr.command_id.clone())
            .or_default()
            .push(attr.clone());
        Ok(())
    }

    fn query(&self, id: &CommandIdentity) -> Result<Vec<HistoryAttribute>, HistoryError> {
        Ok(self.records.get(id).cloned().unwrap_or_default())
    }

    fn contains(&self, id: &CommandIdentity) -> Result<bool, HistoryError> {
        Ok(self.records.contains_key(id))
    }
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use cmdflow_core::Value;
    use rusqlite::{params, Connection, OpenFlags};
    use std::path::Path;
    use tracing::info;

    /// SQLite-backed store
    ///
    /// Rows are keyed by an autoincrement sequence so that queries return
    /// attributes in append order.
    pub struct SqliteHistoryStore {
        conn: Connection,
    }

    impl SqliteHistoryStore {
        /// Open (or create) a database file
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
            let conn = Connection::open_with_flags(
                path.as_ref(),
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            let store = Self::with_connection(conn)?;
            info!(path = %path.as_ref().display(), "Opened SQLite command history");
            Ok(store)
        }

        /// Open a private in-memory database
        pub fn open_in_memory() -> Result<Self, HistoryError> {
            Self::with_connection(Connection::open_in_memory()?)
        }

        fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS command_history (
                    seq_no INTEGER PRIMARY KEY AUTOINCREMENT,
                    cmd_name TEXT NOT NULL,
                    cmd_seq INTEGER NOT NULL,
                    origin TEXT NOT NULL,
                    generation_time INTEGER NOT NULL,
                    attr_name TEXT NOT NULL,
                    attr_value TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_command_history_cmd
                 ON command_history(cmd_name, cmd_seq, origin, generation_time)",
                [],
            )?;
            Ok(Self { conn })
        }
    }

    impl HistoryStore for SqliteHistoryStore {
        fn append(&mut self, attr: &HistoryAttribute) -> Result<(), HistoryError> {
            let value = serde_json::to_string(&attr.value)?;
            self.conn.execute(
                "INSERT INTO command_history
                 (cmd_name, cmd_seq, origin, generation_time, attr_name, attr_value, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attr.command_id.name,
                    attr.command_id.sequence_number,
                    attr.command_id.origin,
                    attr.command_id.generation_time_ms as i64,
                    attr.name,
                    value,
                    attr.timestamp_ms as i64,
                ],
            )?;
            Ok(())
        }

        fn query(&self, id: &CommandIdentity) -> Result<Vec<HistoryAttribute>, HistoryError> {
            let mut stmt = self.conn.prepare(
                "SELECT attr_name, attr_value, timestamp_ms FROM command_history
                 WHERE cmd_name = ?1 AND cmd_seq = ?2 AND origin = ?3 AND generation_time = ?4
                 ORDER BY seq_no ASC",
            )?;
            let rows = stmt.query_map(
                params![
                    id.name,
                    id.sequence_number,
                    id.origin,
                    id.generation_time_ms as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?;

            let mut attrs = Vec::new();
            for row in rows {
                let (name, value, timestamp_ms) = row?;
                let value: Value = serde_json::from_str(&value)?;
                attrs.push(HistoryAttribute {
                    command_id: id.clone(),
                    name,
                    value,
                    timestamp_ms: timestamp_ms as u64,
                });
            }
            Ok(attrs)
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHistoryStore;
