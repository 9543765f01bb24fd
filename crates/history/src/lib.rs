//! Command history log for cmdflow.
//!
//! An append-only, per-command ordered record of named status attributes.
//! Every append is persisted to a [`HistoryStore`] and fanned out to live
//! subscribers through bounded per-subscriber buffers; a slow subscriber
//! never backpressures the writer.

#![warn(missing_docs)]

pub mod attribute;
pub mod error;
pub mod filter;
pub mod log;
pub mod store;

pub use attribute::{keys, AckStatus, HistoryAttribute};
pub use error::HistoryError;
pub use filter::HistoryFilter;
pub use log::{HistoryLog, HistorySubscription, SubscriberSettings};
pub use store::{HistoryStore, MemoryHistoryStore};

#[cfg(feature = "sqlite")]
pub use store::SqliteHistoryStore;
