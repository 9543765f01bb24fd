//! Subscription filters

use crate::attribute::HistoryAttribute;
use cmdflow_core::CommandIdentity;
use std::fmt;
use std::sync::Arc;

/// Selects which attributes a subscriber receives
#[derive(Clone)]
pub enum HistoryFilter {
    /// Every attribute
    All,
    /// Attributes of a single command
    Command(CommandIdentity),
    /// Attributes of every command with this qualified name
    CommandName(String),
    /// Arbitrary predicate
    Predicate(Arc<dyn Fn(&HistoryAttribute) -> bool + Send + Sync>),
}

impl HistoryFilter {
    /// Build a predicate filter
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&HistoryAttribute) -> bool + Send + Sync + 'static,
    {
        HistoryFilter::Predicate(Arc::new(f))
    }

    /// Check whether an attribute passes the filter
    pub fn matches(&self, attr: &HistoryAttribute) -> bool {
        match self {
            HistoryFilter::All => true,
            HistoryFilter::Command(id) => &attr.command_id == id,
            HistoryFilter::CommandName(name) => &attr.command_id.name == name,
            HistoryFilter::Predicate(f) => f(attr),
        }
    }
}

impl fmt::Debug for HistoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryFilter::All => f.write_str("All"),
            HistoryFilter::Command(id) => f.debug_tuple("Command").field(id).finish(),
            HistoryFilter::CommandName(n) => f.debug_tuple("CommandName").field(n).finish(),
            HistoryFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
