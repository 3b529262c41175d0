//! Context entry type used by the context manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a context entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    /// Added by a lifecycle hook.
    Hook,
    /// Added by an extension/plugin.
    Extension,
    /// Added explicitly by the user.
    User,
    /// Added by the system itself.
    System,
}

/// A single fact spliced into the system prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Unique identifier within the owning [`crate::provider`]-agnostic manager.
    pub key: String,
    /// Rendered text.
    pub content: String,
    /// Higher priority entries render first.
    pub priority: i64,
    /// Origin of the entry.
    pub source: ContextSource,
    /// When the entry was added.
    pub timestamp: DateTime<Utc>,
}
