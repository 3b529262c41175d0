//! Session entities shared between the store and the orchestration layer.

use crate::message::{Message, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A full conversation session, as persisted by the session store.
///
/// Field order matches the on-disk canonical order: `sessionId, startTime,
/// lastActivity, model, provider, messages, toolCalls, metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// UUIDv4, unique per store.
    pub session_id: Uuid,
    /// When the session was created.
    pub start_time: DateTime<Utc>,
    /// Timestamp of the most recent recorded message or tool call.
    pub last_activity: DateTime<Utc>,
    /// Model identifier, e.g. `"llama3.1:8b"`.
    pub model: String,
    /// Provider identifier, e.g. `"ollama"`.
    pub provider: String,
    /// Conversation messages, append-only in normal operation.
    pub messages: Vec<Message>,
    /// Tool calls made during the session, append-only.
    pub tool_calls: Vec<ToolCall>,
    /// Session metadata.
    pub metadata: SessionMetadata,

    /// Unknown fields from older or newer session files, preserved on
    /// round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    /// Construct a freshly created session.
    #[must_use]
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            start_time: now,
            last_activity: now,
            model: model.into(),
            provider: provider.into(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            metadata: SessionMetadata::default(),
            extra: serde_json::Map::new(),
        }
    }

    /// Summarize the session for listing.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            start_time: self.start_time,
            last_activity: self.last_activity,
            model: self.model.clone(),
            message_count: self.messages.len(),
            token_count: self.metadata.token_count,
        }
    }
}

/// Per-session bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Approximate token count of the live (possibly compressed) transcript.
    pub token_count: usize,
    /// Number of compression operations applied with metadata supplied.
    pub compression_count: u64,
    /// History of compression strategy names applied, oldest first.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mode_history: Option<Vec<String>>,
}

/// A lightweight view of a [`Session`], derived and never stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub session_id: Uuid,
    /// Creation time.
    pub start_time: DateTime<Utc>,
    /// Most recent activity time.
    pub last_activity: DateTime<Utc>,
    /// Model identifier.
    pub model: String,
    /// Number of recorded messages.
    pub message_count: usize,
    /// Approximate token count.
    pub token_count: usize,
}
