//! Shared data model for the ollm agent runtime.
//!
//! Types here are passed between the session store, compressor, loop
//! detector, context manager, and the orchestration layer that wires them
//! together. Nothing in this crate touches disk or the network.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod context;
pub mod file;
pub mod loop_pattern;
pub mod message;
pub mod provider;
pub mod session;

pub use context::{ContextEntry, ContextSource};
pub use file::{FileEntry, FileKind};
pub use loop_pattern::{LoopPattern, LoopPatternKind};
pub use message::{Message, MessageRole, Part, ToolCall, ToolCallResult};
pub use provider::{ChatProvider, ChatRequest, ProviderError, ProviderEvent};
pub use session::{Session, SessionMetadata, SessionSummary};
