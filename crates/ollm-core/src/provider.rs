//! The model provider's streaming-chat contract, as consumed by the core.
//!
//! The provider adapter itself — request construction, HTTP transport,
//! retries, model management — lives outside this crate. Only the
//! streaming-chat shape is specified here, because the chat compressor's
//! summarize path is the sole internal consumer.

use crate::message::Message;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// A request to stream a chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier to route the request to.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<Message>,
}

/// One event in a provider's chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A chunk of assistant text.
    Text(String),
    /// The stream finished normally.
    Finish {
        /// Provider-reported finish reason.
        reason: String,
    },
    /// The provider reported an error mid-stream.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Error returned when a provider cannot even start streaming.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is not configured or reachable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// The minimal contract an external model provider adapter must satisfy.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream a chat completion for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the stream cannot be started at all.
    /// Mid-stream failures are surfaced as [`ProviderEvent::Error`] instead.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError>;
}
