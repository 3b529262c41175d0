//! Chat history compression.
//!
//! Three stateless strategies shrink a message history under a token
//! budget while preserving the leading system anchor (if any) and the
//! most recent message. Token counts are never measured by a real
//! tokenizer — every strategy and every test uses the same
//! `ceil(chars / 4) + 10` approximation.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use futures::StreamExt;
use ollm_core::message::Part;
use ollm_core::{ChatProvider, ChatRequest, Message, MessageRole, SessionMetadata};
use thiserror::Error;

/// Compression strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Drop oldest non-anchor messages until the budget is met.
    Truncate,
    /// Replace the body with one provider- or placeholder-generated summary.
    Summarize,
    /// Drop the oldest body messages outright, summarize the rest.
    Hybrid,
}

impl Strategy {
    /// Parse a strategy name from external configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::InvalidStrategy`] for anything other than
    /// `"truncate"`, `"summarize"`, or `"hybrid"`.
    pub fn parse(name: &str) -> Result<Self, CompressionError> {
        match name {
            "truncate" => Ok(Self::Truncate),
            "summarize" => Ok(Self::Summarize),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(CompressionError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Errors raised by [`compress`].
#[derive(Debug, Error)]
pub enum CompressionError {
    /// `options.strategy` did not name a known strategy.
    #[error("invalid compression strategy: {0}")]
    InvalidStrategy(String),
}

/// Configuration consumed by [`compress`].
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Which strategy to run.
    pub strategy: Strategy,
    /// Ceiling for the preserved recent-message tail (used by hybrid).
    pub preserve_recent_tokens: usize,
    /// Overall token budget the compressed output should fit.
    pub target_tokens: usize,
    /// Fraction of `tokenLimit` at which [`should_compress`] trips.
    pub threshold: f64,
}

/// Result of a single [`compress`] call.
#[derive(Debug, Clone)]
pub struct CompressResult {
    /// The compressed message list.
    pub compressed_messages: Vec<Message>,
    /// Token count of the input.
    pub original_token_count: usize,
    /// Token count of the output.
    pub compressed_token_count: usize,
    /// The strategy that ran.
    pub strategy: Strategy,
    /// Updated session metadata, present iff the caller supplied metadata.
    pub metadata: Option<SessionMetadata>,
}

/// Approximate token cost of a single message: `ceil(text_len / 4) + 10`.
#[must_use]
pub fn estimate_tokens(message: &Message) -> usize {
    let text_len: usize = message
        .parts
        .iter()
        .filter_map(Part::as_text)
        .map(str::len)
        .sum();
    text_len.div_ceil(4) + 10
}

/// Sum of [`estimate_tokens`] over a message list.
#[must_use]
pub fn sum_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// `sum_tokens(messages) >= token_limit * threshold`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn should_compress(messages: &[Message], token_limit: usize, threshold: f64) -> bool {
    (sum_tokens(messages) as f64) >= (token_limit as f64) * threshold
}

fn has_anchor(messages: &[Message]) -> bool {
    messages.first().is_some_and(|m| m.role == MessageRole::System)
}

/// Drop oldest non-anchor messages, one at a time, until `sum_tokens` is
/// within `target_tokens` or only the anchor and the most recent message
/// remain.
#[must_use]
pub fn truncate(messages: &[Message], target_tokens: usize) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let anchor_count = usize::from(has_anchor(messages));
    let mut kept = messages.to_vec();

    while sum_tokens(&kept) > target_tokens && kept.len() > anchor_count + 1 {
        kept.remove(anchor_count);
    }

    kept
}

/// Greedily select, from the end of `rest`, the largest tail whose token
/// sum does not exceed `budget`. Always keeps at least the final message.
fn select_tail_count(rest: &[Message], budget: usize) -> usize {
    if rest.is_empty() {
        return 0;
    }
    let mut count = 1;
    let mut total = estimate_tokens(&rest[rest.len() - 1]);
    while count < rest.len() {
        let candidate = &rest[rest.len() - 1 - count];
        let candidate_tokens = estimate_tokens(candidate);
        if total + candidate_tokens > budget {
            break;
        }
        total += candidate_tokens;
        count += 1;
    }
    count
}

async fn generate_summary(
    body: &[Message],
    model: &str,
    provider: Option<&dyn ChatProvider>,
) -> String {
    let count = body.len();
    let placeholder =
        format!("{count} messages compressed summary: earlier turns condensed to fit the context window");

    let Some(provider) = provider else {
        return placeholder;
    };

    let mut prompt_messages = body.to_vec();
    prompt_messages.push(Message::user(
        "Summarize the conversation above in a few sentences.",
    ));
    let request = ChatRequest {
        model: model.to_string(),
        messages: prompt_messages,
    };

    let Ok(mut stream) = provider.chat_stream(request).await else {
        return placeholder;
    };

    let mut text = String::new();
    let mut errored = false;
    while let Some(event) = stream.next().await {
        match event {
            ollm_core::ProviderEvent::Text(chunk) => text.push_str(&chunk),
            ollm_core::ProviderEvent::Error { .. } => {
                errored = true;
                break;
            },
            ollm_core::ProviderEvent::Finish { .. } => break,
        }
    }

    if errored || text.trim().is_empty() {
        placeholder
    } else {
        format!("{count} messages compressed summary: {}", text.trim())
    }
}

/// Replace the body (everything between the anchor and the preserved tail)
/// with a single summary message.
pub async fn summarize(
    messages: &[Message],
    target_tokens: usize,
    model: &str,
    provider: Option<&dyn ChatProvider>,
) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let anchor_count = usize::from(has_anchor(messages));
    let anchor = messages.first().filter(|_| anchor_count == 1).cloned();
    let rest = &messages[anchor_count..];

    if rest.is_empty() {
        return anchor.into_iter().collect();
    }

    let tail_count = select_tail_count(rest, target_tokens);
    let body_end = rest.len() - tail_count;
    let body = &rest[..body_end];
    let tail = &rest[body_end..];

    let mut out = Vec::new();
    out.extend(anchor);
    if !body.is_empty() {
        out.push(Message::system(generate_summary(body, model, provider).await));
    }
    out.extend_from_slice(tail);
    out
}

/// Drop the oldest body messages outright, then summarize what remains of
/// the body before the preserved tail.
pub async fn hybrid(
    messages: &[Message],
    preserve_recent_tokens: usize,
    target_tokens: usize,
    model: &str,
    provider: Option<&dyn ChatProvider>,
) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let anchor_count = usize::from(has_anchor(messages));
    let anchor = messages.first().filter(|_| anchor_count == 1).cloned();
    let rest = &messages[anchor_count..];

    if rest.is_empty() {
        return anchor.into_iter().collect();
    }

    let tail_count = select_tail_count(rest, preserve_recent_tokens);
    let body_end = rest.len() - tail_count;
    let body = &rest[..body_end];
    let tail = &rest[body_end..];

    let anchor_tokens = anchor.as_ref().map_or(0, estimate_tokens);
    let tail_tokens = sum_tokens(tail);
    let middle_budget = target_tokens.saturating_sub(anchor_tokens).saturating_sub(tail_tokens);

    let middle_count = select_tail_count(body, middle_budget);
    let middle_start = body.len() - middle_count;
    let middle = &body[middle_start..];
    // `body[..middle_start]` is dropped outright: too old to be worth the
    // tokens a summary sentence would still cost.

    let mut out = Vec::new();
    out.extend(anchor);
    if !middle.is_empty() {
        out.push(Message::system(generate_summary(middle, model, provider).await));
    }
    out.extend_from_slice(tail);
    out
}

/// Dispatch to the configured strategy and return token-count bookkeeping
/// alongside the compressed messages.
///
/// # Errors
///
/// Never fails on provider errors — those degrade to a placeholder summary
/// internally. The only error is a strategy outside `{truncate, summarize,
/// hybrid}`, which can't occur through [`Strategy`]'s own constructors but
/// is preserved here for callers that built a `CompressionConfig` from
/// untrusted configuration via [`Strategy::parse`].
pub async fn compress(
    messages: &[Message],
    options: &CompressionConfig,
    metadata: Option<SessionMetadata>,
    model: &str,
    provider: Option<&dyn ChatProvider>,
) -> Result<CompressResult, CompressionError> {
    let original_token_count = sum_tokens(messages);

    let compressed_messages = match options.strategy {
        Strategy::Truncate => truncate(messages, options.target_tokens),
        Strategy::Summarize => summarize(messages, options.target_tokens, model, provider).await,
        Strategy::Hybrid => {
            hybrid(
                messages,
                options.preserve_recent_tokens,
                options.target_tokens,
                model,
                provider,
            )
            .await
        },
    };

    let compressed_token_count = sum_tokens(&compressed_messages);

    let metadata = metadata.map(|m| SessionMetadata {
        token_count: compressed_token_count,
        compression_count: m.compression_count + 1,
        mode_history: m.mode_history,
    });

    Ok(CompressResult {
        compressed_messages,
        original_token_count,
        compressed_token_count,
        strategy: options.strategy,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use ollm_core::{ProviderError, ProviderEvent};

    fn filler(n: usize) -> String {
        "x".repeat(n)
    }

    fn conversation(anchor: bool, body_len: usize) -> Vec<Message> {
        let mut messages = Vec::new();
        if anchor {
            messages.push(Message::system("You are a helpful assistant."));
        }
        for i in 0..body_len {
            let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
            messages.push(Message::text(role, filler(100)));
        }
        messages
    }

    #[test]
    fn should_compress_matches_formula() {
        let messages = conversation(true, 10);
        let total = sum_tokens(&messages);
        assert!(should_compress(&messages, total, 1.0));
        assert!(!should_compress(&messages, total * 10, 1.0));
    }

    #[test]
    fn truncate_preserves_anchor_and_last_message() {
        let messages = conversation(true, 40);
        let out = truncate(&messages, 200);
        assert_eq!(out.first(), messages.first());
        assert_eq!(out.last(), messages.last());
        assert!(sum_tokens(&out) <= sum_tokens(&messages));
    }

    #[test]
    fn truncate_empty_is_empty() {
        assert!(truncate(&[], 100).is_empty());
    }

    #[test]
    fn truncate_stops_at_anchor_plus_last() {
        let messages = conversation(true, 40);
        let out = truncate(&messages, 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], messages[0]);
        assert_eq!(out[1], *messages.last().unwrap());
    }

    #[tokio::test]
    async fn summarize_without_provider_uses_placeholder() {
        let messages = conversation(true, 20);
        let out = summarize(&messages, 50, "test-model", None).await;
        assert_eq!(out.first(), messages.first());
        assert_eq!(out.last(), messages.last());
        let summary = out.iter().skip(1).find(|m| m.role == MessageRole::System).unwrap();
        let text = summary.text_content();
        assert!(text.contains("summary"));
        assert!(text.contains("messages compressed"));
    }

    struct ErrorProvider;

    #[async_trait]
    impl ChatProvider for ErrorProvider {
        async fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
            Ok(Box::pin(stream::iter(vec![ProviderEvent::Error {
                message: "boom".into(),
            }])))
        }
    }

    #[tokio::test]
    async fn summarize_falls_back_to_placeholder_on_provider_error() {
        let messages = conversation(true, 20);
        let provider = ErrorProvider;
        let out = summarize(&messages, 50, "test-model", Some(&provider)).await;
        let text = out[1].text_content();
        assert!(text.contains("summary"));
        assert!(text.contains("messages compressed"));
    }

    struct TextProvider;

    #[async_trait]
    impl ChatProvider for TextProvider {
        async fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
            Ok(Box::pin(stream::iter(vec![
                ProviderEvent::Text("the user asked about Rust".into()),
                ProviderEvent::Finish { reason: "stop".into() },
            ])))
        }
    }

    #[tokio::test]
    async fn summarize_uses_provider_text_when_available() {
        let messages = conversation(true, 20);
        let provider = TextProvider;
        let out = summarize(&messages, 50, "test-model", Some(&provider)).await;
        let text = out[1].text_content();
        assert!(text.contains("the user asked about Rust"));
        assert!(text.contains("messages compressed"));
    }

    #[tokio::test]
    async fn hybrid_preserves_anchor_and_last_message() {
        let messages = conversation(true, 60);
        let out = hybrid(&messages, 500, 1000, "test-model", None).await;
        assert_eq!(out.first(), messages.first());
        assert_eq!(out.last(), messages.last());
        assert!(sum_tokens(&out) < sum_tokens(&messages));
    }

    #[tokio::test]
    async fn compress_increments_compression_count() {
        let messages = conversation(true, 60);
        let options = CompressionConfig {
            strategy: Strategy::Hybrid,
            preserve_recent_tokens: 500,
            target_tokens: 1000,
            threshold: 0.8,
        };
        let metadata = SessionMetadata {
            token_count: 0,
            compression_count: 0,
            mode_history: None,
        };
        let result = compress(&messages, &options, Some(metadata), "test-model", None)
            .await
            .unwrap();
        assert_eq!(result.metadata.unwrap().compression_count, 1);
        assert!(result.compressed_token_count < result.original_token_count);
        assert_eq!(result.compressed_messages.first(), messages.first());
        assert_eq!(result.compressed_messages.last(), messages.last());
    }

    #[tokio::test]
    async fn compress_without_metadata_returns_none() {
        let messages = conversation(true, 10);
        let options = CompressionConfig {
            strategy: Strategy::Truncate,
            preserve_recent_tokens: 500,
            target_tokens: 1000,
            threshold: 0.8,
        };
        let result = compress(&messages, &options, None, "test-model", None).await.unwrap();
        assert!(result.metadata.is_none());
    }

    #[test]
    fn invalid_strategy_name_is_rejected() {
        assert!(matches!(
            Strategy::parse("nonsense"),
            Err(CompressionError::InvalidStrategy(_))
        ));
    }
}
