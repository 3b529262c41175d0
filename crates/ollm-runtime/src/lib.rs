//! Orchestration facade.
//!
//! Composes the session store, loop detector, context manager, chat
//! compressor, and shell executor around a single conversational turn, the
//! way a caller embedding this runtime would. Tool execution other than the
//! shell, and the wire protocol to a model server, live outside this crate;
//! [`ollm_core::ChatProvider`] is the only seam into a model.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use futures::StreamExt;
use ollm_compression::{CompressionConfig, CompressionError};
use ollm_context::ContextManager;
use ollm_core::{
    ChatProvider, ChatRequest, LoopPattern, Message, ProviderError, ProviderEvent, Session, ToolCall,
    ToolCallResult,
};
use ollm_loop::LoopDetector;
use ollm_sessions::{SessionStore, SessionStoreError};
use ollm_shell::{CommandOptions, OutputChunk, ShellError, ShellExecutor};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors raised while orchestrating a turn.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A loop was already detected before this turn started; no provider
    /// call was made.
    #[error("execution already stopped: {0:?}")]
    ExecutionStopped(LoopPattern),
    /// The session store rejected an operation.
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    /// The compressor's configuration was invalid.
    #[error(transparent)]
    Compression(#[from] CompressionError),
    /// The provider could not start streaming at all.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The provider reported an error mid-stream.
    #[error("provider stream error: {0}")]
    ProviderStream(String),
    /// A shell tool invocation failed.
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Outcome of a single [`Orchestrator::run_turn`] call.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// The assistant's full reply text, if the provider was reached.
    pub assistant_text: Option<String>,
    /// Whether the compressor ran, and what it did.
    pub compressed: bool,
    /// Set if the loop detector tripped during or after this turn.
    pub loop_pattern: Option<LoopPattern>,
}

/// Composes C2 (loop detector), C3 (context manager), C4 (compressor), C5
/// (session store), and C7 (shell executor) around a turn against a
/// [`ChatProvider`].
pub struct Orchestrator {
    sessions: Arc<SessionStore>,
    shell: Arc<ShellExecutor>,
    loop_detector: Mutex<LoopDetector>,
    context: Mutex<ContextManager>,
    compression: CompressionConfig,
    token_limit: usize,
}

impl Orchestrator {
    /// Build an orchestrator over already-constructed components.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        shell: Arc<ShellExecutor>,
        loop_detector: LoopDetector,
        context: ContextManager,
        compression: CompressionConfig,
        token_limit: usize,
    ) -> Self {
        Self {
            sessions,
            shell,
            loop_detector: Mutex::new(loop_detector),
            context: Mutex::new(context),
            compression,
            token_limit,
        }
    }

    /// Create a new session via the session store.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionStoreError`] from the underlying create.
    pub async fn create_session(
        &self,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<Session, OrchestratorError> {
        Ok(self.sessions.create_session(model, provider).await?)
    }

    /// Mutable access to the shared context manager, e.g. for a caller that
    /// wants to add a hook- or extension-sourced fact before the next turn.
    pub fn context(&self) -> &Mutex<ContextManager> {
        &self.context
    }

    /// Run one conversational turn: append the user message, compress if
    /// over budget, stream the provider, and record the assistant's reply.
    ///
    /// If the loop detector already stopped execution, the provider is
    /// never called and [`OrchestratorError::ExecutionStopped`] is returned.
    /// A pattern detected as a *result* of this turn is instead reported in
    /// [`TurnResult::loop_pattern`] — the caller decides whether to stop.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] if the session is unknown, compression
    /// configuration is invalid, or the provider cannot be reached or
    /// errors mid-stream.
    pub async fn run_turn(
        &self,
        session_id: Uuid,
        user_text: &str,
        provider: &dyn ChatProvider,
    ) -> Result<TurnResult, OrchestratorError> {
        if let Some(pattern) = self.loop_detector.lock().unwrap().check_for_loop() {
            return Err(OrchestratorError::ExecutionStopped(pattern));
        }

        self.sessions
            .record_message(session_id, Message::user(user_text))
            .await?;
        let session = self.sessions.get_session(session_id).await?;

        let (working_messages, compressed) = self.maybe_compress(&session).await?;

        let turn_limit_pattern = {
            let mut detector = self.loop_detector.lock().unwrap();
            detector.record_turn();
            detector.check_for_loop()
        };
        if let Some(pattern) = turn_limit_pattern {
            return Ok(TurnResult {
                assistant_text: None,
                compressed,
                loop_pattern: Some(pattern),
            });
        }

        let prompt = self.context.lock().unwrap().get_system_prompt_additions();
        let mut request_messages = working_messages;
        if !prompt.is_empty() {
            request_messages.insert(0, Message::system(prompt));
        }

        let request = ChatRequest {
            model: session.model.clone(),
            messages: request_messages,
        };
        let mut stream = provider.chat_stream(request).await?;

        let mut assistant_text = String::new();
        let mut stream_error = None;
        while let Some(event) = stream.next().await {
            match event {
                ProviderEvent::Text(chunk) => assistant_text.push_str(&chunk),
                ProviderEvent::Finish { .. } => break,
                ProviderEvent::Error { message } => {
                    stream_error = Some(message);
                    break;
                },
            }
        }
        if let Some(message) = stream_error {
            return Err(OrchestratorError::ProviderStream(message));
        }

        self.sessions
            .record_message(session_id, Message::assistant(assistant_text.clone()))
            .await?;

        let loop_pattern = {
            let mut detector = self.loop_detector.lock().unwrap();
            detector.record_output(&assistant_text);
            detector.check_for_loop()
        };

        Ok(TurnResult {
            assistant_text: Some(assistant_text),
            compressed,
            loop_pattern,
        })
    }

    async fn maybe_compress(&self, session: &Session) -> Result<(Vec<Message>, bool), OrchestratorError> {
        if !ollm_compression::should_compress(&session.messages, self.token_limit, self.compression.threshold) {
            return Ok((session.messages.clone(), false));
        }

        let result = ollm_compression::compress(
            &session.messages,
            &self.compression,
            Some(session.metadata.clone()),
            &session.model,
            None,
        )
        .await?;

        let mut updated = session.clone();
        updated.messages = result.compressed_messages.clone();
        if let Some(metadata) = result.metadata {
            updated.metadata = metadata;
        }
        self.sessions.save_session(&updated).await?;

        Ok((result.compressed_messages, true))
    }

    /// Run a shell command as a tool call, recording it against the session
    /// and feeding both the call and its output through the loop detector.
    ///
    /// Returns the first [`LoopPattern`] observed, from either the call or
    /// its output, if one trips.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Shell`] if the command itself fails to
    /// run (spawn failure, timeout, idle timeout, cancellation).
    /// [`ShellError`] does not include a non-zero exit code; that's a
    /// normal, successful [`ollm_shell::CommandOutput`].
    pub async fn run_shell_tool(
        &self,
        session_id: Uuid,
        tool_name: &str,
        args: Value,
        command: &str,
        command_args: &[String],
        options: CommandOptions,
        on_output: Option<Box<dyn FnMut(OutputChunk) + Send>>,
    ) -> Result<(ollm_shell::CommandOutput, Option<LoopPattern>), OrchestratorError> {
        let output = self
            .shell
            .execute(command, command_args, options, on_output)
            .await?;

        let llm_content = output.output.clone();
        let tool_call = ToolCall::new(tool_name, args.clone(), ToolCallResult::new(llm_content.clone()));
        self.sessions.record_tool_call(session_id, tool_call).await?;

        let pattern = {
            let mut detector = self.loop_detector.lock().unwrap();
            detector.record_tool_call(tool_name, &args);
            if let Some(pattern) = detector.check_for_loop() {
                Some(pattern)
            } else {
                detector.record_output(&llm_content);
                detector.check_for_loop()
            }
        };

        if pattern.is_some() {
            warn!(tool_name, session_id = %session_id, "loop detector tripped after shell tool call");
        }

        Ok((output, pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use ollm_compression::Strategy;
    use ollm_core::MessageRole;
    use ollm_env::EnvSanitizer;
    use ollm_loop::LoopThresholds;

    struct EchoProvider;

    #[async_trait]
    impl ChatProvider for EchoProvider {
        async fn chat_stream(
            &self,
            request: ChatRequest,
        ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
            let reply = request
                .messages
                .last()
                .map(Message::text_content)
                .unwrap_or_default();
            Ok(Box::pin(stream::iter(vec![
                ProviderEvent::Text(format!("echo: {reply}")),
                ProviderEvent::Finish {
                    reason: "stop".to_string(),
                },
            ])))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        async fn chat_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
            Ok(Box::pin(stream::iter(vec![ProviderEvent::Error {
                message: "model server unavailable".to_string(),
            }])))
        }
    }

    fn orchestrator(dir: &std::path::Path, compression: CompressionConfig, token_limit: usize) -> Orchestrator {
        Orchestrator::new(
            Arc::new(SessionStore::new(dir, None)),
            Arc::new(ShellExecutor::new(Arc::new(EnvSanitizer::new()))),
            LoopDetector::new(LoopThresholds {
                max_turns: 50,
                repeat_threshold: 3,
            }),
            ContextManager::new(),
            compression,
            token_limit,
        )
    }

    fn compression_config() -> CompressionConfig {
        CompressionConfig {
            strategy: Strategy::Truncate,
            preserve_recent_tokens: 200,
            target_tokens: 500,
            threshold: 0.8,
        }
    }

    #[tokio::test]
    async fn run_turn_appends_messages_and_returns_reply() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), compression_config(), 100_000);
        let session = orchestrator.create_session("llama3.1:8b", "ollama").await.unwrap();

        let result = orchestrator
            .run_turn(session.session_id, "hello there", &EchoProvider)
            .await
            .unwrap();

        assert_eq!(result.assistant_text.as_deref(), Some("echo: hello there"));
        assert!(!result.compressed);
        assert!(result.loop_pattern.is_none());

        let stored = orchestrator.sessions.get_session(session.session_id).await.unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].role, MessageRole::User);
        assert_eq!(stored.messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn provider_stream_error_surfaces_as_orchestrator_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), compression_config(), 100_000);
        let session = orchestrator.create_session("m", "p").await.unwrap();

        let err = orchestrator
            .run_turn(session.session_id, "hi", &FailingProvider)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ProviderStream(_)));
    }

    #[tokio::test]
    async fn turn_compresses_when_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), compression_config(), 10);
        let session = orchestrator.create_session("m", "p").await.unwrap();

        let result = orchestrator
            .run_turn(session.session_id, "hello there", &EchoProvider)
            .await
            .unwrap();
        assert!(result.compressed);

        let stored = orchestrator.sessions.get_session(session.session_id).await.unwrap();
        assert!(stored.metadata.compression_count >= 1);
    }

    #[tokio::test]
    async fn turn_limit_stops_execution_without_calling_provider() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(SessionStore::new(dir.path(), None)),
            Arc::new(ShellExecutor::new(Arc::new(EnvSanitizer::new()))),
            LoopDetector::new(LoopThresholds {
                max_turns: 1,
                repeat_threshold: 3,
            }),
            ContextManager::new(),
            compression_config(),
            100_000,
        );
        let session = orchestrator.create_session("m", "p").await.unwrap();

        let result = orchestrator
            .run_turn(session.session_id, "turn one", &EchoProvider)
            .await
            .unwrap();
        assert!(result.loop_pattern.is_some());
        assert!(result.assistant_text.is_none());

        let err = orchestrator
            .run_turn(session.session_id, "turn two", &EchoProvider)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionStopped(_)));
    }

    #[tokio::test]
    async fn run_shell_tool_records_call_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), compression_config(), 100_000);
        let session = orchestrator.create_session("m", "p").await.unwrap();

        let (output, pattern) = orchestrator
            .run_shell_tool(
                session.session_id,
                "run_shell_command",
                serde_json::json!({"command": "echo hi"}),
                "sh",
                &["-c".to_string(), "echo hi".to_string()],
                CommandOptions::default(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(pattern.is_none());

        let stored = orchestrator.sessions.get_session(session.session_id).await.unwrap();
        assert_eq!(stored.tool_calls.len(), 1);
        assert_eq!(stored.tool_calls[0].name, "run_shell_command");
    }

    #[tokio::test]
    async fn repeated_identical_shell_tool_calls_trip_loop_detector() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(SessionStore::new(dir.path(), None)),
            Arc::new(ShellExecutor::new(Arc::new(EnvSanitizer::new()))),
            LoopDetector::new(LoopThresholds {
                max_turns: 50,
                repeat_threshold: 2,
            }),
            ContextManager::new(),
            compression_config(),
            100_000,
        );
        let session = orchestrator.create_session("m", "p").await.unwrap();
        let args = serde_json::json!({"command": "echo hi"});

        let (_, first) = orchestrator
            .run_shell_tool(
                session.session_id,
                "run_shell_command",
                args.clone(),
                "sh",
                &["-c".to_string(), "echo hi".to_string()],
                CommandOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert!(first.is_none());

        let (_, second) = orchestrator
            .run_shell_tool(
                session.session_id,
                "run_shell_command",
                args,
                "sh",
                &["-c".to_string(), "echo hi".to_string()],
                CommandOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert!(second.is_some());
    }
}
