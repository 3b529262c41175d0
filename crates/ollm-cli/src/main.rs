//! `ollm`: a thin command-line front end over the ollm agent runtime.
//!
//! Wires the session store, shell executor, loop detector, context
//! manager, and compressor together through [`ollm_runtime::Orchestrator`].
//! There is no bundled model adapter: `chat` uses a local echo stand-in so
//! the rest of the pipeline (session persistence, compression, loop
//! detection) can be exercised without a running model server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::stream::{self, BoxStream};
use ollm_compression::{CompressionConfig, Strategy};
use ollm_context::ContextManager;
use ollm_core::{ChatProvider, ChatRequest, Message, ProviderError, ProviderEvent};
use ollm_discovery::{DiscoveryConfig, FileDiscoverer};
use ollm_env::EnvSanitizer;
use ollm_loop::{LoopDetector, LoopThresholds};
use ollm_runtime::Orchestrator;
use ollm_sessions::SessionStore;
use ollm_shell::{CommandOptions, ShellExecutor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ollm", about = "Local agent runtime: sessions, compression, shell tools, loop detection")]
struct Cli {
    /// Directory session files are stored under.
    #[arg(long, env = "OLLM_DATA_DIR", default_value = "./ollm-data")]
    data_dir: PathBuf,

    /// Approximate token budget before the compressor engages.
    #[arg(long, env = "OLLM_TOKEN_LIMIT", default_value_t = 8_000)]
    token_limit: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Session management.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Send one message through the orchestrator and print the reply.
    Chat {
        /// Existing session id; a new session is created if omitted.
        #[arg(long)]
        session: Option<Uuid>,
        /// Model identifier recorded on a newly created session.
        #[arg(long, default_value = "llama3.1:8b")]
        model: String,
        /// Provider identifier recorded on a newly created session.
        #[arg(long, default_value = "ollama")]
        provider: String,
        /// The message text.
        message: String,
    },
    /// Run a shell command as a tool call against a session.
    Run {
        /// Session id the call is recorded against.
        #[arg(long)]
        session: Uuid,
        /// Hard timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Run detached, returning immediately.
        #[arg(long)]
        background: bool,
        /// Command and arguments, e.g. `-- ls -la`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// List files under a root, honoring ignore files and built-in denies.
    Discover {
        /// Root directory to walk.
        root: PathBuf,
        /// Maximum depth below the root.
        #[arg(long)]
        max_depth: Option<usize>,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new, empty session.
    Create {
        #[arg(long, default_value = "llama3.1:8b")]
        model: String,
        #[arg(long, default_value = "ollama")]
        provider: String,
    },
    /// List sessions, most recently active first.
    List,
}

struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    async fn chat_stream(&self, request: ChatRequest) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
        let reply = request.messages.last().map(Message::text_content).unwrap_or_default();
        Ok(Box::pin(stream::iter(vec![
            ProviderEvent::Text(format!("echo: {reply}")),
            ProviderEvent::Finish {
                reason: "stop".to_string(),
            },
        ])))
    }
}

fn build_orchestrator(data_dir: &Path, token_limit: usize) -> Orchestrator {
    let sessions = Arc::new(SessionStore::new(data_dir, None));
    let shell = Arc::new(ShellExecutor::new(Arc::new(EnvSanitizer::new())));
    let loop_detector = LoopDetector::new(LoopThresholds::default());
    let context = ContextManager::new();
    let compression = CompressionConfig {
        strategy: Strategy::Truncate,
        preserve_recent_tokens: 2_000,
        target_tokens: token_limit,
        threshold: 0.8,
    };
    Orchestrator::new(sessions, shell, loop_detector, context, compression, token_limit)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli.data_dir, cli.token_limit);

    match cli.command {
        Command::Session { action } => match action {
            SessionAction::Create { model, provider } => {
                let session = orchestrator
                    .create_session(model, provider)
                    .await
                    .context("failed to create session")?;
                println!("{}", session.session_id);
            },
            SessionAction::List => {
                let store = SessionStore::new(cli.data_dir.as_path(), None);
                let summaries = store.list_sessions().await.context("failed to list sessions")?;
                for summary in summaries {
                    println!(
                        "{}  {}  messages={}  tokens={}",
                        summary.session_id, summary.model, summary.message_count, summary.token_count
                    );
                }
            },
        },
        Command::Chat {
            session,
            model,
            provider,
            message,
        } => {
            let session_id = match session {
                Some(id) => id,
                None => orchestrator.create_session(model, provider).await?.session_id,
            };
            let result = orchestrator.run_turn(session_id, &message, &EchoProvider).await?;
            if let Some(pattern) = &result.loop_pattern {
                eprintln!("warning: loop detector tripped: {pattern:?}");
            }
            match result.assistant_text {
                Some(text) => println!("{text}"),
                None => println!("(no reply: execution stopped before the model was called)"),
            }
        },
        Command::Run {
            session,
            timeout_ms,
            background,
            command,
        } => {
            let (program, args) = command.split_first().context("command must not be empty")?;
            let options = CommandOptions {
                timeout: timeout_ms.map(std::time::Duration::from_millis),
                background,
                ..Default::default()
            };
            let (output, pattern) = orchestrator
                .run_shell_tool(
                    session,
                    "run_shell_command",
                    serde_json::json!({"command": command.join(" ")}),
                    program,
                    args,
                    options,
                    None,
                )
                .await?;
            print!("{}", output.output);
            if let Some(pattern) = pattern {
                eprintln!("warning: loop detector tripped: {pattern:?}");
            }
            std::process::exit(output.exit_code);
        },
        Command::Discover { root, max_depth } => {
            let discoverer = FileDiscoverer::new(
                root,
                DiscoveryConfig {
                    max_depth,
                    ..Default::default()
                },
            )?;
            for entry in discoverer.discover_all()? {
                println!("{}", entry.relative_path.display());
            }
        },
    }

    Ok(())
}
