//! Subprocess execution.
//!
//! Spawns a child process with a sanitized environment, streams its
//! stdout/stderr line by line to an optional callback, and enforces a hard
//! wall-clock timeout, an idle timeout (no output for N milliseconds), and
//! cooperative cancellation via a [`CancellationToken`]. `background: true`
//! detaches the child and returns as soon as it's spawned.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use ollm_env::EnvSanitizer;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BACKGROUND_STARTED_MESSAGE: &str = "Background process started";

/// Which stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of output as it's produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Which stream this line came from.
    pub stream: StreamKind,
    /// The line's text, without its trailing newline.
    pub text: String,
}

/// Options for a single [`ShellExecutor::execute`] call.
pub struct CommandOptions {
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
    /// Extra variables merged over the inherited environment before
    /// sanitization. Take precedence over inherited values with the same key.
    pub env: BTreeMap<String, String>,
    /// Hard wall-clock timeout for the whole command.
    pub timeout: Option<Duration>,
    /// Timeout since the last byte of output was observed on either stream.
    pub idle_timeout: Option<Duration>,
    /// If true, spawn and return immediately without waiting for exit or
    /// capturing output.
    pub background: bool,
    /// Cooperative cancellation; cancelling it kills the child.
    pub cancellation_token: Option<CancellationToken>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            idle_timeout: None,
            background: false,
            cancellation_token: None,
        }
    }
}

/// Result of a [`ShellExecutor::execute`] call.
///
/// `output` interleaves stdout and stderr in the order lines actually
/// arrived; `error` is a standalone copy of stderr, present only when
/// stderr produced anything. For `background` commands, `exit_code` is
/// `0` and `output` is the literal string `"Background process started"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code. Non-zero is a normal outcome, not an error.
    pub exit_code: i32,
    /// Interleaved stdout and stderr, newline-joined, in arrival order.
    pub output: String,
    /// Copy of everything written to stderr, if anything was.
    pub error: Option<String>,
    /// OS process id of the spawned child, when known.
    pub process_id: Option<u32>,
}

/// Errors raised by [`ShellExecutor::execute`].
#[derive(Debug, Error)]
pub enum ShellError {
    /// The command could not be spawned, or the spawned process could not
    /// be waited on.
    #[error("failed to spawn command: {0}")]
    SpawnFailed(std::io::Error),
    /// The command exceeded its hard timeout and was killed.
    #[error("timed out after {}ms", .0.as_millis())]
    CommandTimedOut(Duration),
    /// The command produced no output for longer than its idle timeout and
    /// was killed.
    #[error("idle timeout after {}ms of no output", .0.as_millis())]
    CommandIdleTimedOut(Duration),
    /// The command was cancelled via its [`CancellationToken`] and was killed.
    #[error("command cancelled")]
    CommandCancelled,
}

/// Runs subprocesses with a sanitized environment.
pub struct ShellExecutor {
    sanitizer: Arc<EnvSanitizer>,
}

impl ShellExecutor {
    /// Build an executor backed by `sanitizer`.
    #[must_use]
    pub fn new(sanitizer: Arc<EnvSanitizer>) -> Self {
        Self { sanitizer }
    }

    fn build_command(&self, command: &str, args: &[String], options: &CommandOptions) -> Command {
        let mut cmd = Command::new(command);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut merged: BTreeMap<String, String> = std::env::vars().collect();
        merged.extend(options.env.clone());
        let sanitized = self.sanitizer.sanitize(&merged);
        cmd.env_clear();
        cmd.envs(sanitized);

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run `command` with `args`.
    ///
    /// `on_output` is invoked at least once per line observed on either
    /// stream; a panicking or slow callback is the caller's problem, not
    /// ours, but a callback that merely returns normally never affects
    /// whether the command itself succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::SpawnFailed`] if the process can't be started,
    /// [`ShellError::CommandTimedOut`] / [`ShellError::CommandIdleTimedOut`]
    /// if a configured timeout elapses, or [`ShellError::CommandCancelled`]
    /// if `options.cancellation_token` is cancelled before exit. In every
    /// error case but `SpawnFailed` the child is killed before returning.
    /// A non-zero exit code is reported in `CommandOutput::exit_code`, not
    /// as an `Err`.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: CommandOptions,
        mut on_output: Option<Box<dyn FnMut(OutputChunk) + Send>>,
    ) -> Result<CommandOutput, ShellError> {
        let mut cmd = self.build_command(command, args, &options);
        let mut child = cmd.spawn().map_err(ShellError::SpawnFailed)?;
        let process_id = child.id();

        if options.background {
            debug!(command, pid = process_id, "spawned background command, detaching");
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(CommandOutput {
                exit_code: 0,
                output: BACKGROUND_STARTED_MESSAGE.to_string(),
                error: None,
                process_id,
            });
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut combined = String::new();
        let mut stderr_copy = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let deadline = options.timeout.map(|d| Instant::now() + d);
        let mut idle_deadline = options.idle_timeout.map(|d| Instant::now() + d);
        let cancel = options.cancellation_token.clone().unwrap_or_default();

        loop {
            let hard_sleep = async {
                if let Some(deadline) = deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            };
            let idle_sleep = async {
                if let Some(deadline) = idle_deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            };

            tokio::select! {
                () = hard_sleep, if deadline.is_some() => {
                    let _ = child.start_kill();
                    return Err(ShellError::CommandTimedOut(options.timeout.expect("deadline implies timeout")));
                }
                () = idle_sleep, if idle_deadline.is_some() => {
                    let _ = child.start_kill();
                    return Err(ShellError::CommandIdleTimedOut(options.idle_timeout.expect("idle_deadline implies idle_timeout")));
                }
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return Err(ShellError::CommandCancelled);
                }
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line.map_err(ShellError::SpawnFailed)? {
                        Some(text) => {
                            if let Some(idle) = options.idle_timeout {
                                idle_deadline = Some(Instant::now() + idle);
                            }
                            combined.push_str(&text);
                            combined.push('\n');
                            if let Some(cb) = on_output.as_mut() {
                                cb(OutputChunk { stream: StreamKind::Stdout, text });
                            }
                        },
                        None => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line.map_err(ShellError::SpawnFailed)? {
                        Some(text) => {
                            if let Some(idle) = options.idle_timeout {
                                idle_deadline = Some(Instant::now() + idle);
                            }
                            combined.push_str(&text);
                            combined.push('\n');
                            stderr_copy.push_str(&text);
                            stderr_copy.push('\n');
                            if let Some(cb) = on_output.as_mut() {
                                cb(OutputChunk { stream: StreamKind::Stderr, text });
                            }
                        },
                        None => stderr_done = true,
                    }
                }
                status = child.wait(), if stdout_done && stderr_done => {
                    let status = status.map_err(ShellError::SpawnFailed)?;
                    return Ok(CommandOutput {
                        exit_code: status.code().unwrap_or(-1),
                        output: combined,
                        error: if stderr_copy.is_empty() { None } else { Some(stderr_copy) },
                        process_id,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn executor() -> ShellExecutor {
        ShellExecutor::new(Arc::new(EnvSanitizer::new()))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = executor()
            .execute(
                "sh",
                &["-c".to_string(), "echo hello".to_string()],
                CommandOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.error, None);
        assert!(result.process_id.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_not_an_error() {
        let result = executor()
            .execute("sh", &["-c".to_string(), "exit 7".to_string()], CommandOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn stderr_is_interleaved_into_output_and_copied_into_error() {
        let result = executor()
            .execute(
                "sh",
                &["-c".to_string(), "echo out; echo err 1>&2".to_string()],
                CommandOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert_eq!(result.error.as_deref(), Some("err\n"));
    }

    #[tokio::test]
    async fn streams_output_to_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        executor()
            .execute(
                "sh",
                &["-c".to_string(), "echo one; echo two".to_string()],
                CommandOptions::default(),
                Some(Box::new(move |chunk: OutputChunk| {
                    seen_clone.lock().unwrap().push(chunk.text);
                })),
            )
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn hard_timeout_kills_long_running_command() {
        let options = CommandOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let err = executor()
            .execute("sleep", &["5".to_string()], options, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::CommandTimedOut(_)));
        assert!(err.to_string().contains("timed out after"));
    }

    #[tokio::test]
    async fn idle_timeout_kills_silent_command() {
        let options = CommandOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let err = executor()
            .execute("sleep", &["5".to_string()], options, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::CommandIdleTimedOut(_)));
        assert!(err.to_string().contains("idle timeout after"));
    }

    #[tokio::test]
    async fn cancellation_token_kills_command() {
        let token = CancellationToken::new();
        let child_token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            child_token.cancel();
        });
        let options = CommandOptions {
            cancellation_token: Some(token),
            ..Default::default()
        };
        let err = executor()
            .execute("sleep", &["5".to_string()], options, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::CommandCancelled));
    }

    #[tokio::test]
    async fn background_command_returns_immediately_with_started_message() {
        let options = CommandOptions {
            background: true,
            ..Default::default()
        };
        let result = executor()
            .execute("sleep", &["5".to_string()], options, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, BACKGROUND_STARTED_MESSAGE);
        assert!(result.process_id.is_some());
    }

    #[tokio::test]
    async fn secrets_are_stripped_from_child_environment() {
        let mut env = BTreeMap::new();
        env.insert("OLLM_TEST_SECRET_TOKEN".to_string(), "should-not-leak".to_string());
        let options = CommandOptions {
            env,
            ..Default::default()
        };
        let result = executor()
            .execute(
                "sh",
                &["-c".to_string(), "echo $OLLM_TEST_SECRET_TOKEN".to_string()],
                options,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.output, "\n");
    }
}
