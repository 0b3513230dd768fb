//! Task runner that executes an external command once per attempt.
//!
//! Protocol:
//! - params are written as JSON to the child's stdin and exported in
//!   `BATCHLOOP_PARAMS`
//! - exit 0 is a success; a JSON document on stdout becomes the next params,
//!   empty stdout reuses the current params
//! - exit [`EXPLICIT_END_CODE`] finishes the batch
//! - any other exit is a failure, reported with the last stderr line

use std::path::PathBuf;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{TaskOutcome, TaskRunner};

/// Environment variable carrying the params JSON.
pub const PARAMS_ENV: &str = "BATCHLOOP_PARAMS";

/// Exit code a command uses to request the end of the batch.
pub const EXPLICIT_END_CODE: i32 = 100;

/// Runs `program args...` for every attempt.
#[derive(Debug, Clone)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTask {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    /// Build from a `[program, args...]` list. Returns `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn execute(&self, payload: &str) -> std::io::Result<Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(PARAMS_ENV, payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout/stderr, otherwise a child that
        // fills its output pipe before reading input never makes progress.
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading stdin.
                let _ = stdin.write_all(payload.as_bytes()).await;
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    }
}

#[async_trait]
impl TaskRunner for CommandTask {
    #[instrument(level = "debug", skip(self, params), fields(program = %self.program))]
    async fn run(&self, params: &Value) -> TaskOutcome {
        let payload = params.to_string();
        let output = match self.execute(&payload).await {
            Ok(output) => output,
            Err(e) => {
                return TaskOutcome::failure(
                    format!("failed to run '{}': {}", self.program, e),
                    params.clone(),
                );
            }
        };
        debug!(status = ?output.status, "command exited");

        match output.status.code() {
            Some(0) => parse_success(&output.stdout, params),
            Some(EXPLICIT_END_CODE) => TaskOutcome::ExplicitEnd,
            Some(code) => TaskOutcome::failure(
                failure_message(&output.stderr, &format!("exited with status {code}")),
                params.clone(),
            ),
            None => TaskOutcome::failure(
                failure_message(&output.stderr, "terminated by signal"),
                params.clone(),
            ),
        }
    }
}

fn parse_success(stdout: &[u8], params: &Value) -> TaskOutcome {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return TaskOutcome::success(params.clone());
    }
    match serde_json::from_str(text) {
        Ok(next) => TaskOutcome::success(next),
        Err(e) => TaskOutcome::failure(format!("invalid JSON on stdout: {e}"), params.clone()),
    }
}

fn failure_message(stderr: &[u8], fallback: &str) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sh(script: &str) -> CommandTask {
        CommandTask::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandTask::from_argv(&[]).is_none());

        let task = CommandTask::from_argv(&["echo".to_string(), "hi".to_string()]).unwrap();
        assert_eq!(task.program, "echo");
        assert_eq!(task.args, vec!["hi".to_string()]);
    }

    #[test]
    fn test_failure_message_uses_last_stderr_line() {
        assert_eq!(
            failure_message(b"warming up\nconnection refused\n\n", "fallback"),
            "connection refused"
        );
        assert_eq!(failure_message(b"", "fallback"), "fallback");
    }

    #[test]
    fn test_parse_success_empty_stdout_reuses_params() {
        let params = json!({"page": 1});
        assert_eq!(
            parse_success(b"  \n", &params),
            TaskOutcome::Success(params.clone())
        );
    }

    #[test]
    fn test_parse_success_invalid_json_is_failure() {
        let outcome = parse_success(b"not json", &json!({}));
        assert!(matches!(outcome, TaskOutcome::Failure { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_json_becomes_next_params() {
        let outcome = sh("cat >/dev/null; echo '{\"page\": 2}'")
            .run(&json!({"page": 1}))
            .await;
        assert_eq!(outcome, TaskOutcome::Success(json!({"page": 2})));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_params_are_exported_in_env() {
        let outcome = sh("printf '%s' \"$BATCHLOOP_PARAMS\"")
            .run(&json!({"id": 7}))
            .await;
        assert_eq!(outcome, TaskOutcome::Success(json!({"id": 7})));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_params_are_written_to_stdin() {
        let outcome = sh("cat").run(&json!({"id": 9})).await;
        assert_eq!(outcome, TaskOutcome::Success(json!({"id": 9})));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure_with_stderr() {
        let params = json!({"id": 1});
        let outcome = sh("echo 'upstream timeout' >&2; exit 3").run(&params).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failure {
                message: "upstream timeout".to_string(),
                next: params,
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_explicit_end_code() {
        let outcome = sh("exit 100").run(&json!({})).await;
        assert_eq!(outcome, TaskOutcome::ExplicitEnd);
    }

    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let outcome = CommandTask::new("batchloop-definitely-missing-binary", vec![])
            .run(&json!({}))
            .await;
        match outcome {
            TaskOutcome::Failure { message, .. } => {
                assert!(message.contains("batchloop-definitely-missing-binary"))
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_payload_with_chatty_child_completes() {
        // Both sides exceed a pipe buffer: the child writes its output
        // before it reads any input.
        let params = json!({ "blob": "x".repeat(100_000) });
        let task = sh("head -c 200000 /dev/zero | tr '\\0' ' '; cat");

        let outcome = tokio::time::timeout(Duration::from_secs(30), task.run(&params))
            .await
            .expect("command task deadlocked");

        assert_eq!(outcome, TaskOutcome::Success(params));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.json"), "{\"page\": 4}").unwrap();

        let outcome = sh("cat >/dev/null; cat page.json")
            .with_working_dir(dir.path())
            .run(&json!({}))
            .await;

        assert_eq!(outcome, TaskOutcome::Success(json!({"page": 4})));
    }
}
