//! External-process assistant path.
//!
//! The assistant binary is always spawned with an argument vector; the prompt
//! is a single argv entry and never passes through a shell.

use crate::error::{AssistantError, Result};
use crate::sanitize::SanitizedMessage;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

const STDERR_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub program: String,
    /// Inserted before the `-p <prompt> --output-format json` tail.
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
            timeout: Duration::from_millis(15_000),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliInvoker {
    config: CliConfig,
}

impl CliInvoker {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn args_for(&self, prompt: &SanitizedMessage) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ]);
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.config.working_dir.as_ref() {
            cmd.current_dir(dir);
        }
        cmd
    }

    #[tracing::instrument(level = "info", skip_all, fields(program = %self.config.program))]
    pub async fn invoke(&self, prompt: &SanitizedMessage) -> Result<String> {
        let started = Instant::now();
        let args = self.args_for(prompt);
        let output = self.run(&args).await?;
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            exit_status = %output.status,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "assistant CLI finished"
        );

        if !output.status.success() {
            return Err(process_failed(&output));
        }

        extract_reply(&String::from_utf8_lossy(&output.stdout))
    }

    /// Spawns `<program> --version`, bounded by the same timeout.
    pub async fn probe_version(&self) -> Result<String> {
        let output = self.run(&["--version".to_string()]).await?;
        if !output.status.success() {
            return Err(process_failed(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        let mut child = self.command(args).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AssistantError::NotFound(self.config.program.clone())
            } else {
                AssistantError::Spawn(e.to_string())
            }
        })?;

        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());
        let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

        // One deadline covers the exit and both pipes: a grandchild that
        // inherits stdout can keep the pipe open after the CLI itself exits.
        let finished = tokio::time::timeout(self.config.timeout, async {
            let status = child.wait().await?;
            let (stdout, stderr) =
                tokio::join!(collect_reader(stdout_task), collect_reader(stderr_task));
            Ok::<_, AssistantError>(std::process::Output {
                status,
                stdout,
                stderr,
            })
        })
        .await;

        match finished {
            Ok(output) => output,
            Err(_) => {
                for reader in &readers {
                    reader.abort();
                }
                if let Err(e) = child.start_kill() {
                    tracing::debug!(%e, "assistant CLI already exited before kill");
                }
                if let Err(e) = child.wait().await {
                    tracing::warn!(%e, "failed to reap timed-out assistant CLI");
                }
                tracing::warn!(
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "assistant CLI timed out and was killed"
                );
                Err(AssistantError::Timeout(self.config.timeout))
            }
        }
    }
}

/// Prefers stderr, falling back to stdout, capped at `STDERR_SNIPPET_CHARS`.
fn process_failed(output: &std::process::Output) -> AssistantError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    AssistantError::ProcessFailed {
        code: output.status.to_string(),
        stderr: detail.chars().take(STDERR_SNIPPET_CHARS).collect(),
    }
}

fn spawn_reader<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            if let Err(e) = reader.read_to_end(&mut buf).await {
                tracing::debug!(%e, "assistant CLI pipe read failed");
            }
        }
        buf
    })
}

async fn collect_reader(task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    task.await.unwrap_or_default()
}

/// Pulls the answer text out of `--output-format json` stdout.
///
/// Accepts `{ "result": .. }`, `{ "response": .. }`, a bare JSON string, or an
/// array of events containing a `type: "result"` envelope. Anything that does
/// not parse, or parses without a known field, is returned as raw text.
pub fn extract_reply(stdout: &str) -> Result<String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(AssistantError::EmptyOutput);
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Ok(trimmed.to_string());
    };
    match reply_from_json(&value) {
        Some((text, true)) => Err(AssistantError::Reported(text)),
        Some((text, false)) if text.trim().is_empty() => Err(AssistantError::EmptyOutput),
        Some((text, false)) => Ok(text),
        None => Ok(trimmed.to_string()),
    }
}

fn reply_from_json(value: &serde_json::Value) -> Option<(String, bool)> {
    match value {
        serde_json::Value::String(s) => Some((s.clone(), false)),
        serde_json::Value::Array(items) => items
            .iter()
            .rev()
            .find(|item| item.get("type").and_then(|t| t.as_str()) == Some("result"))
            .and_then(reply_from_json),
        serde_json::Value::Object(map) => {
            let is_error = map
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            map.get("result")
                .or_else(|| map.get("response"))
                .and_then(|v| v.as_str())
                .map(|s| (s.to_string(), is_error))
        }
        _ => None,
    }
}
