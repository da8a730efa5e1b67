use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// JSON schema the response is expected to satisfy.
    pub schema: String,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to start completion command: {0}")]
    Spawn(String),
    #[error("completion command failed: {0}")]
    Failed(String),
    #[error("completion returned no output")]
    Empty,
}

/// A generative completion backend. Implementations enforce the request's
/// timeout themselves.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Runs a user-configured shell command as the completion backend. The
/// prompt arrives on stdin; stdout is the response.
pub struct CommandCompletion {
    command: String,
    cwd: Option<PathBuf>,
}

impl CommandCompletion {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl CompletionService for CommandCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let mut command = Command::new("bash");
        command
            .arg("-lc")
            .arg(&self.command)
            .env("CANOPY_PROMPT_SCHEMA", &request.schema)
            .env(
                "CANOPY_MAX_OUTPUT_TOKENS",
                request.max_output_tokens.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|err| CompletionError::Spawn(err.to_string()))?;
        let stdin = child.stdin.take();
        let prompt = request.prompt.clone();

        let run = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may exit before reading it.
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(event = "completion_stdin_closed", error = %err);
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(request.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(CompletionError::Failed(err.to_string())),
            Err(_) => return Err(CompletionError::Timeout(request.timeout)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with status {}", output.status)
            } else {
                stderr
            };
            return Err(CompletionError::Failed(message));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(stdout)
    }
}
