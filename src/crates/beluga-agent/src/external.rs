//! External-process agent adapter
//!
//! Spawns a configured executable per stage. The contract with the
//! subprocess is intentionally thin:
//!
//! - prompt arrives on stdin, followed by a "return only JSON" trailer;
//! - a JSON-schema hint file and the expected output path are passed via
//!   `BELUGA_AGENT_SCHEMA` / `BELUGA_AGENT_OUTPUT` environment variables;
//! - the process runs with the workspace as its working directory;
//! - stdout and stderr are drained incrementally into per-node log files
//!   so operators can tail a running stage;
//! - a heartbeat record is logged while the process runs, and an
//!   optional overall timeout cancels it (reported distinctly from a
//!   non-zero exit).
//!
//! Read-scope isolation (hide-and-restore) brackets the subprocess on
//! every exit path.

use crate::capability::{Agent, AgentReply, AgentRequest};
use crate::error::{AgentError, Result};
use crate::isolation::{HideAndRestore, ReadScope};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Schema hint handed to the subprocess
const RESPONSE_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["outcome"],
  "properties": {
    "outcome": {
      "type": "string",
      "enum": ["success", "fail", "retry", "partial_success"]
    },
    "preferred_next": { "type": "string" },
    "suggested_next_ids": { "type": "array", "items": { "type": "string" } },
    "context_updates": { "type": "object" },
    "notes": { "type": "string" },
    "failure_reason": { "type": "string" }
  }
}
"#;

/// Trailer appended to every prompt sent on stdin
const PROMPT_TRAILER: &str =
    "\n\nWrite your reply to the file named by BELUGA_AGENT_OUTPUT. Return only JSON matching the provided schema.\n";

/// Configuration for [`ExternalProcessAgent`]
#[derive(Debug, Clone)]
pub struct ExternalAgentConfig {
    /// Path to the agent executable
    pub executable: PathBuf,
    /// Read-scope isolation settings
    pub read_scope: ReadScope,
    /// Overall wall-clock limit for one invocation
    pub timeout: Option<Duration>,
    /// Interval between "still running" heartbeat records
    pub heartbeat_interval: Duration,
    /// Also echo agent output lines into the engine's log stream
    pub live_stream_log: bool,
}

impl ExternalAgentConfig {
    /// Config with the default 15 second heartbeat and no timeout
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            read_scope: ReadScope::default(),
            timeout: None,
            heartbeat_interval: Duration::from_secs(15),
            live_stream_log: false,
        }
    }
}

/// Agent backend that shells out to a configured executable
#[derive(Debug, Clone)]
pub struct ExternalProcessAgent {
    config: ExternalAgentConfig,
}

impl ExternalProcessAgent {
    /// Build an adapter over the given configuration
    pub fn new(config: ExternalAgentConfig) -> Self {
        Self { config }
    }

    fn validate_executable(&self) -> Result<()> {
        let path = &self.config.executable;
        let metadata = std::fs::metadata(path)
            .map_err(|_| AgentError::ExecutableNotFound(path.clone()))?;
        if !metadata.is_file() {
            return Err(AgentError::ExecutableNotFound(path.clone()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(AgentError::ExecutableNotExecutable(path.clone()));
            }
        }
        Ok(())
    }

    async fn invoke(&self, request: AgentRequest<'_>) -> Result<AgentReply> {
        let schema_path = request.artifact_dir.join("agent.schema.json");
        tokio::fs::write(&schema_path, RESPONSE_SCHEMA).await?;
        let response_path = request.artifact_dir.join("response.md");

        let mut child = Command::new(&self.config.executable)
            .current_dir(request.workspace)
            .env("BELUGA_AGENT_OUTPUT", &response_path)
            .env("BELUGA_AGENT_SCHEMA", &schema_path)
            .env("BELUGA_AGENT_NODE", request.node_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.write_all(PROMPT_TRAILER.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(drain_stream(
            stdout,
            request.artifact_dir.join("agent.stdout.log"),
            self.config.live_stream_log.then(|| format!("{}/stdout", request.node_id)),
        ));
        let stderr_task = tokio::spawn(drain_stream(
            stderr,
            request.artifact_dir.join("agent.stderr.log"),
            self.config.live_stream_log.then(|| format!("{}/stderr", request.node_id)),
        ));

        let heartbeat = spawn_heartbeat(request.node_id.to_string(), self.config.heartbeat_interval);

        let status = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    heartbeat.abort();
                    let _ = child.kill().await;
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                    return Err(AgentError::Timeout(limit.as_secs()));
                }
            },
            None => child.wait().await?,
        };

        heartbeat.abort();
        stdout_task.await.map_err(|e| std::io::Error::other(e))??;
        stderr_task.await.map_err(|e| std::io::Error::other(e))??;

        if !status.success() {
            return Err(AgentError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            });
        }

        parse_response(&response_path).await
    }
}

#[async_trait]
impl Agent for ExternalProcessAgent {
    async fn run(&self, request: AgentRequest<'_>) -> Result<AgentReply> {
        self.validate_executable()?;

        let mut scope = self.config.read_scope.clone();
        if scope.agent_executable.is_none() {
            scope.agent_executable = Some(self.config.executable.clone());
        }
        let block_set = scope.effective_block_set(request.workspace)?;
        let mut guard = HideAndRestore::engage(
            request.workspace,
            &block_set,
            &request.artifact_dir.join("hidden"),
        )?;
        tracing::info!(
            node_id = request.node_id,
            hidden = guard.hidden_count(),
            "invoking external agent"
        );

        let result = self.invoke(request).await;
        let restore = guard.restore();

        match (result, restore) {
            (Ok(reply), Ok(())) => Ok(reply),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
        }
    }
}

/// Copy a child stream into a log file, flushing per chunk
async fn drain_stream(
    mut source: impl tokio::io::AsyncRead + Unpin,
    log_path: PathBuf,
    live_label: Option<String>,
) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(&log_path).await?;
    let mut buf = [0u8; 8192];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        file.flush().await?;
        if let Some(label) = &live_label {
            tracing::info!(stream = label.as_str(), "{}", String::from_utf8_lossy(&buf[..n]).trim_end());
        }
    }
    Ok(())
}

fn spawn_heartbeat(node_id: String, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            tracing::info!(
                node_id = node_id.as_str(),
                elapsed_secs = started.elapsed().as_secs(),
                "agent still running"
            );
        }
    })
}

/// Read and validate the agent's structured reply
async fn parse_response(path: &Path) -> Result<AgentReply> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(_) => return Err(AgentError::ResponseMissing(path.to_path_buf())),
    };
    let reply: AgentReply =
        serde_json::from_str(&text).map_err(|e| AgentError::MalformedResponse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if reply.outcome.trim().is_empty() {
        return Err(AgentError::MalformedResponse {
            path: path.to_path_buf(),
            reason: "outcome field is empty".to_string(),
        });
    }
    Ok(reply)
}
