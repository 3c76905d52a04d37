//! Command runner with a wall-clock timeout and an output ceiling
//!
//! Three tasks race for every command: two readers filling one shared
//! buffer, a waiter that resolves on natural exit, and a timeout watcher.
//! Whoever resolves first wins; the others find the cell empty and stop.

use crate::config::{RunnerConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_SECS};
use crate::platform::UserEnvironment;
use crate::sandbox::{Sandbox, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// How long readers may keep draining once the process has exited.
/// Background jobs can hold the pipes open well past the shell's exit.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Runner errors
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Failed to launch command: {0}")]
    LaunchFailed(String),

    #[error("Command was abandoned before it resolved")]
    Abandoned,
}

/// A single command submitted by the quick-command field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionRequest {
    /// Shell command text, passed to the shell unchanged
    pub command_line: String,

    /// Wall-clock limit (seconds)
    pub timeout_secs: u64,

    /// Output ceiling (bytes)
    pub max_output_bytes: usize,
}

impl CommandExecutionRequest {
    /// Request with the default policy limits
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    fn truncation_notice(&self) -> String {
        format!(
            "[Output truncated - exceeded {}KB limit]",
            self.max_output_bytes / 1000
        )
    }

    fn timeout_notice(&self) -> String {
        format!("Command timed out after {} seconds", self.timeout_secs)
    }
}

/// Outcome of a command that ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecutionResult {
    /// Trimmed stdout and stderr, plus a notice when truncated or timed out
    pub output_text: String,

    /// Output went past the ceiling and the process was stopped
    pub was_truncated: bool,

    /// The timeout fired before the command resolved
    pub was_timed_out: bool,

    /// Exit code, when the process exited on its own
    pub exit_code: Option<i32>,

    /// Time from spawn to resolution (milliseconds)
    pub duration_ms: u64,
}

/// What the winning resolver saw
#[derive(Debug)]
struct Resolution {
    output: Vec<u8>,
    truncated: bool,
    timed_out: bool,
    exit_code: Option<i32>,
}

/// Output buffer and single-assignment resolution cell, behind one lock
struct RunState {
    output: Vec<u8>,
    truncated: bool,
    max_output_bytes: usize,
    resolver: Option<oneshot::Sender<Resolution>>,
}

impl RunState {
    fn new(max_output_bytes: usize, resolver: oneshot::Sender<Resolution>) -> Self {
        Self {
            output: Vec::new(),
            truncated: false,
            max_output_bytes,
            resolver: Some(resolver),
        }
    }

    fn is_resolved(&self) -> bool {
        self.resolver.is_none()
    }

    /// Append a chunk, keeping at most `max_output_bytes`.
    ///
    /// Returns false once the reader should stop: the ceiling was crossed
    /// or the command has already resolved.
    fn append(&mut self, chunk: &[u8]) -> bool {
        if self.truncated || self.is_resolved() {
            return false;
        }

        let room = self.max_output_bytes.saturating_sub(self.output.len());
        if chunk.len() > room {
            self.output.extend_from_slice(&chunk[..room]);
            if is_utf8_continuation(chunk[room]) {
                // Drop the character that straddles the ceiling
                for _ in 0..4 {
                    match self.output.pop() {
                        Some(byte) if is_utf8_continuation(byte) => continue,
                        _ => break,
                    }
                }
            }
            self.truncated = true;
            return false;
        }

        self.output.extend_from_slice(chunk);
        true
    }

    /// Resolve once; later calls are no-ops and return false
    fn resolve(&mut self, timed_out: bool, exit_code: Option<i32>) -> bool {
        let Some(resolver) = self.resolver.take() else {
            return false;
        };

        let resolution = Resolution {
            output: std::mem::take(&mut self.output),
            truncated: self.truncated,
            timed_out: timed_out && !self.truncated,
            exit_code,
        };

        // The receiver only goes away if the caller stopped waiting
        let _ = resolver.send(resolution);
        true
    }
}

/// Executes quick commands in the user's login shell
pub struct CommandRunner {
    config: RunnerConfig,
    sandbox: Sandbox,
}

impl CommandRunner {
    /// Create a runner for the current user
    pub fn new(config: RunnerConfig) -> Self {
        let user = UserEnvironment::detect();
        let mut sandbox_config = SandboxConfig::for_user(&user);

        if let Some(shell) = config
            .shell
            .as_deref()
            .and_then(UserEnvironment::resolve_shell)
        {
            sandbox_config.shell = shell;
        }
        if let Some(ref dir) = config.working_dir {
            sandbox_config.working_dir = dir.clone();
        }
        sandbox_config.env_overrides = config.env.clone();

        Self::with_sandbox(config, Sandbox::new(sandbox_config))
    }

    pub fn with_sandbox(config: RunnerConfig, sandbox: Sandbox) -> Self {
        Self { config, sandbox }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Build a request using this runner's configured limits
    pub fn request(&self, command_line: impl Into<String>) -> CommandExecutionRequest {
        CommandExecutionRequest::new(command_line)
            .with_timeout_secs(self.config.timeout_secs)
            .with_max_output_bytes(self.config.max_output_bytes)
    }

    /// Run a command to completion, timeout or truncation
    pub async fn execute(
        &self,
        request: &CommandExecutionRequest,
    ) -> Result<CommandExecutionResult, RunnerError> {
        if request.command_line.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }

        let start_time = Instant::now();

        let mut child = self
            .sandbox
            .wrap_command(&request.command_line)
            .spawn()
            .map_err(|e| RunnerError::LaunchFailed(e.to_string()))?;

        let pid = child.id().ok_or_else(|| {
            RunnerError::LaunchFailed("process exited before it could be tracked".to_string())
        })?;

        info!(pid, timeout_secs = request.timeout_secs, "Spawned command");
        debug!(command = %request.command_line, "Command line");

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(RunState::new(request.max_output_bytes, tx)));

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_stream(stdout, state.clone(), pid)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_stream(stderr, state.clone(), pid)));

        let waiter_state = state.clone();
        tokio::spawn(async move {
            let status = child.wait().await;

            // Readers end at EOF, which drains whatever was buffered at exit
            let mut readers: Vec<_> = [stdout_task, stderr_task]
                .into_iter()
                .flatten()
                .collect();
            let drain = async {
                for task in readers.iter_mut() {
                    let _ = task.await;
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                debug!(pid, "Output still open after exit, keeping what was read");
            }
            for task in &readers {
                task.abort();
            }

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, "Failed to wait for command: {}", e);
                    None
                }
            };

            if waiter_state.lock().await.resolve(false, exit_code) {
                debug!(pid, ?exit_code, "Command resolved on exit");
            }
        });

        let timeout = Duration::from_secs(request.timeout_secs);
        let watcher_state = state.clone();
        let watcher = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut state = watcher_state.lock().await;
            if state.is_resolved() {
                return;
            }

            if let Err(e) = Sandbox::terminate(pid) {
                warn!(pid, "Failed to terminate timed out command: {}", e);
            }

            // Only what the readers already collected is reported
            if state.resolve(true, None) {
                info!(pid, "Command timed out");
            }
        });

        let resolution = rx.await.map_err(|_| RunnerError::Abandoned)?;
        watcher.abort();

        Ok(render(request, resolution, start_time.elapsed()))
    }

    /// UI-facing wrapper: errors become inline text, empty input yields nothing
    pub async fn run_for_display(&self, command_line: &str) -> String {
        let request = self.request(command_line);

        match self.execute(&request).await {
            Ok(result) => result.output_text,
            Err(RunnerError::EmptyCommand) => String::new(),
            Err(e) => format!("Error: {}", e),
        }
    }
}

async fn read_stream<R>(mut reader: R, state: Arc<Mutex<RunState>>, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8_192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut guard = state.lock().await;
                if guard.append(&buf[..n]) {
                    continue;
                }

                let over_limit = guard.truncated && !guard.is_resolved();
                drop(guard);

                if over_limit {
                    info!(pid, "Output limit reached, stopping command");
                    if let Err(e) = Sandbox::terminate(pid) {
                        warn!(pid, "Failed to terminate command: {}", e);
                    }
                }
                break;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(pid, "Output stream closed: {}", e);
                break;
            }
        }
    }
}

fn is_utf8_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

fn render(
    request: &CommandExecutionRequest,
    resolution: Resolution,
    elapsed: Duration,
) -> CommandExecutionResult {
    let text = String::from_utf8_lossy(&resolution.output);
    let trimmed = text.trim();

    let output_text = if resolution.timed_out {
        if trimmed.is_empty() {
            request.timeout_notice()
        } else {
            format!("{}\n\n[{}]", trimmed, request.timeout_notice())
        }
    } else if resolution.truncated {
        format!("{}\n\n{}", trimmed, request.truncation_notice())
    } else {
        trimmed.to_string()
    };

    CommandExecutionResult {
        output_text,
        was_truncated: resolution.truncated,
        was_timed_out: resolution.timed_out,
        exit_code: resolution.exit_code,
        duration_ms: elapsed.as_millis() as u64,
    }
}
