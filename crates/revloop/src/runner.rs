//! Agent invocation.
//!
//! The agent is an external CLI. A prompt is never interpolated into a shell:
//! it travels either as one argv element or, when it is large or contains
//! characters that are unsafe in argv, through a private temp file whose path
//! is passed instead. Each call runs under its own deadline, in its own
//! process group, so a timeout or cancellation takes down the whole tree.

use revloop_core::{Config, PromptDelivery, StageRole, StageStatus};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log lines while an agent is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for pipes to drain once the process is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on captured stdout/stderr, each.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const PROMPT_FILE_PREFIX: &str = "revloop-prompt-";

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to spawn agent {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write prompt file: {0}")]
    PromptFile(#[source] std::io::Error),
    #[error("io error while waiting for agent: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InvocationError>;

/// One agent call.
#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub role: StageRole,
    pub iteration: u32,
    pub workdir: &'a Path,
    pub prompt: &'a str,
    /// Deadline for this call. Zero is raised to one second.
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Succeeded,
    TimedOut,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn stage_status(self) -> StageStatus {
        match self {
            Self::Succeeded => StageStatus::Succeeded,
            Self::TimedOut => StageStatus::TimedOut,
            Self::Failed => StageStatus::Failed,
            Self::Cancelled => StageStatus::Cancelled,
        }
    }
}

/// Why a completed invocation does not count as a success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    #[error("agent timed out after {timeout_sec} seconds")]
    Timeout { timeout_sec: u64 },
    #[error("agent failed: {}", describe_exit(.exit_code))]
    AgentFailure { exit_code: Option<i32> },
    #[error("agent invocation cancelled")]
    Cancelled,
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Structured result of one agent call.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub role: StageRole,
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Effective deadline the call ran under.
    pub timeout_sec: u64,
    pub delivery: PromptDelivery,
    /// Temp file used for delivery. Already deleted when the result exists.
    pub prompt_file: Option<PathBuf>,
}

impl AgentResult {
    /// Stdout, followed by stderr when there is any.
    pub fn output(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n\n--- STDERR ---\n{}", self.stdout, self.stderr)
        }
    }

    pub fn failure(&self) -> Option<StageFailure> {
        match self.status {
            AgentStatus::Succeeded => None,
            AgentStatus::TimedOut => Some(StageFailure::Timeout {
                timeout_sec: self.timeout_sec,
            }),
            AgentStatus::Failed => Some(StageFailure::AgentFailure {
                exit_code: self.exit_code,
            }),
            AgentStatus::Cancelled => Some(StageFailure::Cancelled),
        }
    }
}

/// Something that can run an agent for a stage.
///
/// Ordinary failures (non-zero exit, timeout, cancellation) are reported in
/// [`AgentResult::status`]; only failures to start the agent are errors.
pub trait AgentRunner: Send + Sync {
    fn invoke(
        &self,
        request: AgentRequest<'_>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<AgentResult>> + Send;
}

/// Process runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: PathBuf,
    /// Fixed arguments placed before the prompt flag.
    pub args: Vec<String>,
    /// Extra arguments per role, placed after `args`.
    pub role_args: BTreeMap<StageRole, Vec<String>>,
    pub prompt_flag: String,
    pub prompt_file_flag: String,
    /// Longest prompt, in characters, that may be passed inline.
    pub prompt_threshold: usize,
    /// Where prompt files are created; system temp dir when unset.
    pub prompt_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.agent_bin.clone(),
            args: config.agent_args.clone(),
            role_args: [
                StageRole::Reviewer,
                StageRole::Developer,
                StageRole::Validator,
                StageRole::Finalizer,
            ]
            .into_iter()
            .map(|role| (role, config.role_args(role).to_vec()))
            .collect(),
            prompt_flag: config.prompt_flag.clone(),
            prompt_file_flag: config.prompt_file_flag.clone(),
            prompt_threshold: config.prompt_threshold,
            prompt_dir: config.prompt_dir.clone(),
        }
    }

    pub fn args_for(&self, role: StageRole) -> &[String] {
        self.role_args.get(&role).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Whether `prompt` must go through a temp file instead of argv.
pub fn needs_file_delivery(prompt: &str, threshold: usize) -> bool {
    prompt.chars().count() > threshold
        || prompt.starts_with('-')
        || prompt
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
}

/// Bytes captured from one output stream so far.
type CaptureBuffer = Arc<Mutex<Vec<u8>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A stream being drained in the background.
struct OutputCapture {
    buffer: CaptureBuffer,
    task: JoinHandle<std::io::Result<()>>,
}

impl OutputCapture {
    fn spawn<R>(reader: R) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let buffer = CaptureBuffer::default();
        let task = tokio::spawn(read_bounded(reader, Arc::clone(&buffer), MAX_OUTPUT_BYTES));
        Self { buffer, task }
    }
}

/// Read from an async reader into `buffer`, keeping at most `max_bytes`.
///
/// Bytes land in the shared buffer as they arrive, so a reader that is
/// abandoned part way still leaves what it read.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    buffer: CaptureBuffer,
    max_bytes: usize,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let mut buf = lock(&buffer);
        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining < n && !truncated {
            warn!(max_bytes, "agent output exceeded limit, truncating");
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    Ok(())
}

/// Wait for a capture to drain, then return whatever it collected.
async fn collect_output(capture: Option<OutputCapture>, stream: &'static str) -> String {
    let Some(OutputCapture { buffer, mut task }) = capture else {
        return String::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(stream, error = %err, "output capture failed; keeping partial output"),
        Ok(Err(err)) => warn!(stream, error = %err, "output capture task panicked"),
        Err(_) => {
            warn!(stream, "output capture timed out; keeping partial output");
            task.abort();
        }
    }
    let bytes = std::mem::take(&mut *lock(&buffer));
    String::from_utf8_lossy(&bytes).into_owned()
}

/// How the wait loop ended.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// SIGKILL every process left in the agent's group.
///
/// Takes the group id captured at spawn time, since the leader may already
/// be reaped.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => debug!(pgid, error = %err, "killpg failed"),
    }
}

/// Kill the agent and everything it spawned.
fn kill_process_group(pgid: Option<u32>, child: &mut Child) {
    #[cfg(unix)]
    kill_group(pgid);
    #[cfg(not(unix))]
    let _ = pgid;
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "kill failed");
    }
}

/// Runs the agent CLI as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn write_prompt_file(&self, prompt: &str) -> Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PROMPT_FILE_PREFIX).suffix(".txt");
        // NamedTempFile is created with mode 0600 on unix.
        let mut file = match &self.config.prompt_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(InvocationError::PromptFile)?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
        .map_err(InvocationError::PromptFile)?;

        file.write_all(prompt.as_bytes())
            .and_then(|()| file.flush())
            .map_err(InvocationError::PromptFile)?;
        Ok(file)
    }

    async fn run_process(
        &self,
        request: &AgentRequest<'_>,
        prompt_arg: (&str, &std::ffi::OsStr),
        timeout_sec: u64,
        cancel: &CancellationToken,
    ) -> Result<(ProcessOutcome, String, String)> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(self.config.args_for(request.role))
            .arg(prompt_arg.0)
            .arg(prompt_arg.1)
            .current_dir(request.workdir)
            .env("REVLOOP_ROLE", request.role.as_str())
            .env("REVLOOP_ITERATION", request.iteration.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| InvocationError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        })?;

        // Process group id; the child runs as its own group leader.
        let pgid = child.id();
        let stdout_capture = child.stdout.take().map(OutputCapture::spawn);
        let stderr_capture = child.stderr.take().map(OutputCapture::spawn);

        let started = Instant::now();
        let deadline = Duration::from_secs(timeout_sec);

        let outcome = loop {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                warn!(
                    role = request.role.as_str(),
                    iteration = request.iteration,
                    timeout_sec,
                    "agent timed out; killing process group"
                );
                kill_process_group(pgid, &mut child);
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }
            let sleep_for = HEARTBEAT_INTERVAL.min(deadline - elapsed);

            tokio::select! {
                status = child.wait() => break ProcessOutcome::Completed(status?),
                () = cancel.cancelled() => {
                    info!(
                        role = request.role.as_str(),
                        iteration = request.iteration,
                        "cancellation requested; killing process group"
                    );
                    kill_process_group(pgid, &mut child);
                    let _ = child.wait().await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_for) => {
                    if started.elapsed() < deadline {
                        info!(
                            role = request.role.as_str(),
                            iteration = request.iteration,
                            elapsed_sec = started.elapsed().as_secs(),
                            timeout_sec,
                            "agent still running"
                        );
                    }
                }
            }
        };

        // Background descendants of an agent that exited on its own would
        // otherwise keep the pipes open and outlive the call.
        if matches!(outcome, ProcessOutcome::Completed(_)) {
            #[cfg(unix)]
            kill_group(pgid);
        }

        let stdout = collect_output(stdout_capture, "stdout").await;
        let stderr = collect_output(stderr_capture, "stderr").await;
        Ok((outcome, stdout, stderr))
    }
}

impl AgentRunner for ProcessRunner {
    async fn invoke(
        &self,
        request: AgentRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentResult> {
        let timeout_sec = request.timeout_sec.max(1);
        let started = Instant::now();

        let prompt_file = if needs_file_delivery(request.prompt, self.config.prompt_threshold) {
            Some(self.write_prompt_file(request.prompt)?)
        } else {
            None
        };
        let delivery = if prompt_file.is_some() {
            PromptDelivery::File
        } else {
            PromptDelivery::Inline
        };
        let prompt_path = prompt_file.as_ref().map(|f| f.path().to_path_buf());

        debug!(
            role = request.role.as_str(),
            iteration = request.iteration,
            prompt_chars = request.prompt.chars().count(),
            delivery = ?delivery,
            workdir = %request.workdir.display(),
            timeout_sec,
            "invoking agent"
        );

        let prompt_arg = match &prompt_path {
            Some(path) => (self.config.prompt_file_flag.as_str(), path.as_os_str()),
            None => (
                self.config.prompt_flag.as_str(),
                std::ffi::OsStr::new(request.prompt),
            ),
        };
        let result = self
            .run_process(&request, prompt_arg, timeout_sec, cancel)
            .await;

        if let Some(file) = prompt_file {
            if let Err(err) = file.close() {
                warn!(error = %err, "failed to remove prompt file");
            }
        }

        let (outcome, stdout, stderr) = result?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (status, exit_code) = match outcome {
            ProcessOutcome::Completed(exit) if exit.success() => (AgentStatus::Succeeded, exit.code()),
            ProcessOutcome::Completed(exit) => (AgentStatus::Failed, exit.code()),
            ProcessOutcome::TimedOut => (AgentStatus::TimedOut, None),
            ProcessOutcome::Cancelled => (AgentStatus::Cancelled, None),
        };

        info!(
            role = request.role.as_str(),
            iteration = request.iteration,
            status = ?status,
            exit_code,
            duration_ms,
            output_bytes = stdout.len(),
            "agent finished"
        );

        Ok(AgentResult {
            role: request.role,
            status,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            timeout_sec,
            delivery,
            prompt_file: prompt_path,
        })
    }
}
