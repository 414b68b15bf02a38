//! Forwarding child processes
//!
//! Spawns `kubectl port-forward` children, polls them without blocking and
//! stops them with a graceful signal followed by a forced kill.

use super::target::ForwardTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between exit checks while waiting on a child
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on captured stderr
const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// How long to wait for stderr to drain once a child has exited
const DIAGNOSTIC_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Program and arguments for one forwarding process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ForwardCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<kubectl> port-forward <type>/<name> <local>:<remote> -n <namespace>`
    pub fn kubectl(kubectl: &str, target: &ForwardTarget) -> Self {
        Self::new(
            kubectl,
            [
                "port-forward".to_string(),
                target.resource(),
                format!("{}:{}", target.local_port, target.remote_port),
                "-n".to_string(),
                target.namespace.clone(),
            ],
        )
    }
}

impl fmt::Display for ForwardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Result of a non-blocking exit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ExitInfo),
}

/// How a terminate request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing to do, the process had already exited
    AlreadyExited(ExitInfo),
    /// The process exited after the graceful signal
    Stopped(ExitInfo),
    /// The process had to be force-killed
    Killed(ExitInfo),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {pid:?} still running after kill")]
    StillRunning { pid: Option<u32> },

    #[error("failed to kill process: {0}")]
    Kill(#[source] std::io::Error),
}

/// Handle to one spawned forwarding process
#[async_trait]
pub trait ChildProcess: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Check for exit without blocking
    fn poll(&self) -> ProcessStatus;

    /// Stop the process, escalating to a forced kill after `grace`
    ///
    /// Calling this on an exited process is a no-op returning
    /// [`TerminateOutcome::AlreadyExited`].
    async fn terminate(
        &self,
        grace: Duration,
        kill_timeout: Duration,
    ) -> Result<TerminateOutcome, ProcessError>;

    /// Captured stderr, best effort
    async fn diagnostics(&self) -> String;
}

/// Spawns forwarding processes
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    async fn spawn(&self, command: &ForwardCommand) -> Result<Arc<dyn ChildProcess>, ProcessError>;
}

/// Wait up to `within` for the process to exit
pub async fn wait_for_exit(process: &dyn ChildProcess, within: Duration) -> Option<ExitInfo> {
    let deadline = Instant::now() + within;
    loop {
        if let ProcessStatus::Exited(info) = process.poll() {
            return Some(info);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// [`ProcessRuntime`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRuntime;

impl TokioProcessRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRuntime for TokioProcessRuntime {
    async fn spawn(&self, command: &ForwardCommand) -> Result<Arc<dyn ChildProcess>, ProcessError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(pid = ?pid, command = %command, "Spawned forwarding process");

        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, stderr_buf.clone())));

        Ok(Arc::new(TokioChild {
            pid,
            child: Mutex::new(child),
            stderr_buf,
            stderr_task: Mutex::new(stderr_task),
        }))
    }
}

/// Read stderr until EOF, keeping at most [`MAX_DIAGNOSTIC_BYTES`]
async fn drain_stderr(mut stderr: ChildStderr, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let room = MAX_DIAGNOSTIC_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

#[derive(Debug)]
struct TokioChild {
    pid: Option<u32>,
    child: Mutex<Child>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioChild {
    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(unix)]
    fn request_stop(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(pid, error = %e, "SIGTERM failed");
                }
            }
            None => self.force_kill_quietly(),
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) {
        self.force_kill_quietly();
    }

    fn force_kill_quietly(&self) {
        if let Err(e) = self.child().start_kill() {
            debug!(pid = ?self.pid, error = %e, "Kill failed");
        }
    }
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&self) -> ProcessStatus {
        match self.child().try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(status.into()),
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll forwarding process");
                ProcessStatus::Exited(ExitInfo::unknown())
            }
        }
    }

    async fn terminate(
        &self,
        grace: Duration,
        kill_timeout: Duration,
    ) -> Result<TerminateOutcome, ProcessError> {
        if let ProcessStatus::Exited(info) = self.poll() {
            return Ok(TerminateOutcome::AlreadyExited(info));
        }

        self.request_stop();
        if let Some(info) = wait_for_exit(self, grace).await {
            return Ok(TerminateOutcome::Stopped(info));
        }

        debug!(pid = ?self.pid, "Process ignored graceful stop, killing");
        let killed = self.child().start_kill();
        if let Err(e) = killed {
            // The process may have exited between the poll and the kill
            if let ProcessStatus::Exited(info) = self.poll() {
                return Ok(TerminateOutcome::Stopped(info));
            }
            return Err(ProcessError::Kill(e));
        }

        match wait_for_exit(self, kill_timeout).await {
            Some(info) => Ok(TerminateOutcome::Killed(info)),
            None => Err(ProcessError::StillRunning { pid: self.pid }),
        }
    }

    async fn diagnostics(&self) -> String {
        let task = self
            .stderr_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if tokio::time::timeout(DIAGNOSTIC_READ_TIMEOUT, task).await.is_err() {
                debug!(pid = ?self.pid, "Stderr still open, using partial output");
            }
        }

        let buf = self.stderr_buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).trim().to_string()
    }
}
