//! Port-forward session table
//!
//! One entry per local port. The table lock only guards map reads and
//! writes; spawning, the grace wait and termination all happen with the
//! lock released so slow process I/O on one port never blocks another.

use super::supervisor::{
    wait_for_exit, ChildProcess, ExitInfo, ForwardCommand, ProcessRuntime, ProcessStatus,
    TerminateOutcome,
};
use super::target::{ForwardTarget, TargetKind};
use crate::error::{OpsError, OpsResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Path or name of the kubectl binary
    pub kubectl: String,
    /// How long a new process must survive before it counts as started
    pub grace_period: Duration,
    /// Wait after the graceful stop signal before killing
    pub terminate_timeout: Duration,
    /// Wait after the forced kill before giving up
    pub kill_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Slot reserved, process not started yet
    Spawning,
    /// Process started, waiting out the grace period
    GraceWindow,
    Active,
    /// A stop was attempted and the process outlived it
    Terminating,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Spawning => "Spawning",
            SessionState::GraceWindow => "Starting",
            SessionState::Active => "Active",
            SessionState::Terminating => "Terminating",
            SessionState::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session, liveness polled when taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub local_port: u16,
    pub remote_port: u16,
    pub resource_type: TargetKind,
    pub resource_name: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
    pub command: String,
}

/// What `close` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// The process exited after the graceful stop
    Stopped,
    /// The process had to be killed
    Killed,
    /// The process was already gone; only the entry was removed
    AlreadyExited,
    /// The session was still starting; its open is aborted
    Cancelled,
}

impl CloseOutcome {
    /// Whether a live process was stopped
    pub fn was_running(&self) -> bool {
        matches!(self, CloseOutcome::Stopped | CloseOutcome::Killed)
    }
}

#[derive(Debug)]
struct SessionEntry {
    id: Uuid,
    target: ForwardTarget,
    command: ForwardCommand,
    started_at: DateTime<Utc>,
    state: SessionState,
    process: Option<Arc<dyn ChildProcess>>,
    /// End of the grace window, set once the process is recorded
    grace_deadline: Option<Instant>,
}

impl SessionEntry {
    fn reserve(id: Uuid, target: ForwardTarget, command: ForwardCommand) -> Self {
        Self {
            id,
            target,
            command,
            started_at: Utc::now(),
            state: SessionState::Spawning,
            process: None,
            grace_deadline: None,
        }
    }

    /// A reserved slot counts as running
    fn status(&self) -> ProcessStatus {
        self.process
            .as_ref()
            .map(|p| p.poll())
            .unwrap_or(ProcessStatus::Running)
    }

    /// State as observed now; a grace window whose deadline passed
    /// without anyone awaiting it reads as `Active`
    fn current_state(&self) -> SessionState {
        match (self.state, self.grace_deadline) {
            (SessionState::GraceWindow, Some(deadline)) if Instant::now() >= deadline => {
                SessionState::Active
            }
            (state, _) => state,
        }
    }

    fn summary(&self) -> SessionSummary {
        let (alive, exit, state) = match self.status() {
            ProcessStatus::Running => (true, None, self.current_state()),
            ProcessStatus::Exited(info) => (false, Some(info), SessionState::Terminated),
        };

        SessionSummary {
            id: self.id,
            local_port: self.target.local_port,
            remote_port: self.target.remote_port,
            resource_type: self.target.kind,
            resource_name: self.target.name.clone(),
            namespace: self.target.namespace.clone(),
            started_at: self.started_at,
            state,
            alive,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            exit,
            command: self.command.to_string(),
        }
    }
}

type SessionTable = HashMap<u16, SessionEntry>;

/// Owner of every port-forward session in the process
#[derive(Clone)]
pub struct PortForwardRegistry {
    runtime: Arc<dyn ProcessRuntime>,
    sessions: Arc<Mutex<SessionTable>>,
    config: RegistryConfig,
}

/// Releases a `Spawning` reservation if `open` is dropped before the
/// process handle is recorded
struct Reservation<'a> {
    registry: &'a PortForwardRegistry,
    local_port: u16,
    id: Uuid,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.remove_if_current(self.local_port, self.id);
        }
    }
}

impl PortForwardRegistry {
    pub fn new(runtime: Arc<dyn ProcessRuntime>, config: RegistryConfig) -> Self {
        Self {
            runtime,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove session `id` if it is still in its grace window
    ///
    /// Returns false when the session was replaced or a `close` has taken it over.
    fn remove_if_starting(&self, local_port: u16, id: Uuid) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&local_port) {
            Some(entry) if entry.id == id && entry.state == SessionState::GraceWindow => {
                sessions.remove(&local_port);
                true
            }
            _ => false,
        }
    }

    /// Remove the entry on `local_port` only if it is still session `id`
    fn remove_if_current(&self, local_port: u16, id: Uuid) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&local_port) {
            Some(entry) if entry.id == id => {
                sessions.remove(&local_port);
                true
            }
            _ => false,
        }
    }

    /// Start forwarding `target.local_port` to the target
    ///
    /// Returns once the process has survived the grace period. A process
    /// that exits before then yields [`OpsError::ProcessSpawnFailure`] with
    /// its stderr, and leaves nothing registered.
    pub async fn open(&self, target: ForwardTarget) -> OpsResult<SessionSummary> {
        let local_port = target.local_port;
        let command = ForwardCommand::kubectl(&self.config.kubectl, &target);
        let id = Uuid::new_v4();

        {
            let mut sessions = self.lock();
            if let Some(existing) = sessions.get(&local_port) {
                if let ProcessStatus::Running = existing.status() {
                    return Err(OpsError::AlreadyForwarding { local_port });
                }
                debug!(local_port, "Replacing exited session");
            }
            sessions.insert(
                local_port,
                SessionEntry::reserve(id, target.clone(), command.clone()),
            );
        }

        let mut reservation = Reservation {
            registry: self,
            local_port,
            id,
            armed: true,
        };

        let process = match self.runtime.spawn(&command).await {
            Ok(process) => process,
            Err(e) => {
                warn!(local_port, command = %command, error = %e, "Failed to spawn port-forward");
                return Err(OpsError::ProcessSpawnFailure {
                    local_port,
                    stderr: e.to_string(),
                });
            }
        };

        let recorded = {
            let mut sessions = self.lock();
            match sessions.get_mut(&local_port) {
                Some(entry) if entry.id == id => {
                    entry.process = Some(process.clone());
                    entry.state = SessionState::GraceWindow;
                    entry.grace_deadline = Some(Instant::now() + self.config.grace_period);
                    true
                }
                _ => false,
            }
        };
        reservation.disarm();

        if !recorded {
            debug!(local_port, "Session closed while spawning, stopping process");
            if let Err(e) = process
                .terminate(self.config.terminate_timeout, self.config.kill_timeout)
                .await
            {
                warn!(local_port, error = %e, "Failed to stop aborted port-forward");
            }
            return Err(OpsError::Aborted { local_port });
        }

        if let Some(exit) = wait_for_exit(process.as_ref(), self.config.grace_period).await {
            if !self.remove_if_starting(local_port, id) {
                return Err(OpsError::Aborted { local_port });
            }

            let diagnostics = process.diagnostics().await;
            let stderr = if diagnostics.is_empty() {
                format!("process exited with {}", exit)
            } else {
                diagnostics
            };
            warn!(
                local_port,
                target = %target.resource(),
                namespace = %target.namespace,
                exit = %exit,
                "Port-forward exited during startup"
            );
            return Err(OpsError::ProcessSpawnFailure { local_port, stderr });
        }

        let mut sessions = self.lock();
        match sessions.get_mut(&local_port) {
            Some(entry) if entry.id == id && entry.state == SessionState::GraceWindow => {
                entry.state = SessionState::Active;
                info!(
                    local_port,
                    remote_port = target.remote_port,
                    target = %target.resource(),
                    namespace = %target.namespace,
                    pid = ?process.pid(),
                    "Port-forward active"
                );
                Ok(entry.summary())
            }
            _ => Err(OpsError::Aborted { local_port }),
        }
    }

    /// Stop the session on `local_port` and remove it
    ///
    /// The entry stays registered as `Terminating` until its process is
    /// confirmed gone, so the port cannot be reopened over a survivor.
    pub async fn close(&self, local_port: u16) -> OpsResult<CloseOutcome> {
        let (id, process) = {
            let mut sessions = self.lock();
            let entry = sessions
                .get_mut(&local_port)
                .ok_or(OpsError::NotFound { local_port })?;

            let Some(process) = entry.process.clone() else {
                sessions.remove(&local_port);
                info!(local_port, "Cancelled port-forward that was still starting");
                return Ok(CloseOutcome::Cancelled);
            };
            entry.state = SessionState::Terminating;
            (entry.id, process)
        };

        let outcome = process
            .terminate(self.config.terminate_timeout, self.config.kill_timeout)
            .await;
        if outcome.is_ok() {
            self.remove_if_current(local_port, id);
        }

        match outcome {
            Ok(TerminateOutcome::AlreadyExited(exit)) => {
                info!(local_port, exit = %exit, "Removed exited port-forward");
                Ok(CloseOutcome::AlreadyExited)
            }
            Ok(TerminateOutcome::Stopped(_)) => {
                info!(local_port, "Port-forward stopped");
                Ok(CloseOutcome::Stopped)
            }
            Ok(TerminateOutcome::Killed(_)) => {
                warn!(local_port, "Port-forward killed after ignoring stop signal");
                Ok(CloseOutcome::Killed)
            }
            Err(e) => {
                warn!(local_port, pid = ?process.pid(), error = %e, "Port-forward did not exit");
                Err(OpsError::ProcessTerminateTimeout { local_port })
            }
        }
    }

    /// Summaries of every session, ordered by local port
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.lock();
        let mut summaries: Vec<_> = sessions.values().map(SessionEntry::summary).collect();
        summaries.sort_by_key(|s| s.local_port);
        summaries
    }

    pub fn get(&self, local_port: u16) -> Option<SessionSummary> {
        self.lock().get(&local_port).map(SessionEntry::summary)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of sessions whose process is still running
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.process.is_some() && e.status() == ProcessStatus::Running)
            .count()
    }

    /// Drop every entry whose process has exited
    pub fn prune(&self) -> Vec<SessionSummary> {
        let mut sessions = self.lock();
        let exited: Vec<u16> = sessions
            .iter()
            .filter(|(_, e)| matches!(e.status(), ProcessStatus::Exited(_)))
            .map(|(port, _)| *port)
            .collect();

        let mut pruned: Vec<_> = exited
            .into_iter()
            .filter_map(|port| sessions.remove(&port))
            .map(|e| e.summary())
            .collect();
        pruned.sort_by_key(|s| s.local_port);

        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned exited port-forwards");
        }
        pruned
    }

    /// Empty the table and stop every live process
    ///
    /// Returns how many running processes were stopped.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(u16, SessionEntry)> = self.lock().drain().collect();
        let terminate_timeout = self.config.terminate_timeout;
        let kill_timeout = self.config.kill_timeout;

        let mut tasks = JoinSet::new();
        for (local_port, entry) in drained {
            if let Some(process) = entry.process {
                tasks.spawn(async move {
                    let outcome = process.terminate(terminate_timeout, kill_timeout).await;
                    (local_port, outcome)
                });
            }
        }

        let mut stopped = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(TerminateOutcome::Stopped(_) | TerminateOutcome::Killed(_)))) => {
                    stopped += 1
                }
                Ok((_, Ok(TerminateOutcome::AlreadyExited(_)))) => {}
                Ok((local_port, Err(e))) => {
                    warn!(local_port, error = %e, "Port-forward survived shutdown")
                }
                Err(e) => warn!(error = %e, "Shutdown task failed"),
            }
        }

        info!(stopped, "Port-forward registry shut down");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::super::supervisor::ProcessError;
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Default)]
    struct FakeChild {
        pid: u32,
        exited: AtomicBool,
        ignores_stop: bool,
        stderr: String,
        stop_requests: AtomicUsize,
    }

    impl FakeChild {
        fn exit_externally(&self) {
            self.exited.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn poll(&self) -> ProcessStatus {
            if self.exited.load(Ordering::SeqCst) {
                ProcessStatus::Exited(ExitInfo {
                    code: Some(1),
                    signal: None,
                })
            } else {
                ProcessStatus::Running
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
            self.stop_requests.fetch_add(1, Ordering::SeqCst);
            if self.ignores_stop {
                tokio::time::sleep(grace + kill_timeout).await;
                return Err(ProcessError::StillRunning {
                    pid: Some(self.pid),
                });
            }
            self.exited.store(true, Ordering::SeqCst);
            Ok(TerminateOutcome::Stopped(ExitInfo {
                code: None,
                signal: Some(15),
            }))
        }

        async fn diagnostics(&self) -> String {
            self.stderr.clone()
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        spawn_delay: Duration,
        exit_with_stderr: Option<String>,
        fail_spawn: bool,
        ignores_stop: bool,
        next_pid: AtomicU32,
        spawned: Mutex<Vec<Arc<FakeChild>>>,
    }

    impl FakeRuntime {
        fn spawned(&self) -> Vec<Arc<FakeChild>> {
            self.spawned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessRuntime for FakeRuntime {
        async fn spawn(
            &self,
            command: &ForwardCommand,
        ) -> Result<Arc<dyn ChildProcess>, ProcessError> {
            tokio::time::sleep(self.spawn_delay).await;
            if self.fail_spawn {
                return Err(ProcessError::Spawn {
                    program: command.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }

            let child = Arc::new(FakeChild {
                pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                exited: AtomicBool::new(self.exit_with_stderr.is_some()),
                ignores_stop: self.ignores_stop,
                stderr: self.exit_with_stderr.clone().unwrap_or_default(),
                stop_requests: AtomicUsize::new(0),
            });
            self.spawned.lock().unwrap().push(child.clone());
            Ok(child)
        }
    }

    fn target(local_port: u16) -> ForwardTarget {
        ForwardTarget::new(TargetKind::Pod, "web", "default", local_port, 80).unwrap()
    }

    fn registry(runtime: Arc<FakeRuntime>) -> PortForwardRegistry {
        PortForwardRegistry::new(runtime, RegistryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_registers_active_session() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        let summary = registry.open(target(8080)).await.unwrap();
        assert_eq!(summary.state, SessionState::Active);
        assert!(summary.alive);
        assert_eq!(summary.pid, Some(1000));
        assert_eq!(summary.command, "kubectl port-forward pod/web 8080:80 -n default");

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local_port, 8080);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_is_already_forwarding() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        let err = registry.open(target(8080)).await.unwrap_err();

        assert!(matches!(err, OpsError::AlreadyForwarding { local_port: 8080 }));
        assert_eq!(registry.len(), 1);
        assert_eq!(runtime.spawned().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_open_same_port_spawns_once() {
        let runtime = Arc::new(FakeRuntime {
            spawn_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let registry = registry(runtime.clone());

        let (first, second) = tokio::join!(registry.open(target(8080)), registry.open(target(8080)));
        assert!(first.is_ok() != second.is_ok());
        assert_eq!(runtime.spawned().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_during_grace_is_spawn_failure() {
        let runtime = Arc::new(FakeRuntime {
            exit_with_stderr: Some("error: pods \"web\" not found".to_string()),
            ..Default::default()
        });
        let registry = registry(runtime);

        let err = registry.open(target(8080)).await.unwrap_err();
        match err {
            OpsError::ProcessSpawnFailure { local_port, stderr } => {
                assert_eq!(local_port, 8080);
                assert_eq!(stderr, "error: pods \"web\" not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_error_leaves_no_entry() {
        let runtime = Arc::new(FakeRuntime {
            fail_spawn: true,
            ..Default::default()
        });
        let registry = registry(runtime);

        let err = registry.open(target(8080)).await.unwrap_err();
        assert!(matches!(err, OpsError::ProcessSpawnFailure { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_distinct_ports_overlap() {
        let runtime = Arc::new(FakeRuntime {
            spawn_delay: Duration::from_secs(1),
            ..Default::default()
        });
        let registry = registry(runtime);

        let started = Instant::now();
        let (a, b) = tokio::join!(registry.open(target(8080)), registry.open(target(9090)));
        a.unwrap();
        b.unwrap();

        // Sequential opens would take two spawn delays plus two grace periods
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_reports_external_exit() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        runtime.spawned()[0].exit_externally();

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].alive);
        assert_eq!(listed[0].state, SessionState::Terminated);
        assert_eq!(listed[0].exit.and_then(|e| e.code), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_external_exit() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        runtime.spawned()[0].exit_externally();

        let outcome = registry.close(8080).await.unwrap();
        assert_eq!(outcome, CloseOutcome::AlreadyExited);
        assert!(!outcome.was_running());
        assert!(registry.is_empty());
        assert_eq!(runtime.spawned()[0].stop_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_live_process() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        let outcome = registry.close(8080).await.unwrap();

        assert_eq!(outcome, CloseOutcome::Stopped);
        assert!(registry.is_empty());
        assert_eq!(runtime.spawned()[0].stop_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_missing_is_not_found() {
        let registry = registry(Arc::new(FakeRuntime::default()));
        let err = registry.close(8080).await.unwrap_err();
        assert!(matches!(err, OpsError::NotFound { local_port: 8080 }));
        assert_eq!(err.to_string(), "No port forward found for local port 8080");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_is_replaced() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        let first = registry.open(target(8080)).await.unwrap();
        runtime.spawned()[0].exit_externally();

        let second = registry.open(target(8080)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.alive);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_grace_aborts_open() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        let opener = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.open(target(8080)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.get(8080).map(|s| s.state), Some(SessionState::GraceWindow));

        assert_eq!(registry.close(8080).await.unwrap(), CloseOutcome::Stopped);
        let err = opener.await.unwrap().unwrap_err();
        assert!(matches!(err, OpsError::Aborted { local_port: 8080 }));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_open_stays_closable() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(500), registry.open(target(8080))).await;
        assert!(abandoned.is_err());

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].alive);

        assert_eq!(registry.close(8080).await.unwrap(), CloseOutcome::Stopped);
        assert!(runtime.spawned()[0].exited.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_dropped_while_spawning_releases_slot() {
        let runtime = Arc::new(FakeRuntime {
            spawn_delay: Duration::from_secs(1),
            ..Default::default()
        });
        let registry = registry(runtime);

        let abandoned = tokio::time::timeout(Duration::from_millis(100), registry.open(target(8080))).await;
        assert!(abandoned.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_timeout_keeps_entry() {
        let runtime = Arc::new(FakeRuntime {
            ignores_stop: true,
            ..Default::default()
        });
        let registry = registry(runtime);

        registry.open(target(8080)).await.unwrap();
        let err = registry.close(8080).await.unwrap_err();

        assert!(matches!(err, OpsError::ProcessTerminateTimeout { local_port: 8080 }));
        let remaining = registry.get(8080).unwrap();
        assert_eq!(remaining.state, SessionState::Terminating);
        assert!(remaining.alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_while_close_is_stuck_is_rejected() {
        let runtime = Arc::new(FakeRuntime {
            ignores_stop: true,
            ..Default::default()
        });
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        let closer = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.close(8080).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.get(8080).map(|s| s.state), Some(SessionState::Terminating));

        let err = registry.open(target(8080)).await.unwrap_err();
        assert!(matches!(err, OpsError::AlreadyForwarding { local_port: 8080 }));

        let closed = closer.await.unwrap();
        assert!(matches!(closed, Err(OpsError::ProcessTerminateTimeout { local_port: 8080 })));

        // The survivor is still tracked, and no second process was started
        assert_eq!(runtime.spawned().len(), 1);
        let remaining = registry.get(8080).unwrap();
        assert_eq!(remaining.pid, Some(1000));
        assert_eq!(remaining.state, SessionState::Terminating);
        assert!(remaining.alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_open_turns_active_after_grace() {
        let registry = registry(Arc::new(FakeRuntime::default()));

        let abandoned = tokio::time::timeout(Duration::from_millis(500), registry.open(target(8080))).await;
        assert!(abandoned.is_err());
        assert_eq!(registry.get(8080).map(|s| s.state), Some(SessionState::GraceWindow));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let summary = registry.get(8080).unwrap();
        assert_eq!(summary.state, SessionState::Active);
        assert!(summary.alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removes_exited_only() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        registry.open(target(9090)).await.unwrap();
        runtime.spawned()[0].exit_externally();

        let pruned = registry.prune();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].local_port, 8080);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let runtime = Arc::new(FakeRuntime::default());
        let registry = registry(runtime.clone());

        registry.open(target(8080)).await.unwrap();
        registry.open(target(9090)).await.unwrap();
        registry.open(target(7070)).await.unwrap();
        runtime.spawned()[2].exit_externally();

        assert_eq!(registry.shutdown().await, 2);
        assert!(registry.is_empty());
        assert!(runtime
            .spawned()
            .iter()
            .all(|c| c.exited.load(Ordering::SeqCst)));
    }
}
