//! Port-forward tunnels backed by `kubectl port-forward` child processes

pub mod registry;
pub mod supervisor;
pub mod target;

pub use registry::{
    CloseOutcome, PortForwardRegistry, RegistryConfig, SessionState, SessionSummary,
};
pub use supervisor::{
    wait_for_exit, ChildProcess, ExitInfo, ForwardCommand, ProcessError, ProcessRuntime,
    ProcessStatus, TerminateOutcome, TokioProcessRuntime,
};
pub use target::{check_port, ForwardTarget, TargetKind};
