use tokio_util::sync::CancellationToken;

use crate::domain::ExecutionLimits;
use crate::workspace::Workspace;

/// Captured stdout/stderr are bounded; exceeding either buffer kills the
/// process and classifies the run as a runtime error.
pub const OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// How one sandboxed execution ended, seen from the user program's side.
/// Infrastructure failures are *not* represented here; they surface as
/// [`SandboxError`] so a broken deployment can never masquerade as a user
/// bug.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Completed,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError { reason: String },
}

/// Measurements and outputs of one test-case execution.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    /// User + system CPU time. On a CPU-cap kill this may be the cap itself.
    pub execution_time_ms: u64,
    /// Peak resident set size.
    pub memory_used_kb: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to launch sandboxed process: {0}")]
    Launch(#[source] std::io::Error),
    #[error("sandbox i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox backend failure: {0}")]
    Backend(String),
    #[error("execution cancelled by shutdown")]
    Cancelled,
}

/// OS-level isolation backend. Implementations must uphold the caps in
/// [`ExecutionLimits`], deliver stdin in full with a deterministic EOF, and
/// classify exits with wall-deadline first, then CPU, then memory, then
/// runtime failure.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    async fn execute(
        &self,
        workspace: &Workspace,
        run_cmd: &[String],
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, SandboxError>;

    /// Tears down per-submission backend state (e.g. an isolate box). Must
    /// be safe to call on a box that was never used.
    async fn cleanup(&self, workspace: &Workspace);
}
