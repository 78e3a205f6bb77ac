mod isolate;
mod process;
mod traits;

use std::str::FromStr;
use std::sync::Arc;

pub use isolate::IsolateSandbox;
pub use process::ProcessSandbox;
#[cfg(test)]
pub use traits::MockSandbox;
pub use traits::{ExecStatus, ExecutionReport, Sandbox, SandboxError, OUTPUT_LIMIT_BYTES};

/// Backend selector, fixed at construction time. A daemon instance never
/// mixes backends across submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxKind {
    /// Resource-limited child process in its own network namespace
    /// (rlimits + /proc accounting). Does not jail the filesystem.
    Process,
    /// The `isolate` jail tool (control groups, namespaces). The default.
    Isolate,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown sandbox backend: {0}")]
pub struct UnknownBackend(String);

impl FromStr for SandboxKind {
    type Err = UnknownBackend;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "process" => Ok(SandboxKind::Process),
            "isolate" => Ok(SandboxKind::Isolate),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

pub fn create(kind: SandboxKind) -> Arc<dyn Sandbox> {
    match kind {
        SandboxKind::Process => Arc::new(ProcessSandbox::new()),
        SandboxKind::Isolate => Arc::new(IsolateSandbox::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_tags_parse() {
        assert_eq!("process".parse::<SandboxKind>().unwrap(), SandboxKind::Process);
        assert_eq!("isolate".parse::<SandboxKind>().unwrap(), SandboxKind::Isolate);
        assert!("docker".parse::<SandboxKind>().is_err());
    }
}
