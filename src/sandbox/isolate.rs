use std::process::Stdio;
use std::time::Duration;

use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::domain::ExecutionLimits;
use crate::sandbox::traits::{ExecStatus, ExecutionReport, Sandbox, SandboxError};
use crate::workspace::Workspace;

const STDIN_FILE: &str = "input.txt";
const STDOUT_FILE: &str = "output.txt";
const STDERR_FILE: &str = "stderr.txt";
const META_FILE: &str = "meta.txt";

/// Headroom past the wall deadline before we give up on isolate itself.
const HARD_STOP_SLACK: Duration = Duration::from_secs(10);

/// Sandbox backend shelling out to the `isolate` jail tool. Each submission
/// gets a box keyed by the workspace's box id; limits are passed as isolate
/// flags and measurements come back through the meta file.
#[derive(Debug, Default)]
pub struct IsolateSandbox;

impl IsolateSandbox {
    pub fn new() -> Self {
        IsolateSandbox
    }
}

#[async_trait::async_trait]
impl Sandbox for IsolateSandbox {
    async fn execute(
        &self,
        workspace: &Workspace,
        run_cmd: &[String],
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, SandboxError> {
        if run_cmd.is_empty() {
            return Err(SandboxError::Backend("empty run command".to_string()));
        }

        let dir = workspace.dir();
        fs::write(dir.join(STDIN_FILE), stdin).await?;

        let mut args = vec![
            format!("--box-id={}", workspace.box_id()),
            "--cg".to_string(),
            format!("--time={}", limits.cpu_time_ms as f64 / 1000.0),
            format!("--wall-time={}", limits.wall_time_ms as f64 / 1000.0),
            format!("--mem={}", limits.memory_mb * 1024),
            "--fsize=65536".to_string(),
            "--processes=100".to_string(),
            "--dir=/sys/fs/cgroup:/sys/fs/cgroup".to_string(),
            "--full-env".to_string(),
            format!("--stdin={STDIN_FILE}"),
            format!("--stdout={STDOUT_FILE}"),
            format!("--stderr={STDERR_FILE}"),
            format!("--meta={META_FILE}"),
            "--run".to_string(),
            "--".to_string(),
        ];
        args.extend(run_cmd.iter().cloned());

        let mut cmd = Command::new("isolate");
        cmd.args(&args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(box_id = workspace.box_id(), ?args, "running isolate");

        let child = cmd.spawn().map_err(SandboxError::Launch)?;
        let hard_stop = Duration::from_millis(limits.wall_time_ms) + HARD_STOP_SLACK;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            waited = timeout(hard_stop, child.wait_with_output()) => match waited {
                // isolate ignored its own wall limit; nothing to salvage.
                Err(_) => {
                    return Err(SandboxError::Backend(
                        "isolate exceeded its hard deadline".to_string(),
                    ))
                }
                Ok(result) => result.map_err(SandboxError::Io)?,
            },
        };

        let stdout = read_and_remove(dir.join(STDOUT_FILE)).await;
        let stderr = read_and_remove(dir.join(STDERR_FILE)).await;
        let meta_raw = read_and_remove(dir.join(META_FILE)).await;
        let _ = fs::remove_file(dir.join(STDIN_FILE)).await;

        let meta = IsolateMeta::parse(&meta_raw);
        let isolate_stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let status = if output.status.success() {
            ExecStatus::Completed
        } else {
            match classify_meta(&meta, limits) {
                Some(status) => status,
                None => {
                    // isolate failed without classifying the program: the
                    // deployment is broken, not the submission.
                    return Err(SandboxError::Backend(format!(
                        "isolate exited with {:?}: {}",
                        output.status.code(),
                        isolate_stderr.trim()
                    )));
                }
            }
        };

        let execution_time_ms = match status {
            ExecStatus::TimeLimitExceeded if meta.time_cpu_ms == 0 => limits.cpu_time_ms,
            _ => meta.time_cpu_ms,
        };

        Ok(ExecutionReport {
            status,
            stdout,
            stderr,
            execution_time_ms,
            memory_used_kb: meta.max_rss_kb,
        })
    }

    async fn cleanup(&self, workspace: &Workspace) {
        let result = Command::new("isolate")
            .arg(format!("--box-id={}", workspace.box_id()))
            .arg("--cleanup")
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(output) if !output.status.success() => {
                tracing::warn!(
                    box_id = workspace.box_id(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "isolate cleanup failed"
                );
            }
            Err(err) => {
                tracing::warn!(box_id = workspace.box_id(), error = %err, "isolate cleanup failed");
            }
            _ => {}
        }
    }
}

async fn read_and_remove(path: std::path::PathBuf) -> String {
    let content = fs::read_to_string(&path).await.unwrap_or_default();
    let _ = fs::remove_file(&path).await;
    content
}

/// The subset of isolate's meta file the judge consumes.
#[derive(Clone, Debug, Default, PartialEq)]
struct IsolateMeta {
    time_cpu_ms: u64,
    wall_time_ms: u64,
    max_rss_kb: u64,
    status: Option<String>,
    exit_signal: Option<i32>,
    exit_code: Option<i32>,
    oom_killed: bool,
    message: Option<String>,
}

impl IsolateMeta {
    /// Parses `key:value` lines; unknown keys are ignored.
    fn parse(raw: &str) -> Self {
        let mut meta = IsolateMeta::default();
        for line in raw.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "time" => {
                    if let Ok(seconds) = value.parse::<f64>() {
                        meta.time_cpu_ms = (seconds * 1000.0) as u64;
                    }
                }
                "time-wall" => {
                    if let Ok(seconds) = value.parse::<f64>() {
                        meta.wall_time_ms = (seconds * 1000.0) as u64;
                    }
                }
                "max-rss" | "cg-mem" => {
                    if let Ok(kb) = value.parse::<u64>() {
                        meta.max_rss_kb = meta.max_rss_kb.max(kb);
                    }
                }
                "status" => meta.status = Some(value.to_string()),
                "exitsig" => meta.exit_signal = value.parse().ok(),
                "exitcode" => meta.exit_code = value.parse().ok(),
                "cg-oom-killed" => meta.oom_killed = value == "1",
                "message" => meta.message = Some(value.to_string()),
                _ => {}
            }
        }
        meta
    }
}

/// Maps an isolate verdict to the sandbox contract's priority order. `None`
/// means isolate reported no program-level failure and the caller must treat
/// the run as an infrastructure error.
fn classify_meta(meta: &IsolateMeta, limits: &ExecutionLimits) -> Option<ExecStatus> {
    let memory_limit_kb = limits.memory_mb * 1024;
    match meta.status.as_deref() {
        Some("TO") => Some(ExecStatus::TimeLimitExceeded),
        Some("ML") => Some(ExecStatus::MemoryLimitExceeded),
        Some("SG") => {
            if meta.exit_signal == Some(libc::SIGXCPU) {
                Some(ExecStatus::TimeLimitExceeded)
            } else if meta.exit_signal == Some(libc::SIGXFSZ) {
                // The --fsize cap kills with SIGXFSZ.
                Some(ExecStatus::RuntimeError {
                    reason: "output limit exceeded".to_string(),
                })
            } else if meta.oom_killed || meta.max_rss_kb >= memory_limit_kb {
                Some(ExecStatus::MemoryLimitExceeded)
            } else {
                Some(ExecStatus::RuntimeError {
                    reason: format!(
                        "killed by signal {}",
                        meta.exit_signal.unwrap_or_default()
                    ),
                })
            }
        }
        Some("RE") => {
            if meta.oom_killed {
                Some(ExecStatus::MemoryLimitExceeded)
            } else {
                Some(ExecStatus::RuntimeError {
                    reason: format!("exit code {}", meta.exit_code.unwrap_or_default()),
                })
            }
        }
        // "XX" (isolate internal error), unknown statuses, and a missing
        // status all mean isolate never judged the program.
        _ => None,
    }
}
