use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::ExecutionLimits;
use crate::sandbox::traits::{
    ExecStatus, ExecutionReport, Sandbox, SandboxError, OUTPUT_LIMIT_BYTES,
};
use crate::workspace::Workspace;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 8 * 1024;

/// Sandbox backend that runs the user program as a direct child process in
/// its own session and a fresh network namespace, with hard rlimits (CPU,
/// address space), a wall-clock watchdog in the parent, and `/proc/<pid>`
/// sampling for CPU time and peak RSS. Filesystem visibility is not
/// restricted beyond the workspace cwd; the isolate backend jails that too.
#[derive(Debug, Default)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        ProcessSandbox
    }
}

#[async_trait::async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        workspace: &Workspace,
        run_cmd: &[String],
        stdin: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, SandboxError> {
        let (program, args) = run_cmd
            .split_first()
            .ok_or_else(|| SandboxError::Backend("empty run command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_rlimits(&mut cmd, limits);

        let mut child = cmd.spawn().map_err(SandboxError::Launch)?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Backend("spawned process has no pid".to_string()))?;

        // Deliver stdin in full, then close the write end for a
        // deterministic EOF. Done on a task so a program that never reads
        // cannot deadlock us against a full pipe.
        if let Some(mut handle) = child.stdin.take() {
            let payload = stdin.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = handle.write_all(&payload).await;
                let _ = handle.shutdown().await;
            });
        }

        let (overrun_tx, mut overrun_rx) = mpsc::channel::<()>(2);
        let stdout_task = spawn_bounded_reader(child.stdout.take(), overrun_tx.clone());
        let stderr_task = spawn_bounded_reader(child.stderr.take(), overrun_tx);

        let deadline = sleep(Duration::from_millis(limits.wall_time_ms));
        tokio::pin!(deadline);
        let mut sampler = interval(SAMPLE_INTERVAL);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut usage = ResourceUsage::default();
        let mut wall_expired = false;
        let mut output_overrun = false;
        let mut cancelled = false;

        let status: ExitStatus = loop {
            tokio::select! {
                // Sampling doubles as exit detection: the child stays a
                // readable zombie until try_wait reaps it, so the last
                // sample still sees final utime/stime.
                _ = sampler.tick() => {
                    usage.sample(pid);
                    match child.try_wait() {
                        Ok(Some(status)) => break status,
                        Ok(None) => {}
                        Err(err) => return Err(SandboxError::Io(err)),
                    }
                }
                _ = &mut deadline, if !wall_expired => {
                    wall_expired = true;
                    kill_tree(pid, &mut child);
                }
                Some(_) = overrun_rx.recv(), if !output_overrun => {
                    output_overrun = true;
                    kill_tree(pid, &mut child);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    kill_tree(pid, &mut child);
                }
            }
        };

        let (stdout, _) = stdout_task.await.unwrap_or_default();
        let (stderr, _) = stderr_task.await.unwrap_or_default();

        if cancelled && !wall_expired {
            return Err(SandboxError::Cancelled);
        }

        let facts = ExitFacts {
            wall_expired,
            output_overrun,
            signal: status.signal(),
            exit_code: status.code(),
            cpu_time_ms: usage.cpu_time_ms,
            vm_peak_kb: usage.vm_peak_kb,
        };
        let exec_status = classify(&facts, limits);

        let execution_time_ms = match exec_status {
            // CPU-cap kills may not leave an exact reading; report the cap.
            ExecStatus::TimeLimitExceeded if !wall_expired => limits.cpu_time_ms,
            _ => usage.cpu_time_ms,
        };

        Ok(ExecutionReport {
            status: exec_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            execution_time_ms,
            memory_used_kb: usage.peak_rss_kb,
        })
    }

    async fn cleanup(&self, _workspace: &Workspace) {
        // No per-submission state beyond the workspace directory itself.
    }
}

/// Everything needed to classify an exit, separated from the live process
/// machinery so the priority order can be tested directly.
#[derive(Clone, Copy, Debug)]
struct ExitFacts {
    wall_expired: bool,
    output_overrun: bool,
    signal: Option<i32>,
    exit_code: Option<i32>,
    cpu_time_ms: u64,
    vm_peak_kb: u64,
}

/// Exit classification, first match wins: wall deadline, CPU cap, memory
/// cap, output overrun, fatal signal, non-zero exit, success.
fn classify(facts: &ExitFacts, limits: &ExecutionLimits) -> ExecStatus {
    let memory_limit_kb = limits.memory_mb * 1024;

    if facts.wall_expired {
        return ExecStatus::TimeLimitExceeded;
    }
    if facts.signal == Some(libc::SIGXCPU) || facts.cpu_time_ms >= limits.cpu_time_ms {
        return ExecStatus::TimeLimitExceeded;
    }
    // An address-space cap shows up as allocation failure (abort or non-zero
    // exit) or an OOM SIGKILL; the peak VM size having reached the cap is
    // the common signal for all three. The cap itself is unreachable under
    // RLIMIT_AS, so allow a 2% margin.
    let memory_threshold_kb = memory_limit_kb - memory_limit_kb / 50;
    if (facts.signal.is_some() || facts.exit_code != Some(0))
        && facts.vm_peak_kb >= memory_threshold_kb
    {
        return ExecStatus::MemoryLimitExceeded;
    }
    if facts.output_overrun {
        return ExecStatus::RuntimeError {
            reason: "output limit exceeded".to_string(),
        };
    }
    if let Some(signal) = facts.signal {
        return ExecStatus::RuntimeError {
            reason: format!("killed by signal {signal}"),
        };
    }
    match facts.exit_code {
        Some(0) => ExecStatus::Completed,
        Some(code) => ExecStatus::RuntimeError {
            reason: format!("exit code {code}"),
        },
        None => ExecStatus::RuntimeError {
            reason: "terminated without exit status".to_string(),
        },
    }
}

fn apply_rlimits(cmd: &mut Command, limits: &ExecutionLimits) {
    let cpu_seconds = (limits.cpu_time_ms.div_ceil(1000)).max(1);
    let memory_bytes = limits.memory_mb.saturating_mul(1024 * 1024);
    unsafe {
        cmd.pre_exec(move || {
            let cpu = libc::rlimit {
                rlim_cur: cpu_seconds as libc::rlim_t,
                rlim_max: (cpu_seconds + 1) as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let address_space = libc::rlimit {
                rlim_cur: memory_bytes as libc::rlim_t,
                rlim_max: memory_bytes as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &address_space) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Own session, so killing the group takes the whole subtree.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Cut the child off from the network before exec: a plain
            // network namespace when the daemon has CAP_SYS_ADMIN, paired
            // with a user namespace otherwise. Failure aborts the spawn.
            if libc::unshare(libc::CLONE_NEWNET) != 0
                && libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn kill_tree(pid: u32, child: &mut tokio::process::Child) {
    // The child called setsid, so its pid is the process-group id.
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
    let _ = child.start_kill();
}

fn spawn_bounded_reader<R>(
    stream: Option<R>,
    overrun: mpsc::Sender<()>,
) -> JoinHandle<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return (Vec::new(), false);
        };
        let mut buffer = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => return (buffer, false),
                Ok(n) => {
                    if buffer.len() + n > OUTPUT_LIMIT_BYTES {
                        let _ = overrun.send(()).await;
                        return (buffer, true);
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                }
                Err(_) => return (buffer, false),
            }
        }
    })
}

#[derive(Clone, Copy, Debug, Default)]
struct ResourceUsage {
    cpu_time_ms: u64,
    peak_rss_kb: u64,
    vm_peak_kb: u64,
}

impl ResourceUsage {
    fn sample(&mut self, pid: u32) {
        if let Some((hwm, peak)) = read_memory_kb(pid) {
            self.peak_rss_kb = self.peak_rss_kb.max(hwm);
            self.vm_peak_kb = self.vm_peak_kb.max(peak);
        }
        if let Some(cpu) = read_cpu_time_ms(pid) {
            self.cpu_time_ms = self.cpu_time_ms.max(cpu);
        }
    }
}

/// (VmHWM, VmPeak) in kB from `/proc/<pid>/status`. Gone once the process
/// is reaped; callers keep the running maximum.
fn read_memory_kb(pid: u32) -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let mut hwm = None;
    let mut peak = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            hwm = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmPeak:") {
            peak = parse_kb(rest);
        }
    }
    Some((hwm.unwrap_or(0), peak.unwrap_or(0)))
}

fn parse_kb(raw: &str) -> Option<u64> {
    raw.trim().trim_end_matches("kB").trim().parse().ok()
}

/// utime + stime from `/proc/<pid>/stat`, converted from clock ticks.
/// Remains readable while the process is a zombie.
fn read_cpu_time_ms(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesised command name; utime and stime are
    // overall fields 14 and 15.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000 / clock_ticks_per_second())
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}
