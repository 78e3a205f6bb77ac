use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::languages::LanguageSpec;
use crate::workspace::Workspace;

/// Fixed wall-clock deadline for one compilation.
pub const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CompileFailure {
    /// The compiler ran and said no; `diagnostics` is its stderr (or the
    /// fixed timeout message). Maps to a Compilation Error verdict.
    #[error("compilation rejected: {diagnostics}")]
    Rejected { diagnostics: String },
    /// Shutdown interrupted the compile; not the submitter's fault.
    #[error("compilation interrupted by shutdown")]
    Interrupted,
    /// The compiler could not be run at all.
    #[error("failed to run compiler: {0}")]
    Internal(#[source] std::io::Error),
}

/// Runs the language's compile command with the workspace as working
/// directory and returns the executable reference. Interpreted languages
/// (empty compile command) succeed immediately with the source filename.
///
/// The compiler is trusted and runs outside the sandbox; the workspace CWD
/// keeps its outputs contained.
pub async fn compile(
    workspace: &Workspace,
    language: &LanguageSpec,
    cancel: &CancellationToken,
) -> Result<String, CompileFailure> {
    let Some((program, args)) = language.compile_cmd.split_first() else {
        tracing::debug!(
            submission_id = %workspace.submission_id(),
            "interpreted language, skipping compilation"
        );
        return Ok(language.source_file.clone());
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(CompileFailure::Internal)?;

    // Drain stderr concurrently so a chatty compiler cannot block on a full
    // pipe before we wait on it.
    let stderr_task = {
        let mut stderr = child.stderr.take();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Some(stream) = stderr.as_mut() {
                let _ = stream.read_to_end(&mut buffer).await;
            }
            buffer
        })
    };

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(CompileFailure::Internal)?;
            let stderr = stderr_task.await.unwrap_or_default();
            if status.success() {
                tracing::debug!(
                    submission_id = %workspace.submission_id(),
                    executable = %language.executable_ref(),
                    "compilation succeeded"
                );
                Ok(language.executable_file.clone())
            } else {
                Err(CompileFailure::Rejected {
                    diagnostics: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
        }
        _ = sleep(COMPILE_TIMEOUT) => {
            let _ = child.start_kill();
            Err(CompileFailure::Rejected {
                diagnostics: "compilation timeout".to_string(),
            })
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            Err(CompileFailure::Interrupted)
        }
    }
}
