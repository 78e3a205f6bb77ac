use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::compare;
use crate::compiler::{self, CompileFailure};
use crate::domain::{ExecutionLimits, SubmissionResult, Verdict};
use crate::languages::LanguageRegistry;
use crate::reporter::Reporter;
use crate::sandbox::{ExecStatus, Sandbox};
use crate::store::Store;
use crate::workspace::Workspace;

/// Per-submission judging pipeline: load, prepare, compile, execute each
/// test case in order, aggregate, report. Every failure becomes exactly one
/// terminal verdict; nothing is re-thrown to the consumer, and the workspace
/// is destroyed on every exit path.
pub struct JudgePipeline {
    store: Arc<dyn Store>,
    sandbox: Arc<dyn Sandbox>,
    reporter: Option<Arc<dyn Reporter>>,
    languages: Arc<LanguageRegistry>,
    scratch_root: PathBuf,
}

impl JudgePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        sandbox: Arc<dyn Sandbox>,
        reporter: Option<Arc<dyn Reporter>>,
        languages: Arc<LanguageRegistry>,
        scratch_root: PathBuf,
    ) -> Self {
        JudgePipeline {
            store,
            sandbox,
            reporter,
            languages,
            scratch_root,
        }
    }

    #[tracing::instrument(skip_all, fields(submission_id = %submission_id))]
    pub async fn process(&self, cancel: &CancellationToken, submission_id: &str) {
        // A failed status update must not block judging.
        if let Err(err) = self.store.update_status(submission_id, Verdict::Judging).await {
            tracing::warn!(error = %err, "failed to mark submission as judging");
        }

        let submission = match self.store.get_submission(submission_id).await {
            Ok(submission) => submission,
            Err(err) => {
                tracing::error!(error = %err, "failed to load submission");
                self.finish(submission_id, SubmissionResult::internal_error(), None)
                    .await;
                return;
            }
        };

        let problem = match self.store.get_problem(&submission.problem_id.to_hex()).await {
            Ok(problem) => problem,
            Err(err) => {
                tracing::error!(
                    problem_id = %submission.problem_id,
                    error = %err,
                    "failed to load problem"
                );
                self.finish(submission_id, SubmissionResult::internal_error(), None)
                    .await;
                return;
            }
        };

        let Some(language) = self.languages.get(&submission.language) else {
            tracing::error!(language = %submission.language, "unsupported language");
            self.finish(submission_id, SubmissionResult::internal_error(), None)
                .await;
            return;
        };

        let mut workspace = match Workspace::prepare(
            &self.scratch_root,
            submission_id,
            &submission.source_code,
            language,
        )
        .await
        {
            Ok(workspace) => workspace,
            Err(err) => {
                tracing::error!(error = %err, "failed to prepare workspace");
                self.finish(submission_id, SubmissionResult::internal_error(), None)
                    .await;
                return;
            }
        };

        let executable = match compiler::compile(&workspace, language, cancel).await {
            Ok(executable) => executable,
            Err(CompileFailure::Rejected { diagnostics }) => {
                self.finish(
                    submission_id,
                    SubmissionResult::compilation_error(diagnostics),
                    Some(&mut workspace),
                )
                .await;
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "compiler driver failed");
                self.finish(
                    submission_id,
                    SubmissionResult::internal_error(),
                    Some(&mut workspace),
                )
                .await;
                return;
            }
        };

        tracing::debug!(executable = %executable, cases = problem.test_cases.len(), "starting test run");

        let limits = ExecutionLimits::for_problem(&problem);
        let mut max_memory_kb: i64 = 0;
        let mut total_time_ms: i64 = 0;

        for (index, case) in problem.test_cases.iter().enumerate() {
            let report = match self
                .sandbox
                .execute(&workspace, &language.run_cmd, &case.input, &limits, cancel)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    // Infrastructure failure, not a user bug.
                    tracing::error!(test = index, error = %err, "sandbox failure");
                    self.finish(
                        submission_id,
                        SubmissionResult::internal_error(),
                        Some(&mut workspace),
                    )
                    .await;
                    return;
                }
            };

            max_memory_kb = max_memory_kb.max(report.memory_used_kb as i64);
            total_time_ms += report.execution_time_ms as i64;

            match report.status {
                ExecStatus::Completed => {
                    if !compare::outputs_match(&report.stdout, &case.output) {
                        tracing::info!(test = index, "wrong answer");
                        self.finish(
                            submission_id,
                            SubmissionResult::terminal(
                                Verdict::WrongAnswer,
                                report.execution_time_ms as i64,
                                max_memory_kb,
                            ),
                            Some(&mut workspace),
                        )
                        .await;
                        return;
                    }
                    tracing::debug!(
                        test = index,
                        execution_time_ms = report.execution_time_ms,
                        "test case passed"
                    );
                }
                failed => {
                    let verdict = verdict_for(&failed);
                    tracing::info!(
                        test = index,
                        verdict = %verdict,
                        stderr = %report.stderr.trim(),
                        "test case failed"
                    );
                    self.finish(
                        submission_id,
                        SubmissionResult::terminal(
                            verdict,
                            report.execution_time_ms as i64,
                            max_memory_kb,
                        ),
                        Some(&mut workspace),
                    )
                    .await;
                    return;
                }
            }
        }

        let case_count = problem.test_cases.len() as i64;
        let average_time_ms = if case_count == 0 {
            0
        } else {
            total_time_ms / case_count
        };
        self.finish(
            submission_id,
            SubmissionResult::terminal(Verdict::Accepted, average_time_ms, max_memory_kb),
            Some(&mut workspace),
        )
        .await;
    }

    /// Terminal transition: report the verdict (store first, then the
    /// optional callback), then destroy the workspace. Delivery failures are
    /// logged, never propagated.
    async fn finish(
        &self,
        submission_id: &str,
        result: SubmissionResult,
        workspace: Option<&mut Workspace>,
    ) {
        tracing::info!(
            status = %result.status,
            execution_time_ms = result.execution_time_ms,
            memory_used_kb = result.memory_used_kb,
            "judging finished"
        );

        if let Err(err) = self.store.update_result(submission_id, &result).await {
            tracing::error!(error = %err, "failed to write result to store");
        }
        if let Some(reporter) = &self.reporter {
            if let Err(err) = reporter.report(submission_id, &result).await {
                tracing::warn!(error = %err, "callback delivery failed");
            }
        }
        if let Some(workspace) = workspace {
            workspace.destroy(self.sandbox.as_ref()).await;
        }
    }
}

fn verdict_for(status: &ExecStatus) -> Verdict {
    match status {
        ExecStatus::Completed => Verdict::Accepted,
        ExecStatus::TimeLimitExceeded => Verdict::TimeLimitExceeded,
        ExecStatus::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
        ExecStatus::RuntimeError { .. } => Verdict::RuntimeError,
    }
}
