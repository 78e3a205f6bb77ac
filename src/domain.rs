use std::fmt;

use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize, Serializer};

/// Extra wall-clock headroom on top of the CPU limit, so I/O-bound or
/// sleeping programs still terminate.
pub const WALL_CLOCK_SLACK_MS: u64 = 5_000;

/// Lifecycle status of a submission. The string forms are part of the
/// external contract shared with the API server and the frontend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Judging,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    RuntimeError,
    InternalError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pending => "Pending",
            Verdict::Judging => "Judging",
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::CompilationError => "Compilation Error",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::InternalError => "Internal Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Pending | Verdict::Judging)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One user attempt at a problem, as stored in the `submissions` collection.
/// The worker only reads these fields; the verdict is written back separately.
#[derive(Clone, Debug, Deserialize)]
pub struct Submission {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(rename = "problemId")]
    pub problem_id: ObjectId,
    #[serde(rename = "sourceCode", alias = "code")]
    pub source_code: String,
    pub language: String,
    #[serde(default)]
    pub status: String,
}

/// A judging target from the `problems` collection. `time_limit_s` is in
/// seconds, `memory_limit_mb` in megabytes; test case order is significant.
#[derive(Clone, Debug, Deserialize)]
pub struct Problem {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "timeLimit")]
    pub time_limit_s: u64,
    #[serde(rename = "memoryLimit")]
    pub memory_limit_mb: u64,
    #[serde(rename = "testCases", default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

/// The terminal outcome of judging one submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub status: Verdict,
    pub execution_time_ms: i64,
    pub memory_used_kb: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
}

impl SubmissionResult {
    pub fn terminal(status: Verdict, execution_time_ms: i64, memory_used_kb: i64) -> Self {
        SubmissionResult {
            status,
            execution_time_ms,
            memory_used_kb,
            compile_output: None,
        }
    }

    pub fn compilation_error(compile_output: String) -> Self {
        SubmissionResult {
            status: Verdict::CompilationError,
            execution_time_ms: 0,
            memory_used_kb: 0,
            compile_output: Some(compile_output),
        }
    }

    pub fn internal_error() -> Self {
        SubmissionResult::terminal(Verdict::InternalError, 0, 0)
    }
}

/// Resource caps for one sandboxed test-case execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_mb: u64,
}

impl ExecutionLimits {
    /// Derives per-case limits from a problem. `timeLimit` is stored in
    /// seconds and converted exactly once here; the wall-clock deadline is
    /// the CPU limit plus a fixed slack.
    pub fn for_problem(problem: &Problem) -> Self {
        let cpu_time_ms = problem.time_limit_s * 1000;
        ExecutionLimits {
            cpu_time_ms,
            wall_time_ms: cpu_time_ms + WALL_CLOCK_SLACK_MS,
            memory_mb: problem.memory_limit_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_strings_match_external_contract() {
        assert_eq!(Verdict::Pending.as_str(), "Pending");
        assert_eq!(Verdict::Judging.as_str(), "Judging");
        assert_eq!(Verdict::Accepted.as_str(), "Accepted");
        assert_eq!(Verdict::WrongAnswer.as_str(), "Wrong Answer");
        assert_eq!(Verdict::TimeLimitExceeded.as_str(), "Time Limit Exceeded");
        assert_eq!(Verdict::MemoryLimitExceeded.as_str(), "Memory Limit Exceeded");
        assert_eq!(Verdict::CompilationError.as_str(), "Compilation Error");
        assert_eq!(Verdict::RuntimeError.as_str(), "Runtime Error");
        assert_eq!(Verdict::InternalError.as_str(), "Internal Error");
    }

    #[test]
    fn only_pending_and_judging_are_non_terminal() {
        assert!(!Verdict::Pending.is_terminal());
        assert!(!Verdict::Judging.is_terminal());
        assert!(Verdict::Accepted.is_terminal());
        assert!(Verdict::InternalError.is_terminal());
    }

    #[test]
    fn result_serializes_with_camel_case_fields() {
        let result = SubmissionResult::terminal(Verdict::Accepted, 42, 1024);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "Accepted");
        assert_eq!(json["executionTimeMs"], 42);
        assert_eq!(json["memoryUsedKb"], 1024);
        assert!(json.get("compileOutput").is_none());
    }

    #[test]
    fn compilation_error_carries_diagnostics() {
        let result = SubmissionResult::compilation_error("main.cpp:1: error".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "Compilation Error");
        assert_eq!(json["compileOutput"], "main.cpp:1: error");
    }

    #[test]
    fn limits_convert_seconds_and_add_wall_slack() {
        let problem = Problem {
            id: ObjectId::new(),
            title: String::new(),
            time_limit_s: 2,
            memory_limit_mb: 256,
            test_cases: vec![],
        };
        let limits = ExecutionLimits::for_problem(&problem);
        assert_eq!(limits.cpu_time_ms, 2_000);
        assert_eq!(limits.wall_time_ms, 7_000);
        assert_eq!(limits.memory_mb, 256);
    }
}
