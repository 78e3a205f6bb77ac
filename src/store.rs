use std::future::IntoFuture;
use std::time::Duration;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, DateTime};
use mongodb::{Client, Collection, Database};

use crate::domain::{Problem, Submission, SubmissionResult, Verdict};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("malformed document id: {0}")]
    InvalidId(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("store transport failure: {0}")]
    Transport(#[from] mongodb::error::Error),
}

/// Typed read/update access to submissions and problems. Implementations
/// must keep `NotFound` and malformed-id errors distinguishable from
/// transport failures.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    async fn get_submission(&self, submission_id: &str) -> Result<Submission, StoreError>;

    async fn get_problem(&self, problem_id: &str) -> Result<Problem, StoreError>;

    async fn update_status(&self, submission_id: &str, status: Verdict) -> Result<(), StoreError>;

    /// Writes the terminal verdict and metrics atomically, stamping
    /// `updatedAt`.
    async fn update_result(
        &self,
        submission_id: &str,
        result: &SubmissionResult,
    ) -> Result<(), StoreError>;
}

/// MongoDB-backed store. Every operation runs under the configured
/// per-operation deadline.
#[derive(Clone, Debug)]
pub struct MongoStore {
    db: Database,
    op_timeout: Duration,
}

impl MongoStore {
    pub async fn connect(
        uri: &str,
        db_name: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(db_name);
        let store = MongoStore { db, op_timeout };
        store
            .with_deadline(store.db.run_command(doc! { "ping": 1 }))
            .await?;
        Ok(store)
    }

    fn submissions(&self) -> Collection<Submission> {
        self.db.collection("submissions")
    }

    fn problems(&self) -> Collection<Problem> {
        self.db.collection("problems")
    }

    async fn with_deadline<T, E, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        StoreError: From<E>,
    {
        match tokio::time::timeout(self.op_timeout, op.into_future()).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

fn parse_object_id(raw: &str) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(raw).map_err(|_| StoreError::InvalidId(raw.to_string()))
}

#[async_trait::async_trait]
impl Store for MongoStore {
    async fn get_submission(&self, submission_id: &str) -> Result<Submission, StoreError> {
        let id = parse_object_id(submission_id)?;
        let found = self
            .with_deadline(self.submissions().find_one(doc! { "_id": id }))
            .await?;
        found.ok_or_else(|| StoreError::NotFound {
            kind: "submission",
            id: submission_id.to_string(),
        })
    }

    async fn get_problem(&self, problem_id: &str) -> Result<Problem, StoreError> {
        let id = parse_object_id(problem_id)?;
        let found = self
            .with_deadline(self.problems().find_one(doc! { "_id": id }))
            .await?;
        found.ok_or_else(|| StoreError::NotFound {
            kind: "problem",
            id: problem_id.to_string(),
        })
    }

    async fn update_status(&self, submission_id: &str, status: Verdict) -> Result<(), StoreError> {
        let id = parse_object_id(submission_id)?;
        let update = doc! {
            "$set": {
                "status": status.as_str(),
                "updatedAt": DateTime::now(),
            }
        };
        self.with_deadline(self.submissions().update_one(doc! { "_id": id }, update))
            .await?;
        tracing::debug!(submission_id, status = %status, "submission status updated");
        Ok(())
    }

    async fn update_result(
        &self,
        submission_id: &str,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        let id = parse_object_id(submission_id)?;
        let update = doc! {
            "$set": {
                "status": result.status.as_str(),
                "executionTimeMs": result.execution_time_ms,
                "memoryUsedKb": result.memory_used_kb,
                "compileOutput": result.compile_output.as_deref().unwrap_or(""),
                "updatedAt": DateTime::now(),
            }
        };
        self.with_deadline(self.submissions().update_one(doc! { "_id": id }, update))
            .await?;
        tracing::info!(
            submission_id,
            status = %result.status,
            execution_time_ms = result.execution_time_ms,
            memory_used_kb = result.memory_used_kb,
            "submission result written"
        );
        Ok(())
    }
}
