use std::future::Future;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const POP_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// The wire shape of one queued job.
#[derive(Debug, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "submissionId", default)]
    pub submission_id: String,
}

/// Single-flight consumer over a Redis list. Jobs are acknowledged by the
/// pop itself; there is no prefetch and no redelivery — the terminal verdict
/// is the system's acknowledgement.
pub struct QueueConsumer {
    connection: MultiplexedConnection,
    queue_name: String,
}

impl QueueConsumer {
    pub fn new(connection: MultiplexedConnection, queue_name: String) -> Self {
        QueueConsumer {
            connection,
            queue_name,
        }
    }

    /// Blocks on the queue until `cancel` fires, dispatching each valid job
    /// to `handler`. An in-flight handler always runs to completion; pop
    /// failures back off for a second before retrying.
    pub async fn start<F, Fut>(mut self, cancel: CancellationToken, handler: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::info!(queue = %self.queue_name, "waiting for jobs");
        loop {
            let popped: redis::RedisResult<Option<(String, String)>> = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("queue consumer stopping");
                    return;
                }
                result = self.connection.blpop(&self.queue_name, 0.0) => result,
            };

            match popped {
                Ok(Some((_, payload))) => {
                    tracing::debug!(payload = %payload, "received job");
                    let Some(submission_id) = parse_envelope(&payload) else {
                        continue;
                    };
                    handler(submission_id).await;
                }
                // A nil reply from a blocking pop only happens on timeout
                // variants; just go around again.
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "queue pop failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("queue consumer stopping");
                            return;
                        }
                        _ = tokio::time::sleep(POP_FAILURE_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

/// Extracts the submission id from a raw queue payload. Invalid JSON and
/// empty ids are discarded with a log entry.
fn parse_envelope(payload: &str) -> Option<String> {
    match serde_json::from_str::<JobEnvelope>(payload) {
        Ok(envelope) if !envelope.submission_id.is_empty() => Some(envelope.submission_id),
        Ok(_) => {
            tracing::warn!(payload = %payload, "discarding job with empty submissionId");
            None
        }
        Err(err) => {
            tracing::warn!(payload = %payload, error = %err, "discarding malformed job");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_envelope_yields_submission_id() {
        assert_eq!(
            parse_envelope(r#"{"submissionId":"665f1c2ab3d4e5f6a7b8c9d0"}"#),
            Some("665f1c2ab3d4e5f6a7b8c9d0".to_string())
        );
    }

    #[test]
    fn extra_fields_are_tolerated() {
        assert_eq!(
            parse_envelope(r#"{"submissionId":"abc","priority":3}"#),
            Some("abc".to_string())
        );
    }

    #[test]
    fn empty_submission_id_is_discarded() {
        assert_eq!(parse_envelope(r#"{"submissionId":""}"#), None);
    }

    #[test]
    fn missing_submission_id_is_discarded() {
        assert_eq!(parse_envelope(r#"{"jobId":"abc"}"#), None);
    }

    #[test]
    fn malformed_json_is_discarded() {
        assert_eq!(parse_envelope("{not json"), None);
        assert_eq!(parse_envelope(""), None);
    }
}
