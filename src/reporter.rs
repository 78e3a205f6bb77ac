use std::time::Duration;

use serde::Serialize;

use crate::config::CallbackConfig;
use crate::domain::SubmissionResult;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SECRET_HEADER: &str = "x-internal-secret";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("callback transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("callback rejected with status {0}")]
    Rejected(u16),
}

/// Delivers the terminal verdict to the originating system. The store write
/// is authoritative; callers treat reporter failures as log-only.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Reporter: Send + Sync + std::fmt::Debug {
    async fn report(
        &self,
        submission_id: &str,
        result: &SubmissionResult,
    ) -> Result<(), ReportError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultEnvelope<'a> {
    submission_id: &'a str,
    result: &'a SubmissionResult,
}

/// POSTs `{ submissionId, result }` to the internal API with the shared
/// secret header and a fixed per-request deadline.
#[derive(Clone, Debug)]
pub struct CallbackReporter {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl CallbackReporter {
    pub fn new(config: &CallbackConfig) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(CallbackReporter {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Reporter for CallbackReporter {
    async fn report(
        &self,
        submission_id: &str,
        result: &SubmissionResult,
    ) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.url)
            .header(SECRET_HEADER, &self.secret)
            .json(&ResultEnvelope {
                submission_id,
                result,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ReportError::Rejected(response.status().as_u16()));
        }
        tracing::debug!(submission_id, "callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Verdict;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn envelope_matches_the_wire_contract() {
        let result = SubmissionResult::terminal(Verdict::WrongAnswer, 12, 2048);
        let envelope = ResultEnvelope {
            submission_id: "abc123",
            result: &result,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["submissionId"], "abc123");
        assert_eq!(json["result"]["status"], "Wrong Answer");
        assert_eq!(json["result"]["executionTimeMs"], 12);
        assert_eq!(json["result"]["memoryUsedKb"], 2048);
    }

    /// Minimal one-shot HTTP server; answers with the given status line and
    /// hands back the raw request bytes (headers and full body).
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/callback", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .to_lowercase()
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:").map(str::trim).map(str::to_string))
                        .and_then(|value| value.parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn report_posts_json_with_secret_header() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let reporter = CallbackReporter::new(&CallbackConfig {
            url,
            secret: "hunter2".to_string(),
        })
        .unwrap();

        let result = SubmissionResult::terminal(Verdict::Accepted, 5, 640);
        reporter.report("sub-9", &result).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /callback"));
        assert!(request.to_lowercase().contains("x-internal-secret: hunter2"));
        assert!(request.to_lowercase().contains("content-type: application/json"));
        assert!(request.contains(r#""submissionId":"sub-9""#));
        assert!(request.contains(r#""status":"Accepted""#));
    }

    #[tokio::test]
    async fn non_2xx_response_is_rejected() {
        let (url, server) = one_shot_server("HTTP/1.1 500 Internal Server Error").await;
        let reporter = CallbackReporter::new(&CallbackConfig {
            url,
            secret: "hunter2".to_string(),
        })
        .unwrap();

        let result = SubmissionResult::internal_error();
        let err = reporter.report("sub-10", &result).await.unwrap_err();
        assert!(matches!(err, ReportError::Rejected(500)));
        let _ = server.await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let reporter = CallbackReporter::new(&CallbackConfig {
            // Reserved port on localhost with nothing listening.
            url: "http://127.0.0.1:9/callback".to_string(),
            secret: "s".to_string(),
        })
        .unwrap();
        let err = reporter
            .report("sub-11", &SubmissionResult::internal_error())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Transport(_)));
    }
}
