// ABOUTME: HTTP client for the coordinator's job queue and status report endpoints
// ABOUTME: Retries transport failures on reports and parses response directives

use std::fmt;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times a status report is attempted before giving up.
const REPORT_ATTEMPTS: u32 = 8;
const REPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid coordinator response: {0}")]
    InvalidResponse(String),

    #[error("status report failed after {attempts} attempts")]
    ReportExhausted { attempts: u32 },
}

/// Outbound job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Running,
    Completed,
    Error,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ReportStatus::Running => "RUNNING",
            ReportStatus::Completed => "COMPLETED",
            ReportStatus::Error => "ERROR",
        };
        f.write_str(status)
    }
}

/// The coordinator's per-report instruction: continue or stop the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Ok,
    Cancel,
    Error,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let directive = match self {
            Directive::Ok => "OK",
            Directive::Cancel => "CANCEL",
            Directive::Error => "ERROR",
        };
        f.write_str(directive)
    }
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    status: String,
}

/// HTTP client to the coordinator.
pub struct Connection {
    client: reqwest::Client,
    endpoint: String,
    report_attempts: u32,
    report_retry_delay: Duration,
}

impl Connection {
    pub fn new(endpoint: String) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            report_attempts: REPORT_ATTEMPTS,
            report_retry_delay: REPORT_RETRY_DELAY,
        })
    }

    /// Override the report retry policy; tests shorten it.
    pub fn with_report_policy(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.report_attempts = attempts;
        self.report_retry_delay = retry_delay;
        self
    }

    /// Fetch the next job payload from the queue, if one is available.
    ///
    /// An empty body means the queue is empty. Payload validation is the
    /// caller's concern; this returns the raw JSON.
    pub async fn fetch_job(&self, token: &str) -> Result<Option<Value>, ConnectionError> {
        let url = format!("{}/jobs/queue/{token}", self.endpoint);
        let response = self.client.get(&url).send().await?.error_for_status()?;

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }

        let payload = serde_json::from_slice(&body).map_err(|err| {
            ConnectionError::InvalidResponse(format!("job payload is not valid JSON: {err}"))
        })?;
        Ok(Some(payload))
    }

    /// Report a job's status, with the drained log as the raw body.
    ///
    /// Transport failures are retried on a fixed delay up to the configured
    /// attempt count; exhaustion surfaces as [`ConnectionError::ReportExhausted`].
    /// An unparsable response or unknown directive is a hard error and is
    /// not retried.
    pub async fn report(
        &self,
        secret: &str,
        status: ReportStatus,
        log: Option<String>,
    ) -> Result<Directive, ConnectionError> {
        let url = format!("{}/jobs/report/{secret}?status={status}", self.endpoint);

        for attempt in 1..=self.report_attempts {
            match self.try_report(&url, log.clone()).await {
                Ok(directive) => {
                    debug!(job = %secret, %status, %directive, "status reported");
                    return Ok(directive);
                }
                Err(ConnectionError::Transport(err)) => {
                    warn!(
                        job = %secret,
                        attempt,
                        error = %err,
                        "status report failed"
                    );
                    if attempt < self.report_attempts {
                        tokio::time::sleep(self.report_retry_delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(ConnectionError::ReportExhausted {
            attempts: self.report_attempts,
        })
    }

    async fn try_report(
        &self,
        url: &str,
        log: Option<String>,
    ) -> Result<Directive, ConnectionError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(log.unwrap_or_default())
            .send()
            .await?
            .error_for_status()?;

        let body: ReportResponse = response.json().await.map_err(|err| {
            if err.is_decode() {
                ConnectionError::InvalidResponse(format!(
                    "report response is not valid JSON: {err}"
                ))
            } else {
                ConnectionError::Transport(err)
            }
        })?;

        match body.status.as_str() {
            "OK" => Ok(Directive::Ok),
            "CANCEL" => Ok(Directive::Cancel),
            "ERROR" => Ok(Directive::Error),
            other => Err(ConnectionError::InvalidResponse(format!(
                "unknown directive `{other}` in report response"
            ))),
        }
    }
}
