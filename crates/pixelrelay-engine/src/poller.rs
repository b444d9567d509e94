use async_trait::async_trait;
use pixelrelay_contracts::config::PollConfig;
use pixelrelay_contracts::job::{JobHandle, JobStatus, Prediction};
use pixelrelay_contracts::output::flatten_output_urls;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::RelayError;
use crate::http::{response_json_or_error, transport_error};

const PROVIDER: &str = "Replicate";

/// Network side of a submit/poll job protocol.
#[async_trait]
pub trait PredictionTransport: Send + Sync {
    async fn submit(&self, endpoint: &str, payload: &Value) -> Result<Prediction, RelayError>;

    async fn fetch(&self, poll_url: &str) -> Result<Prediction, RelayError>;

    /// Polling location for a job whose response carried no `urls.get`.
    fn fallback_poll_url(&self, id: &str) -> String;
}

/// Replicate prediction API over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReplicateTransport {
    api_base: String,
    api_token: Option<String>,
    config: PollConfig,
    http: HttpClient,
}

impl ReplicateTransport {
    pub fn new(api_base: impl Into<String>, api_token: Option<String>, config: PollConfig) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token,
            config,
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn token(&self) -> Result<&str, RelayError> {
        self.api_token
            .as_deref()
            .ok_or(RelayError::MissingCredential {
                env: "REPLICATE_API_TOKEN",
            })
    }

    /// Authenticated GET returning the JSON body.
    pub async fn get_json(&self, url: &str) -> Result<Value, RelayError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|source| transport_error(PROVIDER, url, source))?;
        response_json_or_error(PROVIDER, response).await
    }
}

#[async_trait]
impl PredictionTransport for ReplicateTransport {
    async fn submit(&self, endpoint: &str, payload: &Value) -> Result<Prediction, RelayError> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(self.token()?)
            .timeout(self.config.request_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|source| transport_error(PROVIDER, endpoint, source))?;
        let body = response_json_or_error(PROVIDER, response).await?;
        parse_prediction(body)
    }

    async fn fetch(&self, poll_url: &str) -> Result<Prediction, RelayError> {
        let body = self.get_json(poll_url).await?;
        parse_prediction(body)
    }

    fn fallback_poll_url(&self, id: &str) -> String {
        format!("{}/predictions/{}", self.api_base, id)
    }
}

fn parse_prediction(body: Value) -> Result<Prediction, RelayError> {
    serde_json::from_value(body).map_err(|err| {
        RelayError::invalid_response(PROVIDER, format!("malformed prediction: {err}"))
    })
}

/// Drives a submitted job to a terminal state.
///
/// Starting, processing and unrecognised statuses keep the loop going; the
/// loop sleeps `config.interval` before every status check and stops at the
/// configured deadline. Dropping the returned future cancels polling at its
/// next await point.
pub struct JobPoller<T> {
    transport: T,
    config: PollConfig,
}

impl<T: PredictionTransport> JobPoller<T> {
    pub fn new(transport: T, config: PollConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub async fn submit_and_await(
        &self,
        endpoint: &str,
        payload: &Value,
    ) -> Result<Vec<String>, RelayError> {
        let prediction = self.transport.submit(endpoint, payload).await?;
        tracing::info!(
            id = %prediction.id,
            status = %prediction.status,
            "prediction submitted"
        );
        let handle = self.handle_for(prediction)?;
        self.await_handle(handle).await
    }

    pub fn handle_for(&self, prediction: Prediction) -> Result<JobHandle, RelayError> {
        let poll_url = match prediction.poll_url() {
            Some(url) => url.to_string(),
            None if !prediction.id.trim().is_empty() => {
                self.transport.fallback_poll_url(prediction.id.trim())
            }
            None if prediction.status().is_terminal() => String::new(),
            None => {
                return Err(RelayError::invalid_response(
                    PROVIDER,
                    "prediction has neither an id nor a poll URL",
                ))
            }
        };
        Ok(JobHandle::new(prediction, poll_url))
    }

    pub async fn await_handle(&self, mut handle: JobHandle) -> Result<Vec<String>, RelayError> {
        let started = Instant::now();
        let mut transient_failures = 0usize;
        loop {
            match handle.status() {
                JobStatus::Succeeded => {
                    let urls = flatten_output_urls(&handle.last().output);
                    tracing::info!(id = handle.id(), outputs = urls.len(), "prediction succeeded");
                    return Ok(urls);
                }
                JobStatus::Failed | JobStatus::Canceled => {
                    let detail = handle
                        .last()
                        .error_detail()
                        .unwrap_or_else(|| "no error detail provided".to_string());
                    tracing::info!(
                        id = handle.id(),
                        status = %handle.status(),
                        detail = %detail,
                        "prediction ended without output"
                    );
                    return Err(RelayError::JobFailed {
                        id: handle.id().to_string(),
                        status: handle.status().to_string(),
                        detail,
                    });
                }
                JobStatus::Unknown(raw) => {
                    tracing::debug!(id = handle.id(), status = %raw, "unrecognised status, still polling");
                }
                JobStatus::Submitted | JobStatus::Starting | JobStatus::Processing => {}
            }

            let elapsed = started.elapsed();
            if self.config.deadline.is_exceeded(elapsed) {
                return Err(RelayError::JobTimeout {
                    id: handle.id().to_string(),
                    status: handle.status().to_string(),
                    elapsed,
                });
            }

            tokio::time::sleep(self.config.interval).await;
            tracing::debug!(id = handle.id(), url = handle.poll_url(), "polling prediction");
            match self.transport.fetch(handle.poll_url()).await {
                Ok(prediction) => {
                    transient_failures = 0;
                    handle.observe(prediction);
                }
                Err(err) if err.is_transient() && transient_failures < self.config.transient_retries => {
                    transient_failures += 1;
                    tracing::warn!(
                        id = handle.id(),
                        attempt = transient_failures,
                        error = %err,
                        "transient poll failure"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
