//! Generic JSON-over-HTTP collaborators
//!
//! Provides:
//! - a shared reqwest client with explicit connect/request timeouts
//! - [`HttpGenerationProvider`]: submit + status polling against a job API
//! - [`WebhookPublishTarget`]: posts `{media_url, caption}` to an endpoint
//!
//! Responses are classified through [`classify_response`] so every adaptor
//! reports failures the same way.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::classify::classify_response;
use super::{
    ClientError, ClientResult, Credentials, GenerationProviderClient, JobState, JobStatus,
    PublishTargetClient,
};
use crate::model::{MediaUrl, ProductMetadata};

/// HTTP connect timeout - time to establish the TCP connection
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default overall request timeout
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of response body bytes kept in error messages
const ERROR_BODY_LIMIT: usize = 512;

/// Placeholder replaced by the job id in status URLs
pub const JOB_ID_PLACEHOLDER: &str = "{job_id}";

/// Build the HTTP client shared by every adaptor
///
/// One client is built per process so connection pooling works across all
/// providers and targets.
pub fn build_http_client(request_timeout: Duration) -> ClientResult<Arc<Client>> {
    Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .user_agent(concat!("product-video-publisher/", env!("CARGO_PKG_VERSION")))
        .build()
        .map(Arc::new)
        .map_err(|e| ClientError::other(format!("failed to build HTTP client: {e}")))
}

/// Decode a JSON body or classify the failure
async fn read_json<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if !status.is_success() {
        let kind = classify_response(status, response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::new(
            kind,
            format!("HTTP {}: {}", status.as_u16(), truncate_body(&body)),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| ClientError::malformed(format!("failed to decode response: {e}")))
}

fn truncate_body(body: &str) -> &str {
    if body.len() <= ERROR_BODY_LIMIT {
        return body.trim();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].trim()
}

/// Map a provider status string onto [`JobState`]
///
/// Unknown values are treated as still processing; the polling timeout bounds
/// how long that can last.
pub fn parse_job_state(status: &str) -> JobState {
    match status.trim().to_ascii_lowercase().as_str() {
        "queued" | "pending" | "submitted" | "waiting" => JobState::Queued,
        "succeeded" | "success" | "completed" | "complete" | "done" | "ready" => {
            JobState::Succeeded
        }
        "failed" | "failure" | "error" | "cancelled" | "canceled" | "rejected" => {
            JobState::Failed
        }
        _ => JobState::Processing,
    }
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    script: &'a str,
    metadata: &'a ProductMetadata,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id", alias = "video_id")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default, alias = "video_url", alias = "url")]
    media_url: Option<String>,
    #[serde(default, alias = "message")]
    error: Option<String>,
}

/// Generation provider speaking a simple submit/status JSON protocol
///
/// `POST submit_url {script, metadata}` returns `{"job_id": ...}`;
/// `GET status_url` (with `{job_id}` substituted) returns
/// `{"status": ..., "media_url": ..., "error": ...}`.
#[derive(Debug, Clone)]
pub struct HttpGenerationProvider {
    client: Arc<Client>,
    submit_url: String,
    status_url: String,
    credentials: Credentials,
}

impl HttpGenerationProvider {
    /// Create a provider client
    pub fn new(
        client: Arc<Client>,
        submit_url: impl Into<String>,
        status_url: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            client,
            submit_url: submit_url.into(),
            status_url: status_url.into(),
            credentials,
        }
    }

    /// Status URL for a job
    pub fn status_url_for(&self, job_id: &str) -> String {
        if self.status_url.contains(JOB_ID_PLACEHOLDER) {
            self.status_url.replace(JOB_ID_PLACEHOLDER, job_id)
        } else {
            format!("{}/{}", self.status_url.trim_end_matches('/'), job_id)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.secret() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl GenerationProviderClient for HttpGenerationProvider {
    async fn submit(&self, script: &str, metadata: &ProductMetadata) -> ClientResult<String> {
        debug!(url = %self.submit_url, "submitting generation job");
        let request = self
            .client
            .post(&self.submit_url)
            .json(&SubmitRequest { script, metadata });
        let response = self.authorize(request).send().await?;
        let body: SubmitResponse = read_json(response).await?;

        if body.job_id.trim().is_empty() {
            return Err(ClientError::malformed("provider returned an empty job id"));
        }
        Ok(body.job_id)
    }

    async fn poll_status(&self, job_id: &str) -> ClientResult<JobStatus> {
        let url = self.status_url_for(job_id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        let body: StatusResponse = read_json(response).await?;

        Ok(JobStatus {
            state: parse_job_state(&body.status),
            media_url: body.media_url.filter(|u| !u.trim().is_empty()),
            error: body.error,
        })
    }
}

#[derive(Debug, Serialize)]
struct PostRequest<'a> {
    media_url: &'a str,
    caption: &'a str,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    #[serde(alias = "id")]
    post_id: serde_json::Value,
}

/// Publish target posting to a JSON webhook
///
/// Useful for relays (automation platforms, internal publishing services) that
/// own the platform-specific upload mechanics.
#[derive(Debug, Clone)]
pub struct WebhookPublishTarget {
    client: Arc<Client>,
    endpoint: String,
}

impl WebhookPublishTarget {
    /// Create a webhook target
    pub fn new(client: Arc<Client>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PublishTargetClient for WebhookPublishTarget {
    async fn post(
        &self,
        media_url: &MediaUrl,
        caption: &str,
        credentials: &Credentials,
    ) -> ClientResult<String> {
        let mut request = self.client.post(&self.endpoint).json(&PostRequest {
            media_url: media_url.as_str(),
            caption,
        });
        if let Some(token) = credentials.secret() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let body: PostResponse = read_json(response).await?;

        // Platforms disagree on numeric vs string ids
        match body.post_id {
            serde_json::Value::String(id) if !id.trim().is_empty() => Ok(id),
            serde_json::Value::Number(id) => Ok(id.to_string()),
            other => Err(ClientError::malformed(format!(
                "unexpected post id in response: {other}"
            ))),
        }
    }
}
