//! Capability interfaces for external collaborators
//!
//! The pipeline never talks to a concrete service. Product sources, script
//! writers, generation providers, publish targets, writeback sinks and media
//! probes are injected behind these traits. Generic HTTP adaptors live in the
//! submodules; platform-specific clients can be swapped in freely.

use crate::fingerprint::ProductFingerprint;
use crate::model::{MediaUrl, Outcome, Product, ProductMetadata};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub mod classify;
pub mod http;
pub mod probe;
pub mod script;
pub mod source;
pub mod writeback;

pub use classify::FailureKind;
pub use writeback::{CsvWritebackSink, NoopSink};

/// Error returned by any collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    /// Classification driving retry decisions
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
}

impl ClientError {
    /// Create an error of the given kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Connection level failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    /// HTTP 429 with optional Retry-After
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::new(FailureKind::RateLimited { retry_after }, "HTTP 429")
    }

    /// Non-success HTTP status
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::new(FailureKind::from_status(status, None), message)
    }

    /// Unparseable or contract-violating payload
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Malformed, message)
    }

    /// Remote job not finished yet
    pub fn still_processing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::StillProcessing, message)
    }

    /// Remote job failed terminally
    pub fn permanently_failed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PermanentlyFailed, message)
    }

    /// Local problem (configuration, I/O)
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    /// Call skipped because shutdown was requested
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "shutdown requested before the call")
    }

    /// Default retry classification
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(FailureKind::from_reqwest(&err), err.to_string())
    }
}

/// Result type for collaborator calls
pub type ClientResult<T> = Result<T, ClientError>;

/// Credentials handed to a publish target
///
/// The token is redacted from `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: Option<String>,
}

impl Credentials {
    /// No credentials
    pub fn none() -> Self {
        Self::default()
    }

    /// Bearer token credentials
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Read the token from an environment variable
    ///
    /// An unset or empty variable yields no credentials.
    pub fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Self::token(value.trim()),
            _ => Self::none(),
        }
    }

    /// The secret, if any
    pub fn secret(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether a secret is present
    pub fn is_present(&self) -> bool {
        self.token.is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of products for one processing cycle
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// Load every product of the cycle
    async fn products(&self) -> ClientResult<Vec<Product>>;
}

/// Writes the narration script fed to generation providers
#[async_trait]
pub trait ScriptProvider: Send + Sync {
    /// Produce the script for a product
    async fn script(&self, metadata: &ProductMetadata) -> ClientResult<String>;
}

/// State reported by a generation provider for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepted but not started
    Queued,
    /// Rendering
    Processing,
    /// Finished; a media URL should be present
    Succeeded,
    /// Terminal failure
    Failed,
}

/// Result of a status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Job state
    pub state: JobState,
    /// Media URL (raw, validated by the coordinator)
    pub media_url: Option<String>,
    /// Provider error message
    pub error: Option<String>,
}

impl JobStatus {
    /// Job still running
    pub fn processing() -> Self {
        Self {
            state: JobState::Processing,
            media_url: None,
            error: None,
        }
    }

    /// Job finished with the given URL
    pub fn succeeded(url: impl Into<String>) -> Self {
        Self {
            state: JobState::Succeeded,
            media_url: Some(url.into()),
            error: None,
        }
    }

    /// Job failed
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            media_url: None,
            error: Some(error.into()),
        }
    }
}

/// Long-running video generation service
#[async_trait]
pub trait GenerationProviderClient: Send + Sync {
    /// Submit a job and return the provider's job id
    async fn submit(&self, script: &str, metadata: &ProductMetadata) -> ClientResult<String>;

    /// Query job status
    async fn poll_status(&self, job_id: &str) -> ClientResult<JobStatus>;
}

/// Social platform (or any destination) accepting a finished video
#[async_trait]
pub trait PublishTargetClient: Send + Sync {
    /// Publish the media and return the platform's post id
    async fn post(
        &self,
        media_url: &MediaUrl,
        caption: &str,
        credentials: &Credentials,
    ) -> ClientResult<String>;
}

/// Receives terminal outcomes after they are recorded in the store
#[async_trait]
pub trait WritebackSink: Send + Sync {
    /// Record the outcome of one product
    async fn record_outcome(
        &self,
        fingerprint: &ProductFingerprint,
        outcome: Outcome,
        media_url: Option<&MediaUrl>,
        post_ids: &BTreeMap<String, String>,
    ) -> ClientResult<()>;
}

/// Result of a media reachability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx/3xx answer
    Reachable,
    /// Answer that usually means "exists but refuses probing" (403, 405)
    LikelyReachable(u16),
    /// Anything else
    Unreachable(String),
}

/// Checks that a media URL actually serves content
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Probe the URL
    async fn probe(&self, url: &MediaUrl) -> ProbeResult;
}
