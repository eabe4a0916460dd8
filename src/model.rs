//! Pipeline data model
//!
//! Products, media references, per-provider generation attempts, per-target
//! publish attempts and terminal outcomes.

use crate::fingerprint::ProductFingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of work as yielded by a product source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Idempotency key
    pub fingerprint: ProductFingerprint,
    /// Media that already exists for this product (skips generation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_media_url: Option<String>,
    /// Descriptive metadata used for scripts and captions
    #[serde(default)]
    pub metadata: ProductMetadata,
}

impl Product {
    /// Create a product without existing media
    pub fn new(fingerprint: ProductFingerprint, metadata: ProductMetadata) -> Self {
        Self {
            fingerprint,
            existing_media_url: None,
            metadata,
        }
    }

    /// Attach an existing media URL
    pub fn with_existing_media(mut self, url: impl Into<String>) -> Self {
        self.existing_media_url = Some(url.into());
        self
    }

    /// Existing media URL if present and well formed
    ///
    /// Blank cells and malformed values are treated as "no existing media".
    pub fn existing_media(&self) -> Option<MediaUrl> {
        self.existing_media_url
            .as_deref()
            .and_then(|url| MediaUrl::parse(url).ok())
    }
}

/// Product metadata (opaque to the core apart from caption building)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    /// Product title
    #[serde(default)]
    pub title: String,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Explicit caption, overrides the derived one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Hashtags without the leading '#'
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<String>,
    /// Any other columns, passed through to collaborators untouched
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProductMetadata {
    /// Metadata with just a title
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Caption for a publish target
    ///
    /// Uses the explicit caption if set, otherwise title, description and
    /// hashtags separated by blank lines. Truncated on a character boundary to
    /// `max_chars` when given.
    pub fn caption(&self, max_chars: Option<usize>) -> String {
        let caption = match self.caption.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit.to_string(),
            _ => {
                let mut parts: Vec<String> = Vec::new();
                if !self.title.trim().is_empty() {
                    parts.push(self.title.trim().to_string());
                }
                if let Some(desc) = self.description.as_deref().map(str::trim) {
                    if !desc.is_empty() {
                        parts.push(desc.to_string());
                    }
                }
                let tags: Vec<String> = self
                    .hashtags
                    .iter()
                    .map(|t| t.trim().trim_start_matches('#'))
                    .filter(|t| !t.is_empty())
                    .map(|t| format!("#{t}"))
                    .collect();
                if !tags.is_empty() {
                    parts.push(tags.join(" "));
                }
                parts.join("\n\n")
            }
        };

        match max_chars {
            Some(max) if caption.chars().count() > max => caption.chars().take(max).collect(),
            _ => caption,
        }
    }
}

/// A playable media reference
///
/// Only absolute http(s) URLs are accepted, so an empty or undefined media
/// reference can never be forwarded to publishing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaUrl(String);

impl MediaUrl {
    /// Parse a media URL
    pub fn parse(s: &str) -> Result<Self, MediaUrlError> {
        let value = s.trim();
        if value.is_empty() {
            return Err(MediaUrlError::Empty);
        }

        let rest = value
            .strip_prefix("https://")
            .or_else(|| value.strip_prefix("http://"))
            .ok_or_else(|| MediaUrlError::UnsupportedScheme(value.to_string()))?;

        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(MediaUrlError::Malformed(value.to_string()));
        }

        Ok(Self(value.to_string()))
    }

    /// URL as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MediaUrl {
    type Error = MediaUrlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MediaUrl> for String {
    fn from(url: MediaUrl) -> Self {
        url.0
    }
}

/// Media URL validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaUrlError {
    /// Empty value
    #[error("media url is empty")]
    Empty,
    /// Not http or https
    #[error("unsupported media url scheme: {0}")]
    UnsupportedScheme(String),
    /// Missing host or contains whitespace
    #[error("malformed media url: {0}")]
    Malformed(String),
}

/// Terminal outcome of one product run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every enabled target published
    Success,
    /// At least one target published, at least one failed
    PartialSuccess,
    /// No publish target is enabled; nothing external was attempted
    NoPlatformsConfigured,
    /// Every generation provider failed or timed out
    GenerationFailed,
    /// Every target failed, or the run itself failed (timeout, internal error)
    Failed,
}

impl Outcome {
    /// Whether the product reached at least one platform
    pub fn is_published(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::PartialSuccess)
    }

    /// Whether the outcome represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::GenerationFailed | Outcome::Failed)
    }

    /// Stable lowercase label (logs, metrics, CSV)
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial_success",
            Outcome::NoPlatformsConfigured => "no_platforms_configured",
            Outcome::GenerationFailed => "generation_failed",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one provider in the generation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    /// Job accepted by the provider
    Submitted,
    /// Waiting for the job to finish
    Polling,
    /// Media available
    Ready,
    /// Provider budget exceeded
    TimedOut,
    /// Submission or job failed
    Failed,
}

impl GenerationStatus {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Submitted => "submitted",
            GenerationStatus::Polling => "polling",
            GenerationStatus::Ready => "ready",
            GenerationStatus::TimedOut => "timed_out",
            GenerationStatus::Failed => "failed",
        }
    }
}

/// One provider's part of the generation chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// Product being generated
    pub fingerprint: ProductFingerprint,
    /// Provider name
    pub provider: String,
    /// Provider job id (absent if the submission itself failed)
    pub external_job_id: Option<String>,
    /// Submission time (Unix milliseconds)
    pub submitted_at: Option<i64>,
    /// Current status
    pub status: GenerationStatus,
    /// Media URL once ready
    pub media_url: Option<MediaUrl>,
    /// Last error seen for this provider
    pub last_error: Option<String>,
    /// Status queries performed
    pub polls: u32,
}

impl GenerationAttempt {
    /// Attempt for a provider whose submission failed
    pub fn submission_failed(
        fingerprint: ProductFingerprint,
        provider: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint,
            provider: provider.into(),
            external_job_id: None,
            submitted_at: None,
            status: GenerationStatus::Failed,
            media_url: None,
            last_error: Some(error.into()),
            polls: 0,
        }
    }

    /// Attempt for an accepted submission
    pub fn submitted(
        fingerprint: ProductFingerprint,
        provider: impl Into<String>,
        external_job_id: impl Into<String>,
        submitted_at: i64,
    ) -> Self {
        Self {
            fingerprint,
            provider: provider.into(),
            external_job_id: Some(external_job_id.into()),
            submitted_at: Some(submitted_at),
            status: GenerationStatus::Submitted,
            media_url: None,
            last_error: None,
            polls: 0,
        }
    }
}

/// Status of one publish target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// Not attempted yet
    Pending,
    /// Post created
    Succeeded,
    /// Fatal error, remaining retries skipped
    Failed,
    /// Retry budget consumed
    Exhausted,
}

impl PublishStatus {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Pending => "pending",
            PublishStatus::Succeeded => "succeeded",
            PublishStatus::Failed => "failed",
            PublishStatus::Exhausted => "exhausted",
        }
    }
}

/// One target's publish attempt within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishAttempt {
    /// Product being published
    pub fingerprint: ProductFingerprint,
    /// Target (platform) name
    pub target: String,
    /// Attempts made so far
    pub attempt_number: u32,
    /// Current status
    pub status: PublishStatus,
    /// Last error seen
    pub last_error: Option<String>,
    /// Post id returned by the platform
    pub external_post_id: Option<String>,
}

impl PublishAttempt {
    /// Fresh pending attempt
    pub fn pending(fingerprint: ProductFingerprint, target: impl Into<String>) -> Self {
        Self {
            fingerprint,
            target: target.into(),
            attempt_number: 0,
            status: PublishStatus::Pending,
            last_error: None,
            external_post_id: None,
        }
    }
}

/// Where the published media came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider", rename_all = "snake_case")]
pub enum MediaSource {
    /// Supplied with the product
    Existing,
    /// Generated by the named provider
    Provider(String),
}
