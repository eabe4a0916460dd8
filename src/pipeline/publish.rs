//! Multi-target publish fan-out
//!
//! Sends one ready media URL to every enabled target concurrently, bounded by
//! `max_parallel`. Each target runs its own rate-limited retry loop and never
//! affects the others.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::rate_limit::RateLimiter;
use super::retry::{RetryExecutor, RetryPolicy};
use super::{PipelineError, SideEffects};
use crate::clients::{ClientError, Credentials, PublishTargetClient};
use crate::fingerprint::ProductFingerprint;
use crate::metrics;
use crate::model::{MediaUrl, Outcome, ProductMetadata, PublishAttempt, PublishStatus};

/// Default number of targets published concurrently
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// One publish destination
#[derive(Clone)]
pub struct PublishTarget {
    /// Target name (also its rate-limit target)
    pub name: String,
    /// Skipped when false
    pub enabled: bool,
    /// Client
    pub client: Arc<dyn PublishTargetClient>,
    /// Credentials handed to the client
    pub credentials: Credentials,
    /// Retry policy for the post
    pub policy: RetryPolicy,
    /// Maximum caption length in characters
    pub caption_limit: Option<usize>,
}

impl fmt::Debug for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishTarget")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("credentials", &self.credentials)
            .field("policy", &self.policy)
            .field("caption_limit", &self.caption_limit)
            .finish_non_exhaustive()
    }
}

impl PublishTarget {
    /// Enabled target with default policy and no credentials
    pub fn new(name: impl Into<String>, client: Arc<dyn PublishTargetClient>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            client,
            credentials: Credentials::none(),
            policy: RetryPolicy::default(),
            caption_limit: None,
        }
    }

    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the caption limit
    pub fn with_caption_limit(mut self, limit: Option<usize>) -> Self {
        self.caption_limit = limit;
        self
    }
}

/// Aggregated fan-out result
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutReport {
    /// `Success`, `PartialSuccess`, `Failed` or `NoPlatformsConfigured`
    pub outcome: Outcome,
    /// One attempt per enabled target
    pub attempts: BTreeMap<String, PublishAttempt>,
}

impl FanoutReport {
    /// Post id per succeeded target
    pub fn post_ids(&self) -> BTreeMap<String, String> {
        self.attempts
            .iter()
            .filter_map(|(target, a)| a.external_post_id.clone().map(|id| (target.clone(), id)))
            .collect()
    }

    /// Number of succeeded targets
    pub fn succeeded(&self) -> usize {
        self.attempts
            .values()
            .filter(|a| a.status == PublishStatus::Succeeded)
            .count()
    }
}

/// Aggregate per-target statuses
pub fn aggregate_outcome<'a>(statuses: impl IntoIterator<Item = &'a PublishStatus>) -> Outcome {
    let (mut total, mut succeeded) = (0usize, 0usize);
    for status in statuses {
        total += 1;
        if *status == PublishStatus::Succeeded {
            succeeded += 1;
        }
    }
    match (total, succeeded) {
        (0, _) => Outcome::NoPlatformsConfigured,
        (t, s) if s == t => Outcome::Success,
        (_, 0) => Outcome::Failed,
        _ => Outcome::PartialSuccess,
    }
}

/// Publishes media to every enabled target
pub struct PublishFanout {
    targets: Vec<PublishTarget>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    max_parallel: usize,
}

impl fmt::Debug for PublishFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishFanout")
            .field("targets", &self.targets)
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

impl PublishFanout {
    /// Fan-out over `targets`
    pub fn new(targets: Vec<PublishTarget>, limiter: Arc<RateLimiter>, retry: RetryExecutor) -> Self {
        Self {
            targets,
            limiter,
            retry,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Bound the number of concurrent targets (minimum 1)
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Enabled targets
    pub fn enabled_targets(&self) -> impl Iterator<Item = &PublishTarget> {
        self.targets.iter().filter(|t| t.enabled)
    }

    /// Whether no target is enabled
    pub fn is_empty(&self) -> bool {
        self.enabled_targets().next().is_none()
    }

    /// Publish `media_url` to every enabled target
    pub async fn publish(
        &self,
        fingerprint: &ProductFingerprint,
        media_url: &MediaUrl,
        metadata: &ProductMetadata,
        side_effects: &SideEffects,
    ) -> FanoutReport {
        if self.is_empty() {
            info!(fingerprint = %fingerprint, "No publish target enabled");
            return FanoutReport {
                outcome: Outcome::NoPlatformsConfigured,
                attempts: BTreeMap::new(),
            };
        }

        let jobs: Vec<_> = self
            .enabled_targets()
            .map(|target| self.publish_one(target, fingerprint, media_url, metadata, side_effects))
            .collect();
        let attempts: BTreeMap<String, PublishAttempt> = stream::iter(jobs)
            .buffer_unordered(self.max_parallel)
            .map(|attempt| (attempt.target.clone(), attempt))
            .collect()
            .await;

        let outcome = aggregate_outcome(attempts.values().map(|a| &a.status));
        let report = FanoutReport { outcome, attempts };
        info!(
            fingerprint = %fingerprint,
            outcome = %report.outcome,
            succeeded = report.succeeded(),
            targets = report.attempts.len(),
            "Publishing finished"
        );
        report
    }

    async fn publish_one(
        &self,
        target: &PublishTarget,
        fingerprint: &ProductFingerprint,
        media_url: &MediaUrl,
        metadata: &ProductMetadata,
        side_effects: &SideEffects,
    ) -> PublishAttempt {
        let mut attempt = PublishAttempt::pending(fingerprint.clone(), &target.name);
        let name = target.name.as_str();
        let made = Arc::new(AtomicU32::new(0));

        let result = {
            let limiter = self.limiter.clone();
            let client = target.client.clone();
            let credentials = target.credentials.clone();
            let target_name: Arc<str> = Arc::from(name);
            let caption: Arc<str> = Arc::from(metadata.caption(target.caption_limit));
            let media_url = media_url.clone();
            let side_effects = side_effects.clone();
            let made = made.clone();
            self.retry
                .run(&format!("post:{name}"), &target.policy, move |n| {
                    let limiter = limiter.clone();
                    let client = client.clone();
                    let credentials = credentials.clone();
                    let target_name = target_name.clone();
                    let caption = caption.clone();
                    let media_url = media_url.clone();
                    let side_effects = side_effects.clone();
                    let made = made.clone();
                    async move {
                        if limiter.permit(&target_name).await.is_err() {
                            return Err(ClientError::cancelled());
                        }
                        made.store(n, Ordering::SeqCst);
                        side_effects.mark();
                        client.post(&media_url, &caption, &credentials).await
                    }
                })
                .await
        };
        attempt.attempt_number = made.load(Ordering::SeqCst);

        match result {
            Ok(post_id) => {
                attempt.status = PublishStatus::Succeeded;
                attempt.external_post_id = Some(post_id);
            }
            Err(PipelineError::Exhausted { last, .. }) => {
                attempt.status = PublishStatus::Exhausted;
                attempt.last_error = Some(last.to_string());
            }
            // Shutdown lands here too, recorded as Failed without a request
            Err(e) => {
                attempt.status = PublishStatus::Failed;
                attempt.last_error = Some(e.to_string());
            }
        }

        metrics::record_publish_attempt(name, attempt.status.as_str());
        if attempt.status != PublishStatus::Succeeded {
            warn!(
                fingerprint = %fingerprint,
                target = name,
                status = attempt.status.as_str(),
                attempts = attempt.attempt_number,
                error = attempt.last_error.as_deref().unwrap_or_default(),
                "Publish failed"
            );
        }
        attempt
    }
}
