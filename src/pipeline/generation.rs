//! Provider fallback chain
//!
//! `ResolvingExisting -> AlreadyHasMedia | Submitting(p) -> Polling(p) ->
//! Ready | Failed(p) -> next provider | AllProvidersExhausted`
//!
//! Each provider gets a rate-limited, retried submission and then a bounded
//! polling loop. A provider that fails or times out hands over to the next one.
//! Every provider tried is logged as a [`GenerationAttempt`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::poll::{poll_until, PollStep};
use super::rate_limit::RateLimiter;
use super::retry::{RetryExecutor, RetryPolicy};
use super::{PipelineError, SideEffects};
use crate::clients::{
    ClientError, GenerationProviderClient, JobState, MediaProbe, ProbeResult, ScriptProvider,
};
use crate::clock::{SharedClock, SystemClock};
use crate::metrics;
use crate::model::{
    GenerationAttempt, GenerationStatus, MediaSource, MediaUrl, Product, ProductMetadata,
};
use crate::shutdown::SharedShutdown;

/// One generation provider in the chain
#[derive(Clone)]
pub struct ProviderSlot {
    /// Provider name (also its rate-limit target)
    pub name: String,
    /// Skipped when false
    pub enabled: bool,
    /// Client
    pub client: Arc<dyn GenerationProviderClient>,
    /// Sleep between status queries
    pub poll_interval: Duration,
    /// Budget for polling once the job is accepted
    pub timeout: Duration,
    /// Retry policy for the submission (also classifies poll errors)
    pub submit_policy: RetryPolicy,
}

impl fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("submit_policy", &self.submit_policy)
            .finish_non_exhaustive()
    }
}

impl ProviderSlot {
    /// Enabled provider with the default submission policy
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn GenerationProviderClient>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            client,
            poll_interval,
            timeout,
            submit_policy: RetryPolicy::default(),
        }
    }

    /// Replace the submission policy
    pub fn with_submit_policy(mut self, policy: RetryPolicy) -> Self {
        self.submit_policy = policy;
        self
    }
}

/// When and how media URLs are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Verify media supplied with the product
    pub verify_existing: bool,
    /// Verify media returned by providers
    pub verify_generated: bool,
    /// Count 403/405 answers as reachable
    pub tolerate_forbidden: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            verify_existing: true,
            verify_generated: false,
            tolerate_forbidden: true,
        }
    }
}

/// How the chain ended
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Playable media available
    Ready {
        /// Media to publish
        media_url: MediaUrl,
        /// Where it came from
        source: MediaSource,
    },
    /// Every provider failed or timed out (or none is enabled)
    AllProvidersFailed,
    /// The script could not be produced; no provider was contacted
    SetupFailed(String),
    /// Shutdown requested mid-chain
    Cancelled,
}

/// Chain result with the per-provider log
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Final state
    pub outcome: GenerationOutcome,
    /// Every provider tried, in order
    pub attempts: Vec<GenerationAttempt>,
}

impl GenerationResult {
    /// Ready media, if any
    pub fn media_url(&self) -> Option<&MediaUrl> {
        match &self.outcome {
            GenerationOutcome::Ready { media_url, .. } => Some(media_url),
            _ => None,
        }
    }

    /// `provider=status` pairs, in order
    pub fn path(&self) -> String {
        self.attempts
            .iter()
            .map(|a| format!("{}={}", a.provider, a.status.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Drives the provider fallback chain for one product
pub struct GenerationCoordinator {
    providers: Vec<ProviderSlot>,
    scripts: Arc<dyn ScriptProvider>,
    script_policy: RetryPolicy,
    probe: Option<Arc<dyn MediaProbe>>,
    probe_settings: ProbeSettings,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    clock: SharedClock,
    shutdown: Option<SharedShutdown>,
}

impl fmt::Debug for GenerationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationCoordinator")
            .field("providers", &self.providers)
            .field("probe", &self.probe.is_some())
            .field("probe_settings", &self.probe_settings)
            .finish_non_exhaustive()
    }
}

impl GenerationCoordinator {
    /// Coordinator over `providers`, tried in order
    pub fn new(
        providers: Vec<ProviderSlot>,
        scripts: Arc<dyn ScriptProvider>,
        limiter: Arc<RateLimiter>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            providers,
            scripts,
            script_policy: RetryPolicy::default(),
            probe: None,
            probe_settings: ProbeSettings::default(),
            limiter,
            retry,
            clock: SystemClock::shared(),
            shutdown: None,
        }
    }

    /// Verify media URLs through `probe`
    pub fn with_probe(mut self, probe: Arc<dyn MediaProbe>, settings: ProbeSettings) -> Self {
        self.probe = Some(probe);
        self.probe_settings = settings;
        self
    }

    /// Retry policy for script generation
    pub fn with_script_policy(mut self, policy: RetryPolicy) -> Self {
        self.script_policy = policy;
        self
    }

    /// Clock used for submission timestamps
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Stop between providers and during polling on shutdown
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Providers in chain order
    pub fn providers(&self) -> &[ProviderSlot] {
        &self.providers
    }

    /// Worst-case time the chain can take (submission backoff + polling)
    pub fn worst_case_duration(&self) -> Duration {
        self.providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| {
                let backoff: Duration = (1..p.submit_policy.max_attempts)
                    .map(|n| p.submit_policy.backoff(n))
                    .sum();
                backoff + p.timeout
            })
            .sum()
    }

    async fn verify(&self, url: &MediaUrl) -> Result<(), String> {
        let Some(probe) = &self.probe else {
            return Ok(());
        };
        match probe.probe(url).await {
            ProbeResult::Reachable => Ok(()),
            ProbeResult::LikelyReachable(status) if self.probe_settings.tolerate_forbidden => {
                debug!(url = %url, status, "Media likely reachable (probe refused)");
                Ok(())
            }
            ProbeResult::LikelyReachable(status) => Err(format!("probe answered HTTP {status}")),
            ProbeResult::Unreachable(reason) => Err(reason),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }

    /// Resolve existing media or run the provider chain
    ///
    /// `side_effects` is marked as soon as a provider accepts a job.
    pub async fn resolve(&self, product: &Product, side_effects: &SideEffects) -> GenerationResult {
        let fingerprint = &product.fingerprint;

        if let Some(url) = product.existing_media() {
            if !self.probe_settings.verify_existing {
                return ready_existing(url);
            }
            match self.verify(&url).await {
                Ok(()) => return ready_existing(url),
                Err(reason) => warn!(
                    fingerprint = %fingerprint,
                    url = %url,
                    reason = %reason,
                    "Existing media failed verification, generating instead"
                ),
            }
        } else if let Some(raw) = product
            .existing_media_url
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
        {
            warn!(fingerprint = %fingerprint, url = raw, "Ignoring malformed existing media url");
        }

        let mut attempts = Vec::new();
        if !self.providers.iter().any(|p| p.enabled) {
            warn!(fingerprint = %fingerprint, "No generation provider enabled");
            return GenerationResult {
                outcome: GenerationOutcome::AllProvidersFailed,
                attempts,
            };
        }

        let script = match self.script(&product.metadata).await {
            Ok(script) => script,
            Err(PipelineError::Cancelled) => {
                return GenerationResult {
                    outcome: GenerationOutcome::Cancelled,
                    attempts,
                }
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Script generation failed");
                return GenerationResult {
                    outcome: GenerationOutcome::SetupFailed(e.to_string()),
                    attempts,
                };
            }
        };

        for slot in self.providers.iter() {
            if !slot.enabled {
                debug!(fingerprint = %fingerprint, provider = %slot.name, "Provider disabled, skipping");
                continue;
            }
            if self.is_shutdown() {
                return GenerationResult {
                    outcome: GenerationOutcome::Cancelled,
                    attempts,
                };
            }

            let (attempt, media) = self
                .run_provider(slot, product, &script, side_effects)
                .await;
            metrics::record_generation_attempt(&slot.name, attempt.status.as_str());
            attempts.push(attempt);

            match media {
                ProviderEnd::Ready(media_url) => {
                    let result = GenerationResult {
                        outcome: GenerationOutcome::Ready {
                            media_url,
                            source: MediaSource::Provider(slot.name.clone()),
                        },
                        attempts,
                    };
                    info!(fingerprint = %fingerprint, path = %result.path(), "Generation ready");
                    return result;
                }
                ProviderEnd::Cancelled => {
                    return GenerationResult {
                        outcome: GenerationOutcome::Cancelled,
                        attempts,
                    }
                }
                ProviderEnd::Failed => {}
            }
        }

        let result = GenerationResult {
            outcome: GenerationOutcome::AllProvidersFailed,
            attempts,
        };
        warn!(fingerprint = %fingerprint, path = %result.path(), "All generation providers failed");
        result
    }

    async fn script(&self, metadata: &ProductMetadata) -> Result<String, PipelineError> {
        let scripts = self.scripts.clone();
        let metadata = Arc::new(metadata.clone());
        self.retry
            .run("script", &self.script_policy, move |_| {
                let scripts = scripts.clone();
                let metadata = metadata.clone();
                async move { scripts.script(&metadata).await }
            })
            .await
    }

    async fn run_provider(
        &self,
        slot: &ProviderSlot,
        product: &Product,
        script: &str,
        side_effects: &SideEffects,
    ) -> (GenerationAttempt, ProviderEnd) {
        let fingerprint = &product.fingerprint;
        let name = slot.name.as_str();

        debug!(fingerprint = %fingerprint, provider = name, "Submitting generation job");
        let submitted = {
            let limiter = self.limiter.clone();
            let client = slot.client.clone();
            let target: Arc<str> = Arc::from(name);
            let script: Arc<str> = Arc::from(script);
            let metadata = Arc::new(product.metadata.clone());
            self.retry
                .run(&format!("submit:{name}"), &slot.submit_policy, move |_| {
                    let limiter = limiter.clone();
                    let client = client.clone();
                    let target = target.clone();
                    let script = script.clone();
                    let metadata = metadata.clone();
                    async move {
                        if limiter.permit(&target).await.is_err() {
                            return Err(ClientError::cancelled());
                        }
                        client.submit(&script, &metadata).await
                    }
                })
                .await
        };

        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(e) if e.is_cancelled() => {
                let attempt = GenerationAttempt::submission_failed(
                    fingerprint.clone(),
                    name,
                    "cancelled during submission",
                );
                return (attempt, ProviderEnd::Cancelled);
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, provider = name, error = %e, "Submission failed");
                let attempt = GenerationAttempt::submission_failed(fingerprint.clone(), name, e.to_string());
                return (attempt, ProviderEnd::Failed);
            }
        };

        side_effects.mark();
        let mut attempt = GenerationAttempt::submitted(
            fingerprint.clone(),
            name,
            job_id.clone(),
            self.clock.now_millis(),
        );
        attempt.status = GenerationStatus::Polling;
        info!(fingerprint = %fingerprint, provider = name, job_id = %job_id, "Generation job accepted");

        let last_transient: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let query = {
            let limiter = self.limiter.clone();
            let client = slot.client.clone();
            let target: Arc<str> = Arc::from(name);
            let job: Arc<str> = Arc::from(job_id.as_str());
            let policy = slot.submit_policy.clone();
            let last = last_transient.clone();
            move |poll: u32| {
                let limiter = limiter.clone();
                let client = client.clone();
                let target = target.clone();
                let job = job.clone();
                let policy = policy.clone();
                let last = last.clone();
                async move {
                    if limiter.permit(&target).await.is_err() {
                        return PollStep::Failed(ClientError::cancelled());
                    }
                    match client.poll_status(&job).await {
                        Ok(status) => match status.state {
                            JobState::Succeeded => match status.media_url.as_deref().map(MediaUrl::parse) {
                                Some(Ok(url)) => PollStep::Ready(url),
                                Some(Err(e)) => PollStep::Failed(ClientError::malformed(format!(
                                    "job succeeded with invalid media url: {e}"
                                ))),
                                None => PollStep::Failed(ClientError::malformed(
                                    "job succeeded without a media url",
                                )),
                            },
                            JobState::Failed => PollStep::Failed(ClientError::permanently_failed(
                                status.error.unwrap_or_else(|| "job failed".to_string()),
                            )),
                            JobState::Queued | JobState::Processing => PollStep::Pending,
                        },
                        Err(e) if policy.is_retryable(&e) => {
                            debug!(provider = %target, poll, error = %e, "Transient poll error");
                            if let Ok(mut guard) = last.lock() {
                                *guard = Some(e.to_string());
                            }
                            PollStep::Pending
                        }
                        Err(e) => PollStep::Failed(e),
                    }
                }
            }
        };

        let polled = poll_until(
            &format!("poll:{name}"),
            slot.poll_interval,
            slot.timeout,
            self.shutdown.as_ref(),
            query,
        )
        .await;
        attempt.polls = polled.polls;

        let end = match polled.result {
            Ok(url) => match self.verify_generated(&url).await {
                Ok(()) => {
                    attempt.status = GenerationStatus::Ready;
                    attempt.media_url = Some(url.clone());
                    ProviderEnd::Ready(url)
                }
                Err(reason) => {
                    attempt.status = GenerationStatus::Failed;
                    attempt.last_error = Some(format!("generated media unreachable: {reason}"));
                    ProviderEnd::Failed
                }
            },
            Err(PipelineError::Timeout { elapsed, .. }) => {
                attempt.status = GenerationStatus::TimedOut;
                let transient = last_transient.lock().ok().and_then(|mut s| s.take());
                attempt.last_error = Some(match transient {
                    Some(e) => format!("timed out after {elapsed:?} (last error: {e})"),
                    None => format!("timed out after {elapsed:?}"),
                });
                ProviderEnd::Failed
            }
            Err(e) if e.is_cancelled() => {
                attempt.last_error = Some("cancelled while polling".to_string());
                ProviderEnd::Cancelled
            }
            Err(e) => {
                attempt.status = GenerationStatus::Failed;
                attempt.last_error = Some(e.to_string());
                ProviderEnd::Failed
            }
        };

        if end == ProviderEnd::Failed {
            warn!(
                fingerprint = %fingerprint,
                provider = name,
                status = attempt.status.as_str(),
                error = attempt.last_error.as_deref().unwrap_or_default(),
                "Provider failed, falling back"
            );
        }
        (attempt, end)
    }

    async fn verify_generated(&self, url: &MediaUrl) -> Result<(), String> {
        if self.probe_settings.verify_generated {
            self.verify(url).await
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, PartialEq)]
enum ProviderEnd {
    Ready(MediaUrl),
    Failed,
    Cancelled,
}

fn ready_existing(url: MediaUrl) -> GenerationResult {
    GenerationResult {
        outcome: GenerationOutcome::Ready {
            media_url: url,
            source: MediaSource::Existing,
        },
        attempts: Vec::new(),
    }
}
