//! Pipeline configuration
//!
//! One JSON document describes providers, publish targets, retry and rate
//! limits, lock settings and run settings. It is validated once at startup;
//! everything downstream takes the typed values.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::clients::http::{
    build_http_client, HttpGenerationProvider, WebhookPublishTarget, HTTP_REQUEST_TIMEOUT,
};
use crate::clients::probe::HttpMediaProbe;
use crate::clients::script::{TemplateScriptProvider, DEFAULT_SCRIPT_TEMPLATE};
use crate::clients::{ClientError, Credentials};
use crate::pipeline::generation::ProbeSettings;
use crate::pipeline::{
    GenerationCoordinator, ProviderSlot, PublishFanout, PublishTarget, RateLimit, RateLimiter,
    RetryExecutor, RetryPolicy, RetrySettings, RunCoordinator, RunOptions,
};
use crate::shutdown::SharedShutdown;
use crate::store::{FileProcessingStore, ProcessingStore, StoreError};

/// Largest accepted configuration file
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {reason}")]
    Io {
        /// File concerned
        path: PathBuf,
        /// Underlying error
        reason: String,
    },

    /// File is not valid configuration JSON
    #[error("invalid configuration JSON: {0}")]
    Parse(String),

    /// One or more semantic problems
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),

    /// HTTP client could not be built
    #[error("http client: {0}")]
    Client(#[from] ClientError),

    /// Processing store could not be opened
    #[error("processing store: {0}")]
    Store(#[from] StoreError),
}

/// One generation provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name, also the rate-limit target
    pub name: String,
    /// Include in the chain
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Job submission endpoint
    pub submit_url: String,
    /// Status endpoint; `{job_id}` is substituted, otherwise the id is appended
    pub status_url: String,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Seconds between status queries
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds allowed for polling once the job is accepted
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Rate limit for submissions and polls
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Submission retry; falls back to the global policy
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

/// One publish target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name, also the rate-limit target
    pub name: String,
    /// Publish to this target
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Webhook endpoint
    pub endpoint: String,
    /// Environment variable holding the access token
    #[serde(default)]
    pub credentials_env: Option<String>,
    /// Rate limit for posts
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Post retry; falls back to the global policy
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    /// Maximum caption length in characters
    #[serde(default)]
    pub caption_limit: Option<usize>,
}

/// Publish fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Targets published concurrently
    pub max_parallel: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

/// Processing lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock TTL in seconds
    pub ttl_secs: u64,
    /// Heartbeat interval in seconds; 0 disables renewal
    pub heartbeat_secs: u64,
    /// Directory of the file-backed processing store
    pub store_dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            heartbeat_secs: 900,
            store_dir: PathBuf::from(".publisher-state"),
        }
    }
}

/// Per-product run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Bound on one product's run, in seconds
    pub total_timeout_secs: Option<u64>,
    /// Products processed concurrently
    pub concurrency: usize,
    /// Re-run completed products
    pub force: bool,
    /// Re-run products completed as failures
    pub retry_failed: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: None,
            concurrency: 1,
            force: false,
            retry_failed: false,
        }
    }
}

/// Media reachability probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe at all
    pub enabled: bool,
    /// Verify media supplied with the product
    pub verify_existing: bool,
    /// Verify media returned by providers
    pub verify_generated: bool,
    /// Count 403/405 answers as reachable
    pub tolerate_forbidden: bool,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_existing: true,
            verify_generated: false,
            tolerate_forbidden: true,
            timeout_secs: 10,
        }
    }
}

/// Script rendering settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Template with `{title}`, `{description}`, `{hashtags}`, `{extra.<key>}`
    pub template: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_SCRIPT_TEMPLATE.to_string(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Generation providers, in fallback order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Publish targets
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    /// Default retry policy
    #[serde(default)]
    pub retry: RetrySettings,
    /// Fan-out settings
    #[serde(default)]
    pub publish: PublishConfig,
    /// Lock settings
    #[serde(default)]
    pub lock: LockConfig,
    /// Run settings
    #[serde(default)]
    pub run: RunConfig,
    /// Probe settings
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Script settings
    #[serde(default)]
    pub script: ScriptConfig,
    /// Bucket for targets without their own limit; `None` leaves them unthrottled
    #[serde(default)]
    pub default_rate_limit: Option<RateLimit>,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_provider_timeout_secs() -> u64 {
    600
}

fn check_url(label: &str, url: &str, errors: &mut Vec<String>) {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => errors.push(format!("{label}: unsupported scheme '{}'", parsed.scheme())),
        Err(e) => errors.push(format!("{label}: invalid url '{url}': {e}")),
    }
}

fn check_retry(label: &str, retry: &RetrySettings, errors: &mut Vec<String>) {
    if retry.max_attempts < 1 {
        errors.push(format!("{label}: max_attempts must be at least 1"));
    }
    if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
        errors.push(format!("{label}: multiplier must be >= 1"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(format!(
            "{label}: base_delay_ms ({}) exceeds max_delay_ms ({})",
            retry.base_delay_ms, retry.max_delay_ms
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        errors.push(format!("{label}: jitter must be within [0, 1]"));
    }
}

fn check_rate(label: &str, limit: Option<&RateLimit>, errors: &mut Vec<String>) {
    if let Some(limit) = limit {
        if !limit.is_valid() {
            errors.push(format!(
                "{label}: rate limit needs capacity >= 1 and a positive refill rate"
            ));
        }
    }
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(format!("{kind} name must not be empty"));
        } else if !seen.insert(name) {
            errors.push(format!("duplicate {kind} name '{name}'"));
        }
    }
}

impl PipelineConfig {
    /// Read and parse a JSON configuration file (not yet validated)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let size = std::fs::metadata(path).map_err(io_err)?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                reason: format!("file too large: {size} bytes (max: {MAX_CONFIG_FILE_SIZE})"),
            });
        }
        let content = std::fs::read_to_string(path).map_err(io_err)?;
        Self::from_json(&content)
    }

    /// Parse a JSON document
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn provider_retry(&self, provider: &ProviderConfig) -> RetrySettings {
        provider.retry.unwrap_or(self.retry)
    }

    fn target_retry(&self, target: &TargetConfig) -> RetrySettings {
        target.retry.unwrap_or(self.retry)
    }

    /// Worst-case duration of one run with this configuration
    ///
    /// Generation providers run in sequence; targets run in parallel, so only
    /// the slowest target counts. Capped by the total-run timeout when set.
    pub fn worst_case_run(&self) -> Duration {
        let generation: Duration = self
            .providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| {
                let retry = self.provider_retry(p);
                retry.worst_case_backoff()
                    + HTTP_REQUEST_TIMEOUT.saturating_mul(retry.max_attempts)
                    + Duration::from_secs(p.timeout_secs)
            })
            .sum();
        let publishing = self
            .targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| {
                let retry = self.target_retry(t);
                retry.worst_case_backoff() + HTTP_REQUEST_TIMEOUT.saturating_mul(retry.max_attempts)
            })
            .max()
            .unwrap_or_default();

        let worst = generation + publishing;
        match self.run.total_timeout_secs {
            Some(limit) => worst.min(Duration::from_secs(limit)),
            None => worst,
        }
    }

    /// Check the configuration, returning warnings on success
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        check_unique("provider", self.providers.iter().map(|p| p.name.as_str()), &mut errors);
        check_unique("target", self.targets.iter().map(|t| t.name.as_str()), &mut errors);
        check_retry("retry", &self.retry, &mut errors);
        check_rate("default_rate_limit", self.default_rate_limit.as_ref(), &mut errors);

        for p in &self.providers {
            let label = format!("provider '{}'", p.name);
            check_url(&format!("{label} submit_url"), &p.submit_url, &mut errors);
            check_url(&format!("{label} status_url"), &p.status_url, &mut errors);
            check_rate(&label, p.rate_limit.as_ref(), &mut errors);
            if let Some(retry) = &p.retry {
                check_retry(&label, retry, &mut errors);
            }
            if p.poll_interval_secs == 0 {
                errors.push(format!("{label}: poll_interval_secs must be positive"));
            }
            if p.timeout_secs == 0 {
                errors.push(format!("{label}: timeout_secs must be positive"));
            } else if p.poll_interval_secs > p.timeout_secs {
                errors.push(format!("{label}: poll interval exceeds the timeout"));
            }
            if let Some(var) = p.api_key_env.as_deref() {
                if p.enabled && !Credentials::from_env(var).is_present() {
                    warnings.push(format!("{label}: environment variable {var} is not set"));
                }
            }
        }

        for t in &self.targets {
            let label = format!("target '{}'", t.name);
            check_url(&format!("{label} endpoint"), &t.endpoint, &mut errors);
            check_rate(&label, t.rate_limit.as_ref(), &mut errors);
            if let Some(retry) = &t.retry {
                check_retry(&label, retry, &mut errors);
            }
            if t.caption_limit == Some(0) {
                errors.push(format!("{label}: caption_limit must be positive"));
            }
            if let Some(var) = t.credentials_env.as_deref() {
                if t.enabled && !Credentials::from_env(var).is_present() {
                    warnings.push(format!("{label}: environment variable {var} is not set"));
                }
            }
        }

        if !self.providers.iter().any(|p| p.enabled) {
            warnings.push(
                "no generation provider enabled; products without media will fail generation"
                    .to_string(),
            );
        }
        if !self.targets.iter().any(|t| t.enabled) {
            warnings.push(
                "no publish target enabled; runs will end as no_platforms_configured".to_string(),
            );
        }

        if self.publish.max_parallel == 0 {
            errors.push("publish.max_parallel must be at least 1".to_string());
        }
        if self.run.concurrency == 0 {
            errors.push("run.concurrency must be at least 1".to_string());
        }
        if self.run.total_timeout_secs == Some(0) {
            errors.push("run.total_timeout_secs must be positive".to_string());
        }
        if self.probe.enabled && self.probe.timeout_secs == 0 {
            errors.push("probe.timeout_secs must be positive".to_string());
        }

        if self.lock.ttl_secs == 0 {
            errors.push("lock.ttl_secs must be positive".to_string());
        } else {
            if self.lock.heartbeat_secs >= self.lock.ttl_secs {
                errors.push("lock.heartbeat_secs must be shorter than lock.ttl_secs".to_string());
            }
            let ttl = Duration::from_secs(self.lock.ttl_secs);
            let worst = self.worst_case_run();
            if ttl <= worst {
                let message = format!(
                    "lock.ttl_secs ({}) does not exceed the worst-case run duration ({}s)",
                    self.lock.ttl_secs,
                    worst.as_secs()
                );
                if self.lock.heartbeat_secs == 0 {
                    errors.push(format!("{message} and the heartbeat is disabled"));
                } else {
                    warnings.push(format!("{message}; relying on the heartbeat"));
                }
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Run options derived from the lock and run sections
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            lock_ttl: Duration::from_secs(self.lock.ttl_secs),
            heartbeat: (self.lock.heartbeat_secs > 0)
                .then(|| Duration::from_secs(self.lock.heartbeat_secs)),
            total_timeout: self.run.total_timeout_secs.map(Duration::from_secs),
            force: self.run.force,
            retry_failed: self.run.retry_failed,
            concurrency: self.run.concurrency.max(1),
        }
    }

    /// Open the file-backed processing store
    pub fn open_store(&self) -> Result<FileProcessingStore, ConfigError> {
        Ok(FileProcessingStore::open(&self.lock.store_dir)?)
    }

    /// Rate limiter covering every provider and target
    pub fn rate_limiter(&self, shutdown: Option<SharedShutdown>) -> RateLimiter {
        let mut limiter = RateLimiter::new().with_default(self.default_rate_limit);
        for (name, limit) in self
            .providers
            .iter()
            .filter_map(|p| p.rate_limit.map(|l| (&p.name, l)))
            .chain(
                self.targets
                    .iter()
                    .filter_map(|t| t.rate_limit.map(|l| (&t.name, l))),
            )
        {
            limiter = limiter.with_limit(name.clone(), limit);
        }
        match shutdown {
            Some(shutdown) => limiter.with_shutdown(shutdown),
            None => limiter,
        }
    }

    /// Build a run coordinator with HTTP collaborators
    pub fn build_coordinator(
        &self,
        store: Arc<dyn ProcessingStore>,
        shutdown: Option<SharedShutdown>,
    ) -> Result<RunCoordinator, ConfigError> {
        let http = build_http_client(HTTP_REQUEST_TIMEOUT)?;
        let limiter = Arc::new(self.rate_limiter(shutdown.clone()));
        let retry = match &shutdown {
            Some(s) => RetryExecutor::new().with_shutdown(s.clone()),
            None => RetryExecutor::new(),
        };

        let providers = self
            .providers
            .iter()
            .map(|p| {
                let credentials = p
                    .api_key_env
                    .as_deref()
                    .map(Credentials::from_env)
                    .unwrap_or_else(Credentials::none);
                let client = HttpGenerationProvider::new(
                    http.clone(),
                    &p.submit_url,
                    &p.status_url,
                    credentials,
                );
                let mut slot = ProviderSlot::new(
                    &p.name,
                    Arc::new(client),
                    Duration::from_secs(p.poll_interval_secs),
                    Duration::from_secs(p.timeout_secs),
                )
                .with_submit_policy(RetryPolicy::from(self.provider_retry(p)));
                slot.enabled = p.enabled;
                slot
            })
            .collect();

        let mut generation = GenerationCoordinator::new(
            providers,
            Arc::new(TemplateScriptProvider::new(&self.script.template)),
            limiter.clone(),
            retry.clone(),
        )
        .with_script_policy(RetryPolicy::from(self.retry));
        if self.probe.enabled {
            let probe = HttpMediaProbe::new(http.clone(), Duration::from_secs(self.probe.timeout_secs));
            generation = generation.with_probe(
                Arc::new(probe),
                ProbeSettings {
                    verify_existing: self.probe.verify_existing,
                    verify_generated: self.probe.verify_generated,
                    tolerate_forbidden: self.probe.tolerate_forbidden,
                },
            );
        } else if self.probe.verify_existing || self.probe.verify_generated {
            warn!("Probe disabled; media urls are trusted without verification");
        }
        if let Some(s) = &shutdown {
            generation = generation.with_shutdown(s.clone());
        }

        let targets = self
            .targets
            .iter()
            .map(|t| {
                let credentials = t
                    .credentials_env
                    .as_deref()
                    .map(Credentials::from_env)
                    .unwrap_or_else(Credentials::none);
                let mut target =
                    PublishTarget::new(&t.name, Arc::new(WebhookPublishTarget::new(http.clone(), &t.endpoint)))
                        .with_policy(RetryPolicy::from(self.target_retry(t)))
                        .with_credentials(credentials)
                        .with_caption_limit(t.caption_limit);
                target.enabled = t.enabled;
                target
            })
            .collect();
        let fanout = PublishFanout::new(targets, limiter, retry)
            .with_max_parallel(self.publish.max_parallel);

        let coordinator =
            RunCoordinator::new(store, Arc::new(generation), Arc::new(fanout)).with_options(self.run_options());
        Ok(match shutdown {
            Some(s) => coordinator.with_shutdown(s),
            None => coordinator,
        })
    }
}
