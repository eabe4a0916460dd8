//! Pipeline observability metrics
//!
//! Counters, histograms and gauges for runs, generation attempts, publish
//! attempts, retries, lock acquisitions and rate limiting.
//!
//! ## Architecture
//!
//! - Uses the `metrics` facade; recording is a no-op until a recorder is installed
//! - Optional Prometheus exporter serving a scrape endpoint (`--metrics-addr`)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runs by disposition and outcome
pub const RUNS_TOTAL: &str = "runs_total";
/// Run wall time
pub const RUN_DURATION_SECONDS: &str = "run_duration_seconds";
/// Generation attempts by provider and final status
pub const GENERATION_ATTEMPTS_TOTAL: &str = "generation_attempts_total";
/// Publish attempts by target and final status
pub const PUBLISH_ATTEMPTS_TOTAL: &str = "publish_attempts_total";
/// Retry executor attempts by operation and result
pub const RETRY_ATTEMPTS_TOTAL: &str = "retry_attempts_total";
/// Backoff applied between attempts
pub const RETRY_BACKOFF_SECONDS: &str = "retry_backoff_duration_seconds";
/// Lock acquisitions by result
pub const LOCK_ACQUISITIONS_TOTAL: &str = "lock_acquisitions_total";
/// Time spent waiting for a rate-limit token
pub const RATE_LIMIT_WAIT_SECONDS: &str = "rate_limit_wait_seconds";
/// Tokens left in a bucket after an acquire
pub const RATE_LIMIT_TOKENS_AVAILABLE: &str = "rate_limit_tokens_available";

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Metrics initialisation errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be installed (address in use, recorder already set)
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Initialise the Prometheus exporter
///
/// Idempotent: later calls are ignored once an exporter is installed.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    if METRICS_INITIALIZED.load(Ordering::SeqCst) {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_metrics();
    METRICS_INITIALIZED.store(true, Ordering::SeqCst);
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Whether an exporter has been installed
pub fn is_initialized() -> bool {
    METRICS_INITIALIZED.load(Ordering::SeqCst)
}

fn describe_metrics() {
    describe_counter!(RUNS_TOTAL, Unit::Count, "Product runs by disposition and outcome");
    describe_histogram!(RUN_DURATION_SECONDS, Unit::Seconds, "Product run duration");
    describe_counter!(
        GENERATION_ATTEMPTS_TOTAL,
        Unit::Count,
        "Generation provider attempts by final status"
    );
    describe_counter!(
        PUBLISH_ATTEMPTS_TOTAL,
        Unit::Count,
        "Publish attempts by target and final status"
    );
    describe_counter!(RETRY_ATTEMPTS_TOTAL, Unit::Count, "Retry executor attempts");
    describe_histogram!(
        RETRY_BACKOFF_SECONDS,
        Unit::Seconds,
        "Backoff applied before retrying"
    );
    describe_counter!(
        LOCK_ACQUISITIONS_TOTAL,
        Unit::Count,
        "Processing lock acquisitions by result"
    );
    describe_histogram!(
        RATE_LIMIT_WAIT_SECONDS,
        Unit::Seconds,
        "Time spent waiting for rate-limit tokens"
    );
    describe_gauge!(
        RATE_LIMIT_TOKENS_AVAILABLE,
        Unit::Count,
        "Tokens left in a target's bucket"
    );
}

/// Record a rate-limit acquire
pub fn record_rate_limit_wait(target: &str, wait: Duration, tokens_left: f64) {
    histogram!(RATE_LIMIT_WAIT_SECONDS, "target" => target.to_string()).record(wait.as_secs_f64());
    gauge!(RATE_LIMIT_TOKENS_AVAILABLE, "target" => target.to_string()).set(tokens_left);

    if wait.as_millis() > 100 {
        debug!(
            target = target,
            wait_ms = wait.as_millis() as u64,
            "Rate limit token acquired after wait"
        );
    }
}

/// Record one retry executor attempt
pub fn record_retry_attempt(operation: &str, result: &'static str) {
    counter!(
        RETRY_ATTEMPTS_TOTAL,
        "operation" => operation.to_string(),
        "result" => result,
    )
    .increment(1);
}

/// Record backoff before the next attempt
pub fn record_retry_backoff(operation: &str, delay: Duration) {
    histogram!(RETRY_BACKOFF_SECONDS, "operation" => operation.to_string())
        .record(delay.as_secs_f64());
}

/// Record a provider's final status in the generation chain
pub fn record_generation_attempt(provider: &str, status: &'static str) {
    counter!(
        GENERATION_ATTEMPTS_TOTAL,
        "provider" => provider.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record a target's final publish status
pub fn record_publish_attempt(target: &str, status: &'static str) {
    counter!(
        PUBLISH_ATTEMPTS_TOTAL,
        "target" => target.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record a lock acquisition result
pub fn record_lock_acquisition(result: &'static str) {
    counter!(LOCK_ACQUISITIONS_TOTAL, "result" => result).increment(1);
}

/// Run timing helper
pub struct RunMetrics {
    start_time: Instant,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::start()
    }
}

impl RunMetrics {
    /// Start timing a run
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Record the end of a run
    pub fn record(&self, disposition: &'static str, outcome: Option<&'static str>) {
        let duration = self.start_time.elapsed();
        counter!(
            RUNS_TOTAL,
            "disposition" => disposition,
            "outcome" => outcome.unwrap_or("none"),
        )
        .increment(1);
        histogram!(RUN_DURATION_SECONDS, "disposition" => disposition)
            .record(duration.as_secs_f64());
    }

    /// Elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
