//! Bounded exponential-backoff retry
//!
//! Delay before attempt `n + 1` is `min(base * multiplier^(n - 1), max)`,
//! optionally jittered, and never shorter than a server's `Retry-After` hint
//! (itself capped at `max`). Fatal errors short-circuit; exhaustion returns the
//! last error as [`PipelineError::Exhausted`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{PipelineError, PipelineResult};
use crate::clients::classify::RetryContext;
use crate::clients::{ClientError, ClientResult, FailureKind};
use crate::metrics;
use crate::shutdown::{sleep_or_shutdown, SharedShutdown};

/// Serializable retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Growth factor per attempt (>= 1)
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Symmetric jitter fraction in [0, 1]; 0 disables jitter
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetrySettings {
    /// Worst-case total backoff across all attempts (ignores Retry-After)
    pub fn worst_case_backoff(&self) -> Duration {
        let policy = RetryPolicy::from(*self);
        (1..self.max_attempts.max(1))
            .map(|n| policy.backoff(n))
            .sum::<Duration>()
            .mul_f64(1.0 + self.jitter.clamp(0.0, 1.0))
            .min(Duration::from_millis(self.max_delay_ms).saturating_mul(self.max_attempts))
    }
}

/// Decides whether an error may be retried
pub type Classifier = Arc<dyn Fn(&ClientError) -> bool + Send + Sync>;

/// Retry policy with an error classifier
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor
    pub multiplier: f64,
    /// Cap for a single delay
    pub max_delay: Duration,
    /// Jitter fraction
    pub jitter: f64,
    classifier: Classifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            multiplier: s.multiplier.max(1.0),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter: s.jitter.clamp(0.0, 1.0),
            classifier: Arc::new(ClientError::is_retryable),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl RetryPolicy {
    /// Replace the retry classification
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ClientError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Whether `error` may be retried under this policy
    pub fn is_retryable(&self, error: &ClientError) -> bool {
        (self.classifier)(error)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay actually slept after failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.backoff(attempt);
        if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            delay = delay.mul_f64(factor.max(0.0)).min(self.max_delay);
        }
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

/// What happened on one attempt
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// Operation succeeded
    Succeeded,
    /// Retryable failure; next attempt after `delay`
    Retrying {
        /// Error that triggered the retry
        error: &'a ClientError,
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Non-retryable failure
    Fatal {
        /// The error
        error: &'a ClientError,
    },
    /// Retryable failure on the last attempt
    Exhausted {
        /// The last error
        error: &'a ClientError,
    },
}

impl AttemptOutcome<'_> {
    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "success",
            AttemptOutcome::Retrying { .. } => "retry",
            AttemptOutcome::Fatal { .. } => "fatal",
            AttemptOutcome::Exhausted { .. } => "exhausted",
        }
    }
}

/// Event passed to a [`RetryObserver`]
#[derive(Debug, Clone, Copy)]
pub struct RetryEvent<'a> {
    /// Operation label
    pub operation: &'a str,
    /// Attempt number (1-based)
    pub attempt: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// What happened
    pub outcome: AttemptOutcome<'a>,
}

/// Receives every attempt made by a [`RetryExecutor`]
pub trait RetryObserver: Send + Sync {
    /// Called after each attempt
    fn on_attempt(&self, event: &RetryEvent<'_>);
}

/// Logs attempts with `tracing` and records retry metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

fn retry_context<'a>(
    event: &RetryEvent<'a>,
    error: &'a ClientError,
    backoff: Duration,
) -> RetryContext<'a> {
    RetryContext {
        attempt: event.attempt,
        max_attempts: event.max_attempts,
        kind: error.kind,
        backoff,
        operation: event.operation,
        error_message: &error.message,
    }
}

impl RetryObserver for TracingObserver {
    fn on_attempt(&self, event: &RetryEvent<'_>) {
        metrics::record_retry_attempt(event.operation, event.outcome.label());

        match event.outcome {
            AttemptOutcome::Succeeded => {
                if event.attempt > 1 {
                    info!(
                        operation = event.operation,
                        attempt = event.attempt,
                        "Retry attempt {}/{} of {} succeeded",
                        event.attempt,
                        event.max_attempts,
                        event.operation
                    );
                }
            }
            AttemptOutcome::Retrying { error, delay } => {
                metrics::record_retry_backoff(event.operation, delay);
                warn!(
                    operation = event.operation,
                    attempt = event.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "{}",
                    retry_context(event, error, delay).format_retry()
                );
            }
            AttemptOutcome::Fatal { error } => {
                warn!(
                    operation = event.operation,
                    attempt = event.attempt,
                    error = %error,
                    "{}",
                    retry_context(event, error, Duration::ZERO).format_failure()
                );
            }
            AttemptOutcome::Exhausted { error } => {
                error!(
                    operation = event.operation,
                    attempt = event.attempt,
                    error = %error,
                    "{}",
                    retry_context(event, error, Duration::ZERO).format_failure()
                );
            }
        }
    }
}

/// Runs fallible async operations under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    observer: Arc<dyn RetryObserver>,
    shutdown: Option<SharedShutdown>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("shutdown", &self.shutdown.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Executor logging through [`TracingObserver`]
    pub fn new() -> Self {
        Self {
            observer: Arc::new(TracingObserver),
            shutdown: None,
        }
    }

    /// Replace the observer
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Interrupt backoff sleeps on shutdown
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> PipelineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match op(attempt).await {
                Ok(value) => {
                    self.notify(operation, attempt, max_attempts, AttemptOutcome::Succeeded);
                    return Ok(value);
                }
                Err(error) => error,
            };
            if error.kind == FailureKind::Cancelled {
                return Err(PipelineError::Cancelled);
            }

            if !policy.is_retryable(&error) {
                self.notify(
                    operation,
                    attempt,
                    max_attempts,
                    AttemptOutcome::Fatal { error: &error },
                );
                return Err(PipelineError::Fatal(error));
            }

            if attempt >= max_attempts {
                self.notify(
                    operation,
                    attempt,
                    max_attempts,
                    AttemptOutcome::Exhausted { error: &error },
                );
                return Err(PipelineError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = policy.delay_for(attempt, error.kind.retry_after());
            self.notify(
                operation,
                attempt,
                max_attempts,
                AttemptOutcome::Retrying {
                    error: &error,
                    delay,
                },
            );

            if !sleep_or_shutdown(self.shutdown.as_ref(), delay).await {
                return Err(PipelineError::Cancelled);
            }
            attempt += 1;
        }
    }

    fn notify(&self, operation: &str, attempt: u32, max_attempts: u32, outcome: AttemptOutcome<'_>) {
        self.observer.on_attempt(&RetryEvent {
            operation,
            attempt,
            max_attempts,
            outcome,
        });
    }
}
