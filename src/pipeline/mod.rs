//! Orchestration core
//!
//! Leaves first:
//! - [`rate_limit`]: per-target token buckets
//! - [`retry`]: bounded exponential-backoff retry with error classification
//! - [`poll`]: the generic bounded polling primitive
//! - [`generation`]: provider fallback chain
//! - [`publish`]: bounded concurrent fan-out to publish targets
//! - [`run`]: per-product coordinator and processing cycles

use crate::clients::{ClientError, FailureKind};
use crate::store::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod generation;
pub mod poll;
pub mod publish;
pub mod rate_limit;
pub mod retry;
pub mod run;

pub use generation::{
    GenerationCoordinator, GenerationOutcome, GenerationResult, ProbeSettings, ProviderSlot,
};
pub use publish::{FanoutReport, PublishFanout, PublishTarget};
pub use rate_limit::{RateBucket, RateLimit, RateLimiter};
pub use retry::{RetryExecutor, RetryPolicy, RetrySettings};
pub use run::{CycleSummary, Disposition, RunCoordinator, RunOptions, RunReport, SkipReason};

/// Pipeline errors
///
/// None of these escape a product run: the run coordinator turns each into a
/// terminal outcome or a skip.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Failure another attempt may fix
    #[error("retryable: {0}")]
    Retryable(ClientError),

    /// Failure that short-circuits the current provider or target
    #[error("fatal: {0}")]
    Fatal(ClientError),

    /// A bounded wait ran out
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Time spent
        elapsed: Duration,
    },

    /// Retry budget consumed
    #[error("exhausted after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: ClientError,
    },

    /// Another owner holds the processing lock (a skip, not a failure)
    #[error("lock held by {owner}")]
    LockContention {
        /// Current lock owner
        owner: String,
    },

    /// Processing store failure
    #[error("store error: {0}")]
    Store(String),

    /// Shutdown requested while waiting
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl PipelineError {
    /// Underlying collaborator error, if any
    pub fn client_error(&self) -> Option<&ClientError> {
        match self {
            PipelineError::Retryable(e) | PipelineError::Fatal(e) => Some(e),
            PipelineError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Whether this error was caused by shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
            || self
                .client_error()
                .is_some_and(|e| e.kind == FailureKind::Cancelled)
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err.to_string())
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Tracks whether a run has caused any external side effect
///
/// Set once a provider accepts a job or a publish attempt is sent. A run that
/// ends early with no side effect releases its lock instead of recording an
/// outcome.
#[derive(Debug, Clone, Default)]
pub struct SideEffects(Arc<AtomicBool>);

impl SideEffects {
    /// Fresh tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that something external happened
    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether anything external happened
    pub fn occurred(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
