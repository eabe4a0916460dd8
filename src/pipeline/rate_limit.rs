//! Per-target token bucket rate limiting
//!
//! Every outbound call to a provider or platform first takes a token from that
//! target's bucket. Buckets start full and refill continuously. `acquire` never
//! fails, it only delays; a shutdown request cuts the wait short. Pipeline
//! calls go through `permit`, which reports the cut-short wait so no request
//! is sent without a token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{PipelineError, PipelineResult};
use crate::metrics;
use crate::shutdown::{sleep_or_shutdown, SharedShutdown};

/// Slowest refill accepted; keeps wait computations finite
const MIN_REFILL_PER_SECOND: f64 = 1e-6;

/// Bucket configuration for one target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Burst size
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_second: f64,
}

impl RateLimit {
    /// `requests` per `window`, with a burst of `requests`
    pub fn per_window(requests: u32, window: Duration) -> Self {
        Self {
            capacity: requests,
            refill_per_second: f64::from(requests) / window.as_secs_f64().max(f64::EPSILON),
        }
    }

    /// Whether the limit can ever hand out a token
    pub fn is_valid(&self) -> bool {
        self.capacity >= 1 && self.refill_per_second.is_finite() && self.refill_per_second > 0.0
    }
}

/// Observable bucket state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateBucket {
    /// Target name
    pub target: String,
    /// Tokens currently available
    pub tokens: f64,
    /// Burst size
    pub capacity: u32,
    /// Refill rate
    pub refill_rate_per_second: f64,
    /// Wall-clock time of the last refill
    pub last_refill_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one target
#[derive(Debug)]
pub struct TokenBucket {
    target: String,
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(target: impl Into<String>, limit: RateLimit) -> Self {
        let capacity = f64::from(limit.capacity.max(1));
        Self {
            target: target.into(),
            capacity,
            refill_per_second: limit.refill_per_second.max(MIN_REFILL_PER_SECOND),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token, waiting for the refill if necessary
    ///
    /// Returns the time spent waiting. An interrupted wait (shutdown) returns
    /// without consuming a token.
    pub async fn acquire(&self, shutdown: Option<&SharedShutdown>) -> Duration {
        let started = Instant::now();
        self.take(shutdown)
            .await
            .unwrap_or_else(|| started.elapsed())
    }

    /// Take one token; `None` when shutdown interrupted the wait
    pub async fn take(&self, shutdown: Option<&SharedShutdown>) -> Option<Duration> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    let waited = started.elapsed();
                    metrics::record_rate_limit_wait(&self.target, waited, state.tokens);
                    return Some(waited);
                }
                let missing = 1.0 - state.tokens;
                Duration::try_from_secs_f64(missing / self.refill_per_second)
                    .unwrap_or(Duration::from_secs(3600))
            };

            if !sleep_or_shutdown(shutdown, wait).await {
                return None;
            }
        }
    }

    /// Snapshot of the bucket
    pub async fn snapshot(&self) -> RateBucket {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        RateBucket {
            target: self.target.clone(),
            tokens: state.tokens,
            capacity: self.capacity as u32,
            refill_rate_per_second: self.refill_per_second,
            last_refill_at: Utc::now(),
        }
    }
}

/// Process-wide registry of buckets, one per target
///
/// Targets without their own limit share nothing: each gets a private bucket
/// built from the default limit, or goes unthrottled if there is none.
#[derive(Debug, Default)]
pub struct RateLimiter {
    configured: HashMap<String, Arc<TokenBucket>>,
    default_limit: Option<RateLimit>,
    defaulted: StdMutex<HashMap<String, Arc<TokenBucket>>>,
    shutdown: Option<SharedShutdown>,
}

impl RateLimiter {
    /// Empty limiter: every target unthrottled
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a target's bucket
    pub fn with_limit(mut self, target: impl Into<String>, limit: RateLimit) -> Self {
        let target = target.into();
        self.configured
            .insert(target.clone(), Arc::new(TokenBucket::new(target, limit)));
        self
    }

    /// Limit applied to targets without explicit configuration
    pub fn with_default(mut self, limit: Option<RateLimit>) -> Self {
        self.default_limit = limit;
        self
    }

    /// Interrupt waits on shutdown
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn bucket(&self, target: &str) -> Option<Arc<TokenBucket>> {
        if let Some(bucket) = self.configured.get(target) {
            return Some(bucket.clone());
        }
        let limit = self.default_limit?;
        let mut defaulted = self.defaulted.lock().unwrap_or_else(|e| e.into_inner());
        Some(
            defaulted
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(target, limit)))
                .clone(),
        )
    }

    /// Wait for and consume one token of `target`
    pub async fn acquire(&self, target: &str) -> Duration {
        match self.bucket(target) {
            Some(bucket) => bucket.acquire(self.shutdown.as_ref()).await,
            None => Duration::ZERO,
        }
    }

    /// Token for an outbound call, or `Cancelled` once shutdown is requested
    ///
    /// Unlike [`acquire`](Self::acquire), a caller never proceeds without a
    /// token after shutdown, throttled target or not.
    pub async fn permit(&self, target: &str) -> PipelineResult<Duration> {
        if self
            .shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
        {
            return Err(PipelineError::Cancelled);
        }
        match self.bucket(target) {
            Some(bucket) => bucket
                .take(self.shutdown.as_ref())
                .await
                .ok_or(PipelineError::Cancelled),
            None => Ok(Duration::ZERO),
        }
    }

    /// Whether `target` is throttled at all
    pub fn is_limited(&self, target: &str) -> bool {
        self.configured.contains_key(target) || self.default_limit.is_some()
    }

    /// Snapshots of every bucket created so far, sorted by target
    pub async fn snapshot(&self) -> Vec<RateBucket> {
        let mut buckets: Vec<Arc<TokenBucket>> = self.configured.values().cloned().collect();
        {
            let defaulted = self.defaulted.lock().unwrap_or_else(|e| e.into_inner());
            buckets.extend(defaulted.values().cloned());
        }

        let mut snapshots = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            snapshots.push(bucket.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}
