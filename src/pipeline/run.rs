//! Per-product run coordinator
//!
//! `try_acquire -> resolve or generate -> publish -> complete(outcome)`.
//! A completed fingerprint, or one locked by someone else, is skipped without
//! blocking. Every exit path resolves the lock: terminal outcomes are written
//! with `complete`, early exits with no external side effect `release` it, and
//! a dropped run leaves it to the lease guard. A run whose lock is taken over
//! stops before its next external call and leaves the record to the new owner.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use super::generation::{GenerationCoordinator, GenerationOutcome, GenerationResult};
use super::publish::{FanoutReport, PublishFanout};
use super::{PipelineError, PipelineResult, SideEffects};
use crate::clients::{NoopSink, ProductSource, WritebackSink};
use crate::fingerprint::ProductFingerprint;
use crate::metrics::{self, RunMetrics};
use crate::model::{GenerationAttempt, MediaSource, MediaUrl, Outcome, Product, PublishAttempt};
use crate::shutdown::SharedShutdown;
use crate::store::{
    AcquireOptions, AcquireOutcome, Completion, LeaseGuard, LeaseSettings, ProcessingStore,
    StoreError,
};

/// Default lock TTL
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// Run-level settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Lock TTL (renewed by the heartbeat)
    pub lock_ttl: Duration,
    /// Heartbeat interval; `None` disables renewal
    pub heartbeat: Option<Duration>,
    /// Bound on one product's run; a fired timeout records `Failed`
    pub total_timeout: Option<Duration>,
    /// Re-run completed fingerprints
    pub force: bool,
    /// Re-run fingerprints completed as failures
    pub retry_failed: bool,
    /// Products processed concurrently in a cycle
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            heartbeat: Some(DEFAULT_LOCK_TTL / 4),
            total_timeout: None,
            force: false,
            retry_failed: false,
            concurrency: 1,
        }
    }
}

/// Why a product was not processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Terminal outcome already recorded
    AlreadyCompleted(Outcome),
    /// Live lock held by another owner
    HeldByOther {
        /// Lock holder
        owner: String,
    },
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing done
    Skipped(SkipReason),
    /// Terminal outcome recorded
    Completed(Outcome),
    /// Lock released without a terminal write (no external side effect)
    Released(String),
    /// Terminal write refused because the lock was taken over
    LockLost,
    /// Processing store failed
    StoreFailed(String),
}

impl Disposition {
    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Skipped(SkipReason::AlreadyCompleted(_)) => "skipped_completed",
            Disposition::Skipped(SkipReason::HeldByOther { .. }) => "skipped_locked",
            Disposition::Completed(_) => "completed",
            Disposition::Released(_) => "released",
            Disposition::LockLost => "lock_lost",
            Disposition::StoreFailed(_) => "store_failed",
        }
    }

    /// Outcome recorded by this run
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Disposition::Completed(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Completed(outcome) => write!(f, "completed ({outcome})"),
            Disposition::Skipped(SkipReason::AlreadyCompleted(outcome)) => {
                write!(f, "skipped (already completed: {outcome})")
            }
            Disposition::Skipped(SkipReason::HeldByOther { owner }) => {
                write!(f, "skipped (locked by {owner})")
            }
            Disposition::Released(reason) => write!(f, "released ({reason})"),
            Disposition::LockLost => f.write_str("lock lost"),
            Disposition::StoreFailed(reason) => write!(f, "store failed ({reason})"),
        }
    }
}

/// Everything a caller learns about one product's run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Product processed
    pub fingerprint: ProductFingerprint,
    /// How the run ended
    pub disposition: Disposition,
    /// Media published or attempted
    pub media_url: Option<MediaUrl>,
    /// Where the media came from
    pub media_source: Option<MediaSource>,
    /// Providers tried, in order
    pub generation: Vec<GenerationAttempt>,
    /// One attempt per enabled target
    pub publish: BTreeMap<String, PublishAttempt>,
    /// Last error per failed branch, plus run-level errors
    pub errors: Vec<String>,
}

impl RunReport {
    fn new(fingerprint: ProductFingerprint, disposition: Disposition) -> Self {
        Self {
            fingerprint,
            disposition,
            media_url: None,
            media_source: None,
            generation: Vec::new(),
            publish: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Outcome recorded by this run
    pub fn outcome(&self) -> Option<Outcome> {
        self.disposition.outcome()
    }

    /// Generation path, e.g. `a=timed_out,b=ready`
    pub fn path(&self) -> String {
        if self.media_source == Some(MediaSource::Existing) {
            return "existing".to_string();
        }
        self.generation
            .iter()
            .map(|a| format!("{}={}", a.provider, a.status.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Post id per succeeded target
    pub fn post_ids(&self) -> BTreeMap<String, String> {
        self.publish
            .iter()
            .filter_map(|(t, a)| a.external_post_id.clone().map(|id| (t.clone(), id)))
            .collect()
    }

    fn absorb(&mut self, body: RunBody) {
        for attempt in &body.generation.attempts {
            if let Some(err) = &attempt.last_error {
                self.errors.push(format!("provider {}: {err}", attempt.provider));
            }
        }
        if let GenerationOutcome::Ready { media_url, source } = &body.generation.outcome {
            self.media_url = Some(media_url.clone());
            self.media_source = Some(source.clone());
        }
        self.generation = body.generation.attempts;
        if let Some(fanout) = body.fanout {
            for (target, attempt) in &fanout.attempts {
                if let Some(err) = &attempt.last_error {
                    self.errors.push(format!("target {target}: {err}"));
                }
            }
            self.publish = fanout.attempts;
        }
    }
}

/// Result of one processing cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// One report per distinct fingerprint started, sorted by fingerprint
    pub reports: Vec<RunReport>,
    /// Repeated fingerprints ignored
    pub duplicates: usize,
    /// Products not started because of shutdown
    pub not_started: usize,
}

impl CycleSummary {
    /// Reports per disposition label
    pub fn by_disposition(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for report in &self.reports {
            *counts.entry(report.disposition.label()).or_insert(0) += 1;
        }
        counts
    }

    /// Completed runs per outcome
    pub fn by_outcome(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for outcome in self.reports.iter().filter_map(RunReport::outcome) {
            *counts.entry(outcome).or_insert(0) += 1;
        }
        counts
    }

    /// Whether any run recorded a failure outcome
    pub fn has_failures(&self) -> bool {
        self.reports
            .iter()
            .filter_map(RunReport::outcome)
            .any(|o| o.is_failure())
    }

    /// Runs skipped because of the store state
    pub fn skipped(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.disposition, Disposition::Skipped(_)))
            .count()
    }
}

struct RunBody {
    generation: GenerationResult,
    fanout: Option<FanoutReport>,
    /// Ownership check that stopped the run before publishing
    fence: Option<StoreError>,
}

enum BodyEnd {
    Finished(RunBody),
    Panicked(String),
    TimedOut(Duration),
    LockLost,
}

/// Ties lock, generation, publishing and bookkeeping together
pub struct RunCoordinator {
    store: Arc<dyn ProcessingStore>,
    generation: Arc<GenerationCoordinator>,
    fanout: Arc<PublishFanout>,
    sink: Arc<dyn WritebackSink>,
    options: RunOptions,
    owner_prefix: String,
    shutdown: Option<SharedShutdown>,
}

impl fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("generation", &self.generation)
            .field("fanout", &self.fanout)
            .field("options", &self.options)
            .field("owner_prefix", &self.owner_prefix)
            .finish_non_exhaustive()
    }
}

impl RunCoordinator {
    /// Coordinator writing outcomes to `store` and nowhere else
    pub fn new(
        store: Arc<dyn ProcessingStore>,
        generation: Arc<GenerationCoordinator>,
        fanout: Arc<PublishFanout>,
    ) -> Self {
        Self {
            store,
            generation,
            fanout,
            sink: Arc::new(NoopSink),
            options: RunOptions::default(),
            owner_prefix: format!("pid{}", std::process::id()),
            shutdown: None,
        }
    }

    /// Forward terminal outcomes to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn WritebackSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace run options
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Prefix of lock owner ids (each run appends a unique suffix)
    pub fn with_owner_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.owner_prefix = prefix.into();
        self
    }

    /// Stop starting products once shutdown is requested
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Current options
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn new_owner(&self) -> String {
        format!("{}-{}", self.owner_prefix, uuid::Uuid::new_v4().simple())
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|s| s.is_shutdown_requested())
    }

    /// Process one product
    ///
    /// Never fails: every problem ends up in the report's disposition and
    /// error list.
    pub async fn run(&self, product: &Product) -> RunReport {
        let span = info_span!("run", fingerprint = %product.fingerprint);
        self.run_inner(product).instrument(span).await
    }

    async fn run_inner(&self, product: &Product) -> RunReport {
        let timer = RunMetrics::start();
        let fingerprint = product.fingerprint.clone();
        let owner = self.new_owner();
        let options = AcquireOptions {
            ttl: self.options.lock_ttl,
            force: self.options.force,
            retry_failed: self.options.retry_failed,
        };

        let acquired = self.store.try_acquire(&fingerprint, &owner, options).await;
        if let Ok(outcome) = &acquired {
            metrics::record_lock_acquisition(outcome.label());
        }
        let report = match acquired {
            Err(e) => {
                error!(error = %e, "Processing store unavailable");
                let mut report = RunReport::new(fingerprint, Disposition::StoreFailed(e.to_string()));
                report.errors.push(e.to_string());
                report
            }
            Ok(AcquireOutcome::AlreadyCompleted(record)) => {
                let outcome = record.outcome.unwrap_or(Outcome::Failed);
                info!(outcome = %outcome, "Already completed, skipping");
                let mut report = RunReport::new(
                    fingerprint,
                    Disposition::Skipped(SkipReason::AlreadyCompleted(outcome)),
                );
                report.media_url = record.media_url;
                report
            }
            Ok(AcquireOutcome::HeldByOther { owner, expires_at }) => {
                let contention = PipelineError::LockContention {
                    owner: owner.clone(),
                };
                info!(reason = %contention, expires_at, "Skipping");
                RunReport::new(
                    fingerprint,
                    Disposition::Skipped(SkipReason::HeldByOther { owner }),
                )
            }
            Ok(AcquireOutcome::Acquired(record)) => {
                info!(owner = %owner, acquisitions = record.acquisitions, "Lock acquired");
                let guard = LeaseGuard::new(
                    self.store.clone(),
                    fingerprint,
                    owner,
                    LeaseSettings {
                        ttl: self.options.lock_ttl,
                        heartbeat: self.options.heartbeat,
                    },
                );
                self.process_locked(product, guard).await
            }
        };

        timer.record(
            report.disposition.label(),
            report.outcome().map(|o| o.as_str()),
        );
        info!(
            disposition = %report.disposition,
            path = %report.path(),
            media_url = report.media_url.as_ref().map(MediaUrl::as_str).unwrap_or_default(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Run finished"
        );
        report
    }

    async fn execute(
        &self,
        product: &Product,
        lease: &LeaseGuard,
        side_effects: &SideEffects,
    ) -> RunBody {
        let generation = self.generation.resolve(product, side_effects).await;
        let Some(media_url) = generation.media_url().cloned() else {
            return RunBody {
                generation,
                fanout: None,
                fence: None,
            };
        };
        if let Err(e) = lease.confirm().await {
            return RunBody {
                generation,
                fanout: None,
                fence: Some(e),
            };
        }
        let fanout = self
            .fanout
            .publish(&product.fingerprint, &media_url, &product.metadata, side_effects)
            .await;
        RunBody {
            generation,
            fanout: Some(fanout),
            fence: None,
        }
    }

    async fn process_locked(&self, product: &Product, guard: LeaseGuard) -> RunReport {
        let side_effects = SideEffects::new();
        let mut lease = guard.watch();
        let body = async {
            tokio::select! {
                biased;
                () = lease.lost() => BodyEnd::LockLost,
                result = AssertUnwindSafe(self.execute(product, &guard, &side_effects)).catch_unwind() => {
                    match result {
                        Ok(body) => BodyEnd::Finished(body),
                        Err(panic) => BodyEnd::Panicked(panic_message(panic.as_ref())),
                    }
                }
            }
        };

        let end = match self.options.total_timeout {
            Some(limit) => tokio::time::timeout(limit, body)
                .await
                .unwrap_or(BodyEnd::TimedOut(limit)),
            None => body.await,
        };

        let mut report = RunReport::new(product.fingerprint.clone(), Disposition::LockLost);
        let completion = match end {
            BodyEnd::Finished(mut body) => match body.fence.take() {
                None => {
                    let decision = decide(&body, &side_effects);
                    report.absorb(body);
                    decision
                }
                Some(err @ StoreError::LockLost { .. }) => {
                    report.absorb(body);
                    guard.abandon();
                    self.store_failure(&mut report, err);
                    return report;
                }
                Some(err) => {
                    report.absorb(body);
                    error!(error = %err, "Could not confirm lock ownership, not publishing");
                    let reason = format!("lock check: {err}");
                    report.errors.push(reason.clone());
                    if side_effects.occurred() {
                        Resolution::Complete(Completion::outcome(Outcome::Failed))
                    } else {
                        Resolution::Release(reason)
                    }
                }
            },
            BodyEnd::LockLost => {
                warn!("Lock taken over mid-run, stopping before further external calls");
                report
                    .errors
                    .push("lock lost: taken over by another owner".to_string());
                guard.abandon();
                return report;
            }
            BodyEnd::TimedOut(limit) => {
                let err = PipelineError::Timeout {
                    operation: "run".to_string(),
                    elapsed: limit,
                };
                warn!(error = %err, "Run timed out");
                report.errors.push(err.to_string());
                Resolution::Complete(Completion::outcome(Outcome::Failed))
            }
            BodyEnd::Panicked(message) => {
                error!(panic = %message, "Run panicked");
                report.errors.push(format!("panic: {message}"));
                if side_effects.occurred() {
                    Resolution::Complete(Completion::outcome(Outcome::Failed))
                } else {
                    Resolution::Release(format!("panic: {message}"))
                }
            }
        };

        match completion {
            Resolution::Complete(mut completion) => {
                let outcome = completion.outcome.unwrap_or(Outcome::Failed);
                completion.media_url = report.media_url.clone();
                completion.post_ids = report.post_ids();
                match guard.complete(completion).await {
                    Ok(record) => {
                        report.disposition = Disposition::Completed(outcome);
                        self.write_back(&mut report, outcome, &record.post_ids).await;
                    }
                    Err(e) => self.store_failure(&mut report, e),
                }
            }
            Resolution::Release(reason) => {
                info!(reason = %reason, "Releasing lock without outcome");
                match guard.release().await {
                    Ok(()) => report.disposition = Disposition::Released(reason),
                    Err(e) => self.store_failure(&mut report, e),
                }
            }
        }
        report
    }

    fn store_failure(&self, report: &mut RunReport, err: StoreError) {
        report.errors.push(err.to_string());
        report.disposition = match err {
            StoreError::LockLost { .. } => {
                warn!(error = %err, "Lock taken over, outcome not recorded");
                Disposition::LockLost
            }
            other => {
                error!(error = %other, "Could not resolve processing lock");
                Disposition::StoreFailed(other.to_string())
            }
        };
    }

    async fn write_back(
        &self,
        report: &mut RunReport,
        outcome: Outcome,
        post_ids: &BTreeMap<String, String>,
    ) {
        if let Err(e) = self
            .sink
            .record_outcome(&report.fingerprint, outcome, report.media_url.as_ref(), post_ids)
            .await
        {
            warn!(error = %e, "Writeback failed; recorded outcome unchanged");
            report.errors.push(format!("writeback: {e}"));
        }
    }

    /// Process a batch of products
    ///
    /// Repeated fingerprints are processed once. At most
    /// `options.concurrency` products run at a time; none start after shutdown.
    pub async fn process(&self, products: Vec<Product>) -> CycleSummary {
        let mut seen = HashSet::new();
        let mut duplicates = 0;
        let unique: Vec<Product> = products
            .into_iter()
            .filter(|p| {
                let fresh = seen.insert(p.fingerprint.clone());
                if !fresh {
                    duplicates += 1;
                    warn!(fingerprint = %p.fingerprint, "Duplicate fingerprint in cycle, ignoring");
                }
                fresh
            })
            .collect();

        let runs: Vec<_> = unique
            .iter()
            .map(|product| async move {
                if self.is_shutdown() {
                    None
                } else {
                    Some(self.run(product).await)
                }
            })
            .collect();
        let results: Vec<Option<RunReport>> = stream::iter(runs)
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let not_started = results.iter().filter(|r| r.is_none()).count();
        if not_started > 0 {
            warn!(not_started, "Shutdown requested, products left unprocessed");
        }
        let mut reports: Vec<RunReport> = results.into_iter().flatten().collect();
        reports.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        CycleSummary {
            reports,
            duplicates,
            not_started,
        }
    }

    /// Run one cycle over everything `source` yields
    pub async fn run_cycle(&self, source: &dyn ProductSource) -> PipelineResult<CycleSummary> {
        let products = source.products().await.map_err(PipelineError::Fatal)?;
        info!(products = products.len(), "Starting processing cycle");
        let summary = self.process(products).await;
        info!(
            processed = summary.reports.len(),
            skipped = summary.skipped(),
            duplicates = summary.duplicates,
            not_started = summary.not_started,
            "Processing cycle finished"
        );
        Ok(summary)
    }
}

enum Resolution {
    Complete(Completion),
    Release(String),
}

fn decide(body: &RunBody, side_effects: &SideEffects) -> Resolution {
    match &body.generation.outcome {
        GenerationOutcome::Ready { .. } => {
            let outcome = body
                .fanout
                .as_ref()
                .map(|f| f.outcome)
                .unwrap_or(Outcome::NoPlatformsConfigured);
            Resolution::Complete(Completion::outcome(outcome))
        }
        GenerationOutcome::AllProvidersFailed => {
            Resolution::Complete(Completion::outcome(Outcome::GenerationFailed))
        }
        GenerationOutcome::SetupFailed(reason) => Resolution::Release(reason.clone()),
        GenerationOutcome::Cancelled if side_effects.occurred() => {
            Resolution::Complete(Completion::outcome(Outcome::Failed))
        }
        GenerationOutcome::Cancelled => Resolution::Release("cancelled".to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
