//! Processing lock and idempotency store
//!
//! One [`ProcessingRecord`] per fingerprint records "being processed by X until
//! T" and "completed with outcome O". `try_acquire` is an atomic test-and-set;
//! a lock past its expiry with no terminal write is abandoned and may be taken
//! over, which is the only crash-recovery mechanism.

use crate::fingerprint::ProductFingerprint;
use crate::model::{MediaUrl, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod file;
pub mod lease;
pub mod memory;

pub use file::FileProcessingStore;
pub use lease::{LeaseGuard, LeaseSettings, LeaseWatch};
pub use memory::InMemoryProcessingStore;

use crate::clock::duration_millis;

/// Current durable record schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Processing store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// I/O failure
    #[error("IO error: {0}")]
    Io(String),

    /// Advisory file lock failure
    #[error("lock error: {0}")]
    Lock(String),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record written by an incompatible version
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Version this build understands
        expected: u32,
        /// Version on disk
        found: u32,
    },

    /// Record file larger than allowed
    #[error("record too large: {size} bytes (max: {max} bytes)")]
    RecordTooLarge {
        /// Actual size
        size: u64,
        /// Limit
        max: u64,
    },

    /// The caller no longer owns the lock (expired and taken over, or released)
    #[error("lock for '{fingerprint}' is no longer held by {owner}")]
    LockLost {
        /// Fingerprint concerned
        fingerprint: String,
        /// Caller that lost the lock
        owner: String,
    },

    /// No record for the fingerprint
    #[error("no processing record for '{0}'")]
    NotFound(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable processing state of one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Record format version
    pub schema_version: u32,
    /// Idempotency key
    pub fingerprint: ProductFingerprint,
    /// Current lock holder (`None` once completed or released)
    pub lock_owner: Option<String>,
    /// Lock expiry, Unix milliseconds
    pub lock_expires_at: Option<i64>,
    /// Last acquisition time, Unix milliseconds
    pub acquired_at: i64,
    /// Last mutation time, Unix milliseconds
    pub updated_at: i64,
    /// Number of times the lock was acquired
    pub acquisitions: u32,
    /// Terminal write time, Unix milliseconds
    pub completed_at: Option<i64>,
    /// Terminal outcome
    pub outcome: Option<Outcome>,
    /// Media published (terminal write)
    #[serde(default)]
    pub media_url: Option<MediaUrl>,
    /// Post id per target (terminal write)
    #[serde(default)]
    pub post_ids: BTreeMap<String, String>,
}

/// Derived state of a record at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    /// Terminal write present
    Completed(Outcome),
    /// Live lock
    Locked {
        /// Holder
        owner: String,
        /// Expiry (Unix ms)
        expires_at: i64,
    },
    /// Lock expired without a terminal write
    Stale {
        /// Previous holder
        owner: String,
    },
    /// Released early, never completed
    Released,
}

impl ProcessingRecord {
    fn new_locked(fingerprint: ProductFingerprint, owner: &str, ttl: Duration, now: i64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            fingerprint,
            lock_owner: Some(owner.to_string()),
            lock_expires_at: Some(now.saturating_add(duration_millis(ttl))),
            acquired_at: now,
            updated_at: now,
            acquisitions: 1,
            completed_at: None,
            outcome: None,
            media_url: None,
            post_ids: BTreeMap::new(),
        }
    }

    /// State of the record at `now`
    pub fn state(&self, now: i64) -> RecordState {
        if let (Some(outcome), Some(_)) = (self.outcome, self.completed_at) {
            return RecordState::Completed(outcome);
        }
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(owner), Some(expires_at)) if expires_at > now => RecordState::Locked {
                owner: owner.clone(),
                expires_at,
            },
            (Some(owner), _) => RecordState::Stale {
                owner: owner.clone(),
            },
            (None, _) => RecordState::Released,
        }
    }

    /// Whether a terminal write exists
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some() && self.outcome.is_some()
    }

    /// Whether `owner` currently holds the lock (ignores expiry)
    pub fn is_owned_by(&self, owner: &str) -> bool {
        !self.is_completed() && self.lock_owner.as_deref() == Some(owner)
    }
}

/// Options for [`ProcessingStore::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Lock lifetime
    pub ttl: Duration,
    /// Re-run even if already completed
    pub force: bool,
    /// Re-run records completed as `Failed`/`GenerationFailed`
    pub retry_failed: bool,
}

impl AcquireOptions {
    /// Plain acquisition with the given TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            force: false,
            retry_failed: false,
        }
    }
}

/// Result of [`ProcessingStore::try_acquire`]
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// Caller now holds the lock
    Acquired(ProcessingRecord),
    /// Fingerprint already has a terminal outcome
    AlreadyCompleted(ProcessingRecord),
    /// Someone else holds a live lock
    HeldByOther {
        /// Current holder
        owner: String,
        /// Expiry (Unix ms)
        expires_at: i64,
    },
}

impl AcquireOutcome {
    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            AcquireOutcome::Acquired(_) => "acquired",
            AcquireOutcome::AlreadyCompleted(_) => "already_completed",
            AcquireOutcome::HeldByOther { .. } => "held_by_other",
        }
    }
}

/// Terminal write payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    /// Outcome
    pub outcome: Option<Outcome>,
    /// Media published, if any
    pub media_url: Option<MediaUrl>,
    /// Post id per target
    pub post_ids: BTreeMap<String, String>,
}

impl Completion {
    /// Completion with just an outcome
    pub fn outcome(outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }
}

/// Durable "processing / completed" bookkeeping
#[async_trait]
pub trait ProcessingStore: Send + Sync {
    /// Atomically acquire the lock for `fingerprint`
    async fn try_acquire(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        options: AcquireOptions,
    ) -> StoreResult<AcquireOutcome>;

    /// Extend the lock; fails with `LockLost` if `owner` no longer holds it
    async fn renew(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<ProcessingRecord>;

    /// Terminal write; releases the lock
    async fn complete(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        completion: Completion,
    ) -> StoreResult<ProcessingRecord>;

    /// Release the lock without a terminal write
    async fn release(&self, fingerprint: &ProductFingerprint, owner: &str) -> StoreResult<()>;

    /// Current record, if any
    async fn get(&self, fingerprint: &ProductFingerprint) -> StoreResult<Option<ProcessingRecord>>;

    /// Every record, sorted by fingerprint
    async fn list(&self) -> StoreResult<Vec<ProcessingRecord>>;

    /// Delete a record regardless of state (maintenance)
    async fn forget(&self, fingerprint: &ProductFingerprint) -> StoreResult<bool>;
}

/// Test-and-set decision shared by every store implementation
///
/// Returns the outcome and, when the lock is acquired, the record to persist.
pub(crate) fn decide_acquire(
    existing: Option<&ProcessingRecord>,
    fingerprint: &ProductFingerprint,
    owner: &str,
    options: AcquireOptions,
    now: i64,
) -> (AcquireOutcome, Option<ProcessingRecord>) {
    let Some(record) = existing else {
        let record = ProcessingRecord::new_locked(fingerprint.clone(), owner, options.ttl, now);
        return (AcquireOutcome::Acquired(record.clone()), Some(record));
    };

    match record.state(now) {
        RecordState::Locked { owner, expires_at } => {
            return (AcquireOutcome::HeldByOther { owner, expires_at }, None);
        }
        RecordState::Completed(outcome) => {
            let rerun = options.force || (options.retry_failed && outcome.is_failure());
            if !rerun {
                return (AcquireOutcome::AlreadyCompleted(record.clone()), None);
            }
        }
        RecordState::Stale { .. } | RecordState::Released => {}
    }

    let mut next = ProcessingRecord::new_locked(fingerprint.clone(), owner, options.ttl, now);
    next.acquisitions = record.acquisitions.saturating_add(1);
    (AcquireOutcome::Acquired(next.clone()), Some(next))
}

fn lock_lost(fingerprint: &ProductFingerprint, owner: &str) -> StoreError {
    StoreError::LockLost {
        fingerprint: fingerprint.to_string(),
        owner: owner.to_string(),
    }
}

pub(crate) fn apply_renew(
    record: Option<&ProcessingRecord>,
    fingerprint: &ProductFingerprint,
    owner: &str,
    ttl: Duration,
    now: i64,
) -> StoreResult<ProcessingRecord> {
    let record = record.ok_or_else(|| lock_lost(fingerprint, owner))?;
    if !record.is_owned_by(owner) {
        return Err(lock_lost(fingerprint, owner));
    }
    let mut next = record.clone();
    next.lock_expires_at = Some(now.saturating_add(duration_millis(ttl)));
    next.updated_at = now;
    Ok(next)
}

pub(crate) fn apply_complete(
    record: Option<&ProcessingRecord>,
    fingerprint: &ProductFingerprint,
    owner: &str,
    completion: Completion,
    now: i64,
) -> StoreResult<ProcessingRecord> {
    let record = record.ok_or_else(|| lock_lost(fingerprint, owner))?;
    if !record.is_owned_by(owner) {
        return Err(lock_lost(fingerprint, owner));
    }
    let mut next = record.clone();
    next.lock_owner = None;
    next.lock_expires_at = None;
    next.completed_at = Some(now);
    next.updated_at = now;
    next.outcome = Some(completion.outcome.unwrap_or(Outcome::Failed));
    next.media_url = completion.media_url;
    next.post_ids = completion.post_ids;
    Ok(next)
}

/// `Ok(None)` means nothing to release (already released)
pub(crate) fn apply_release(
    record: Option<&ProcessingRecord>,
    fingerprint: &ProductFingerprint,
    owner: &str,
    now: i64,
) -> StoreResult<Option<ProcessingRecord>> {
    let Some(record) = record else {
        return Ok(None);
    };
    if record.lock_owner.is_none() {
        return Ok(None);
    }
    if !record.is_owned_by(owner) {
        return Err(lock_lost(fingerprint, owner));
    }
    let mut next = record.clone();
    next.lock_owner = None;
    next.lock_expires_at = None;
    next.updated_at = now;
    Ok(Some(next))
}
