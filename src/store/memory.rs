//! In-memory processing store
//!
//! Process-local; suitable for single-process deployments and tests. The whole
//! map sits behind one async mutex so every operation is atomic.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    apply_complete, apply_release, apply_renew, decide_acquire, AcquireOptions, AcquireOutcome,
    Completion, ProcessingRecord, ProcessingStore, StoreResult,
};
use crate::clock::{SharedClock, SystemClock};
use crate::fingerprint::ProductFingerprint;

/// Map-backed store
#[derive(Debug)]
pub struct InMemoryProcessingStore {
    records: Mutex<HashMap<ProductFingerprint, ProcessingRecord>>,
    clock: SharedClock,
}

impl Default for InMemoryProcessingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProcessingStore {
    /// Store reading the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Store reading an injected clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl ProcessingStore for InMemoryProcessingStore {
    async fn try_acquire(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        options: AcquireOptions,
    ) -> StoreResult<AcquireOutcome> {
        let mut records = self.records.lock().await;
        let now = self.clock.now_millis();
        let (outcome, write) =
            decide_acquire(records.get(fingerprint), fingerprint, owner, options, now);
        if let Some(record) = write {
            records.insert(fingerprint.clone(), record);
        }
        debug!(fingerprint = %fingerprint, owner, result = outcome.label(), "try_acquire");
        Ok(outcome)
    }

    async fn renew(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<ProcessingRecord> {
        let mut records = self.records.lock().await;
        let next = apply_renew(
            records.get(fingerprint),
            fingerprint,
            owner,
            ttl,
            self.clock.now_millis(),
        )?;
        records.insert(fingerprint.clone(), next.clone());
        Ok(next)
    }

    async fn complete(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        completion: Completion,
    ) -> StoreResult<ProcessingRecord> {
        let mut records = self.records.lock().await;
        let next = apply_complete(
            records.get(fingerprint),
            fingerprint,
            owner,
            completion,
            self.clock.now_millis(),
        )?;
        records.insert(fingerprint.clone(), next.clone());
        Ok(next)
    }

    async fn release(&self, fingerprint: &ProductFingerprint, owner: &str) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        if let Some(next) = apply_release(
            records.get(fingerprint),
            fingerprint,
            owner,
            self.clock.now_millis(),
        )? {
            records.insert(fingerprint.clone(), next);
        }
        Ok(())
    }

    async fn get(&self, fingerprint: &ProductFingerprint) -> StoreResult<Option<ProcessingRecord>> {
        Ok(self.records.lock().await.get(fingerprint).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<ProcessingRecord>> {
        let mut records: Vec<ProcessingRecord> =
            self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(records)
    }

    async fn forget(&self, fingerprint: &ProductFingerprint) -> StoreResult<bool> {
        Ok(self.records.lock().await.remove(fingerprint).is_some())
    }
}
