//! Scoped processing lock with heartbeat
//!
//! A [`LeaseGuard`] owns an acquired lock for the duration of one run. While
//! alive it renews the lock in the background; it must be resolved with
//! [`LeaseGuard::complete`] or [`LeaseGuard::release`]. If the guard is dropped
//! unresolved (cancelled future, panic unwinding) a release is scheduled on
//! the runtime, and the TTL remains the backstop if even that cannot run.
//!
//! A renewal that finds the lock taken over flips the lease to lost. Holders
//! of a [`LeaseWatch`] are woken so the run can stop before its next external
//! call.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Completion, ProcessingRecord, ProcessingStore, StoreError, StoreResult};
use crate::fingerprint::ProductFingerprint;

/// Lock lifetime and renewal cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Lock TTL set on acquire and on every renewal
    pub ttl: Duration,
    /// Renewal interval; `None` disables the heartbeat
    pub heartbeat: Option<Duration>,
}

/// Held processing lock
pub struct LeaseGuard {
    store: Arc<dyn ProcessingStore>,
    fingerprint: ProductFingerprint,
    owner: String,
    ttl: Duration,
    heartbeat: Option<JoinHandle<()>>,
    lost: Arc<watch::Sender<bool>>,
    resolved: bool,
}

/// Read side of a lease's lost flag
#[derive(Debug, Clone)]
pub struct LeaseWatch(watch::Receiver<bool>);

impl LeaseWatch {
    /// Whether the lock was found taken over
    pub fn is_lost(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the lock is found taken over; pends forever otherwise
    pub async fn lost(&mut self) {
        let closed = self.0.wait_for(|lost| *lost).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("fingerprint", &self.fingerprint)
            .field("owner", &self.owner)
            .field("lost", &self.is_lost())
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl LeaseGuard {
    /// Wrap a lock just acquired by `owner`
    ///
    /// Must be called from within a Tokio runtime when a heartbeat is set.
    pub fn new(
        store: Arc<dyn ProcessingStore>,
        fingerprint: ProductFingerprint,
        owner: impl Into<String>,
        settings: LeaseSettings,
    ) -> Self {
        let owner = owner.into();
        let (lost, _) = watch::channel(false);
        let lost = Arc::new(lost);
        let heartbeat = settings.heartbeat.filter(|i| !i.is_zero()).map(|interval| {
            tokio::spawn(heartbeat_loop(
                store.clone(),
                fingerprint.clone(),
                owner.clone(),
                settings.ttl,
                interval,
                lost.clone(),
            ))
        });

        Self {
            store,
            fingerprint,
            owner,
            ttl: settings.ttl,
            heartbeat,
            lost,
            resolved: false,
        }
    }

    /// Lock owner id
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fingerprint locked
    pub fn fingerprint(&self) -> &ProductFingerprint {
        &self.fingerprint
    }

    /// Whether a renewal found the lock taken over
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Subscribe to the lost flag
    pub fn watch(&self) -> LeaseWatch {
        LeaseWatch(self.lost.subscribe())
    }

    /// Renew now and fail with `LockLost` if the lock is no longer ours
    ///
    /// Used as a fence before irreversible external calls; works with the
    /// heartbeat disabled.
    pub async fn confirm(&self) -> StoreResult<()> {
        if self.is_lost() {
            return Err(StoreError::LockLost {
                fingerprint: self.fingerprint.to_string(),
                owner: self.owner.clone(),
            });
        }
        match self.store.renew(&self.fingerprint, &self.owner, self.ttl).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e, StoreError::LockLost { .. }) {
                    self.lost.send_replace(true);
                }
                Err(e)
            }
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    /// Terminal write
    pub async fn complete(mut self, completion: Completion) -> StoreResult<ProcessingRecord> {
        self.stop_heartbeat();
        self.resolved = true;
        self.store
            .complete(&self.fingerprint, &self.owner, completion)
            .await
    }

    /// Early release without a terminal write
    pub async fn release(mut self) -> StoreResult<()> {
        self.stop_heartbeat();
        self.resolved = true;
        self.store.release(&self.fingerprint, &self.owner).await
    }

    /// Give up a lock another owner has taken over, without touching the store
    pub fn abandon(mut self) {
        self.stop_heartbeat();
        self.resolved = true;
        warn!(
            fingerprint = %self.fingerprint,
            owner = %self.owner,
            "Abandoning lock taken over by another owner"
        );
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.resolved {
            return;
        }

        warn!(
            fingerprint = %self.fingerprint,
            owner = %self.owner,
            "Lease dropped without being resolved, scheduling release"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let fingerprint = self.fingerprint.clone();
                let owner = std::mem::take(&mut self.owner);
                handle.spawn(async move {
                    if let Err(e) = store.release(&fingerprint, &owner).await {
                        warn!(fingerprint = %fingerprint, error = %e, "Deferred release failed");
                    }
                });
            }
            Err(_) => warn!(
                fingerprint = %self.fingerprint,
                "No runtime available for deferred release; lock will expire by TTL"
            ),
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn ProcessingStore>,
    fingerprint: ProductFingerprint,
    owner: String,
    ttl: Duration,
    interval: Duration,
    lost: Arc<watch::Sender<bool>>,
) {
    loop {
        tokio::time::sleep(interval).await;
        match store.renew(&fingerprint, &owner, ttl).await {
            Ok(record) => debug!(
                fingerprint = %fingerprint,
                expires_at = record.lock_expires_at,
                "Lock renewed"
            ),
            Err(StoreError::LockLost { .. }) => {
                warn!(fingerprint = %fingerprint, owner = %owner, "Lock lost during run");
                lost.send_replace(true);
                return;
            }
            Err(e) => warn!(fingerprint = %fingerprint, error = %e, "Lock renewal failed"),
        }
    }
}
