//! Lock lifecycle against both store implementations

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use product_video_publisher::clock::ManualClock;
use product_video_publisher::model::{MediaUrl, Outcome};
use product_video_publisher::store::{
    AcquireOptions, AcquireOutcome, Completion, FileProcessingStore, InMemoryProcessingStore,
    LeaseGuard, LeaseSettings, ProcessingStore, RecordState, StoreError,
};

use crate::support::fp;

const TTL: Duration = Duration::from_secs(600);
const START: i64 = 1_700_000_000_000;

/// Crash, expiry, takeover and a late completion by the crashed owner
async fn takeover_scenario(store: Arc<dyn ProcessingStore>, clock: Arc<ManualClock>) {
    let key = fp("SKU-9");
    let options = AcquireOptions::new(TTL);

    assert!(matches!(
        store.try_acquire(&key, "a", options).await.unwrap(),
        AcquireOutcome::Acquired(_)
    ));
    assert!(matches!(
        store.try_acquire(&key, "b", options).await.unwrap(),
        AcquireOutcome::HeldByOther { ref owner, .. } if owner == "a"
    ));

    clock.advance(TTL);
    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(
        record.state(START + TTL.as_millis() as i64),
        RecordState::Stale { owner: "a".into() }
    );
    assert!(matches!(
        store.try_acquire(&key, "b", options).await.unwrap(),
        AcquireOutcome::Acquired(ref r) if r.acquisitions == 2
    ));

    let late = store
        .complete(&key, "a", Completion::outcome(Outcome::Success))
        .await;
    assert!(matches!(late, Err(StoreError::LockLost { .. })));

    let mut post_ids = BTreeMap::new();
    post_ids.insert("youtube".to_string(), "yt-1".to_string());
    let done = store
        .complete(
            &key,
            "b",
            Completion {
                outcome: Some(Outcome::PartialSuccess),
                media_url: Some(MediaUrl::parse("https://cdn.example/v.mp4").unwrap()),
                post_ids,
            },
        )
        .await
        .unwrap();
    assert_eq!(done.lock_owner, None);
    assert_eq!(done.outcome, Some(Outcome::PartialSuccess));

    assert!(matches!(
        store.try_acquire(&key, "c", options).await.unwrap(),
        AcquireOutcome::AlreadyCompleted(_)
    ));
    let forced = AcquireOptions {
        force: true,
        ..options
    };
    assert!(matches!(
        store.try_acquire(&key, "c", forced).await.unwrap(),
        AcquireOutcome::Acquired(_)
    ));
}

#[tokio::test]
async fn test_memory_store_takeover() {
    let clock = ManualClock::shared(START);
    let store = Arc::new(InMemoryProcessingStore::with_clock(clock.clone()));
    takeover_scenario(store, clock).await;
}

#[tokio::test]
async fn test_file_store_takeover() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::shared(START);
    let store = Arc::new(FileProcessingStore::open_with_clock(dir.path(), clock.clone()).unwrap());
    takeover_scenario(store, clock).await;
}

#[tokio::test]
async fn test_renew_extends_expiry() {
    let clock = ManualClock::shared(START);
    let store = InMemoryProcessingStore::with_clock(clock.clone());
    let key = fp("SKU-1");
    store.try_acquire(&key, "a", AcquireOptions::new(TTL)).await.unwrap();

    clock.advance(Duration::from_secs(500));
    let renewed = store.renew(&key, "a", TTL).await.unwrap();
    assert_eq!(renewed.lock_expires_at, Some(START + 1_100_000));

    // Still held at the original expiry
    clock.advance(Duration::from_secs(200));
    assert!(matches!(
        store.try_acquire(&key, "b", AcquireOptions::new(TTL)).await.unwrap(),
        AcquireOutcome::HeldByOther { .. }
    ));
}

#[tokio::test]
async fn test_release_by_stranger_is_rejected() {
    let store = InMemoryProcessingStore::new();
    let key = fp("SKU-2");
    store.try_acquire(&key, "a", AcquireOptions::new(TTL)).await.unwrap();

    assert!(matches!(
        store.release(&key, "b").await,
        Err(StoreError::LockLost { .. })
    ));
    store.release(&key, "a").await.unwrap();
    // Releasing twice is a no-op
    store.release(&key, "a").await.unwrap();
}

#[tokio::test]
async fn test_retry_failed_only_reopens_failures() {
    let store = InMemoryProcessingStore::new();
    let options = AcquireOptions {
        retry_failed: true,
        ..AcquireOptions::new(TTL)
    };

    for (sku, outcome) in [("ok", Outcome::Success), ("bad", Outcome::GenerationFailed)] {
        store.try_acquire(&fp(sku), "a", AcquireOptions::new(TTL)).await.unwrap();
        store
            .complete(&fp(sku), "a", Completion::outcome(outcome))
            .await
            .unwrap();
    }

    assert!(matches!(
        store.try_acquire(&fp("ok"), "b", options).await.unwrap(),
        AcquireOutcome::AlreadyCompleted(_)
    ));
    assert!(matches!(
        store.try_acquire(&fp("bad"), "b", options).await.unwrap(),
        AcquireOutcome::Acquired(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_lease_heartbeat_outlives_ttl() {
    let clock = ManualClock::shared(START);
    let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::with_clock(clock.clone()));
    let key = fp("SKU-3");
    let ttl = Duration::from_secs(2);
    store.try_acquire(&key, "a", AcquireOptions::new(ttl)).await.unwrap();

    let guard = LeaseGuard::new(
        store.clone(),
        key.clone(),
        "a",
        LeaseSettings {
            ttl,
            heartbeat: Some(Duration::from_millis(500)),
        },
    );
    // Wall clock and timer advance together, well past the original TTL
    for _ in 0..6 {
        clock.advance(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
    }
    assert!(!guard.is_lost());
    assert!(matches!(
        store.try_acquire(&key, "b", AcquireOptions::new(ttl)).await.unwrap(),
        AcquireOutcome::HeldByOther { .. }
    ));

    let record = guard
        .complete(Completion::outcome(Outcome::Success))
        .await
        .unwrap();
    assert_eq!(record.outcome, Some(Outcome::Success));
}
