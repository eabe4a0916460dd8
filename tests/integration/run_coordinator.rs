//! End-to-end runs against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use product_video_publisher::clients::source::StaticProductSource;
use product_video_publisher::clients::ClientError;
use product_video_publisher::clock::ManualClock;
use product_video_publisher::model::{MediaSource, Outcome, PublishStatus};
use product_video_publisher::pipeline::{
    Disposition, GenerationCoordinator, RateLimiter, RetryExecutor, RunCoordinator, RunOptions,
    SkipReason,
};
use product_video_publisher::shutdown::ShutdownCoordinator;
use product_video_publisher::store::{
    AcquireOptions, AcquireOutcome, InMemoryProcessingStore, ProcessingStore, RecordState,
};

use crate::support::{
    coordinator, fanout, fast_policy, fp, memory_store, options, product, provider, target,
    FakeProvider, FakeTarget, FixedScript, RecordingSink,
};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_execute_once() {
    let store = memory_store();
    let gen = FakeProvider::ready_after(1, "https://cdn.example/v.mp4");
    let post = FakeTarget::ok("post-1");
    let first = coordinator(
        store.clone(),
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        vec![target("tiktok", post.clone())],
    );
    let second = coordinator(
        store.clone(),
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        vec![target("tiktok", post.clone())],
    );
    let item = product("F1");

    let (r1, r2) = tokio::join!(first.run(&item), second.run(&item));

    let completed = [&r1, &r2]
        .iter()
        .filter(|r| r.disposition == Disposition::Completed(Outcome::Success))
        .count();
    let skipped = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r.disposition, Disposition::Skipped(_)))
        .count();
    assert_eq!((completed, skipped), (1, 1));
    assert_eq!(gen.submits(), 1);
    assert_eq!(post.calls(), 1);

    let third = first.run(&item).await;
    assert_eq!(
        third.disposition,
        Disposition::Skipped(SkipReason::AlreadyCompleted(Outcome::Success))
    );
    assert_eq!(post.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_tasks_execute_once() {
    let store = memory_store();
    let gen = FakeProvider::ready("https://cdn.example/v.mp4");
    let post = FakeTarget::ok("post-1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let run = coordinator(
            store.clone(),
            vec![provider("a", gen.clone(), Duration::from_millis(5), MINUTE)],
            vec![target("tiktok", post.clone())],
        );
        handles.push(tokio::spawn(async move { run.run(&product("F2")).await }));
    }

    let mut completed = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        match report.disposition {
            Disposition::Completed(_) => completed += 1,
            Disposition::Skipped(_) => {}
            other => panic!("unexpected disposition {other:?}"),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(gen.submits(), 1);
    assert_eq!(post.calls(), 1);
}

#[tokio::test]
async fn test_existing_media_published_without_generation() {
    let gen = FakeProvider::ready("https://cdn.example/new.mp4");
    let post = FakeTarget::ok("post-9");
    let run = coordinator(
        memory_store(),
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        vec![target("instagram", post.clone())],
    );

    let report = run
        .run(&product("P1").with_existing_media("https://cdn/x.mp4"))
        .await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::Success));
    assert_eq!(report.media_source, Some(MediaSource::Existing));
    assert_eq!(report.path(), "existing");
    assert_eq!(gen.submits(), 0);
    assert_eq!(post.urls(), vec!["https://cdn/x.mp4".to_string()]);
    assert_eq!(report.post_ids().get("instagram").map(String::as_str), Some("post-9"));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_result_carries_second_provider_media() {
    let store = memory_store();
    let run = coordinator(
        store.clone(),
        vec![
            provider("a", FakeProvider::never_ready(), Duration::from_secs(10), MINUTE),
            provider("b", FakeProvider::ready("https://cdn.example/y.mp4"), Duration::from_secs(10), MINUTE),
        ],
        vec![target("tiktok", FakeTarget::ok("t-1"))],
    );

    let report = run.run(&product("P2")).await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::Success));
    assert_eq!(
        report.media_url.as_ref().map(|u| u.as_str()),
        Some("https://cdn.example/y.mp4")
    );
    assert_eq!(report.path(), "a=timed_out,b=ready");
    assert!(report.errors.iter().any(|e| e.starts_with("provider a:")));

    let record = store.get(&fp("P2")).await.unwrap().unwrap();
    assert_eq!(record.outcome, Some(Outcome::Success));
    assert_eq!(
        record.media_url.as_ref().map(|u| u.as_str()),
        Some("https://cdn.example/y.mp4")
    );
    assert_eq!(record.post_ids.get("tiktok").map(String::as_str), Some("t-1"));
}

#[tokio::test(start_paused = true)]
async fn test_generation_failure_skips_publishing() {
    let post = FakeTarget::ok("never");
    let store = memory_store();
    let run = coordinator(
        store.clone(),
        vec![provider("a", FakeProvider::job_fails("boom"), SECOND, MINUTE)],
        vec![target("tiktok", post.clone())],
    );

    let report = run.run(&product("P3")).await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::GenerationFailed));
    assert!(report.publish.is_empty());
    assert_eq!(post.calls(), 0);
    let record = store.get(&fp("P3")).await.unwrap().unwrap();
    assert_eq!(record.state(now()), RecordState::Completed(Outcome::GenerationFailed));
}

#[tokio::test]
async fn test_zero_targets_records_no_platforms() {
    let store = memory_store();
    let run = coordinator(store.clone(), Vec::new(), Vec::new());

    let report = run
        .run(&product("P4").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    assert_eq!(
        report.disposition,
        Disposition::Completed(Outcome::NoPlatformsConfigured)
    );
    assert!(report.publish.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_success_recorded() {
    let run = coordinator(
        memory_store(),
        Vec::new(),
        vec![
            target("a", FakeTarget::ok("a-1")),
            target("b", FakeTarget::failing(ClientError::status(503, "down"))),
        ],
    );

    let report = run
        .run(&product("P5").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::PartialSuccess));
    assert_eq!(report.publish["b"].status, PublishStatus::Exhausted);
    assert!(report.errors.iter().any(|e| e.starts_with("target b:")));
}

#[tokio::test]
async fn test_script_failure_releases_lock() {
    let store = memory_store();
    let gen = FakeProvider::ready("https://cdn.example/a.mp4");
    let broken = GenerationCoordinator::new(
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        Arc::new(FixedScript(Err(ClientError::status(400, "bad prompt")))),
        Arc::new(RateLimiter::new()),
        RetryExecutor::new(),
    )
    .with_script_policy(fast_policy());
    let run = RunCoordinator::new(store.clone(), Arc::new(broken), Arc::new(fanout(Vec::new())))
        .with_options(options());

    let report = run.run(&product("P6")).await;

    assert!(matches!(report.disposition, Disposition::Released(_)));
    assert_eq!(gen.submits(), 0);
    let record = store.get(&fp("P6")).await.unwrap().unwrap();
    assert_eq!(record.state(now()), RecordState::Released);

    // Nothing was recorded, so the next run processes the product
    let again = store
        .try_acquire(&fp("P6"), "next", AcquireOptions::new(MINUTE))
        .await
        .unwrap();
    assert!(matches!(again, AcquireOutcome::Acquired(_)));
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_records_failure() {
    let store = memory_store();
    let run = coordinator(
        store.clone(),
        vec![provider("slow", FakeProvider::never_ready(), SECOND, Duration::from_secs(3_600))],
        vec![target("tiktok", FakeTarget::ok("t"))],
    )
    .with_options(RunOptions {
        total_timeout: Some(Duration::from_secs(30)),
        ..options()
    });

    let report = run.run(&product("P7")).await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::Failed));
    assert!(report.errors.iter().any(|e| e.contains("timed out")));
    let record = store.get(&fp("P7")).await.unwrap().unwrap();
    assert_eq!(record.state(now()), RecordState::Completed(Outcome::Failed));
}

#[tokio::test]
async fn test_panic_before_side_effects_releases_lock() {
    let store = memory_store();
    let run = coordinator(
        store.clone(),
        vec![provider("a", FakeProvider::panicking(), SECOND, MINUTE)],
        vec![target("tiktok", FakeTarget::ok("t"))],
    );

    let report = run.run(&product("P8")).await;

    assert!(matches!(report.disposition, Disposition::Released(_)));
    assert!(report.errors.iter().any(|e| e.contains("provider exploded")));
    let record = store.get(&fp("P8")).await.unwrap().unwrap();
    assert_eq!(record.state(now()), RecordState::Released);
}

#[tokio::test]
async fn test_dropped_run_releases_lock() {
    let store = memory_store();
    let run = coordinator(
        store.clone(),
        vec![provider("a", FakeProvider::never_ready(), Duration::from_secs(3_600), Duration::from_secs(7_200))],
        Vec::new(),
    );
    let item = product("P9");

    let cancelled = tokio::time::timeout(Duration::from_millis(50), run.run(&item)).await;
    assert!(cancelled.is_err());

    let mut released = false;
    for _ in 0..50 {
        tokio::task::yield_now().await;
        let record = store.get(&fp("P9")).await.unwrap().unwrap();
        if record.state(now()) == RecordState::Released {
            released = true;
            break;
        }
    }
    assert!(released, "lease guard must release the lock when the run is dropped");
}

#[tokio::test]
async fn test_writeback_receives_outcome() {
    let sink = Arc::new(RecordingSink::default());
    let run = coordinator(memory_store(), Vec::new(), vec![target("tiktok", FakeTarget::ok("t-7"))])
        .with_sink(sink.clone());

    run.run(&product("P10").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    let calls = sink.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (fingerprint, outcome, media, post_ids) = &calls[0];
    assert_eq!(fingerprint, "P10");
    assert_eq!(*outcome, Outcome::Success);
    assert_eq!(media.as_deref(), Some("https://cdn.example/x.mp4"));
    assert_eq!(post_ids.get("tiktok").map(String::as_str), Some("t-7"));
}

#[tokio::test]
async fn test_writeback_failure_keeps_outcome() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });
    let store = memory_store();
    let run = coordinator(store.clone(), Vec::new(), vec![target("tiktok", FakeTarget::ok("t"))])
        .with_sink(sink);

    let report = run
        .run(&product("P11").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::Success));
    assert!(report.errors.iter().any(|e| e.starts_with("writeback:")));
    let record = store.get(&fp("P11")).await.unwrap().unwrap();
    assert_eq!(record.outcome, Some(Outcome::Success));
}

#[tokio::test]
async fn test_lock_held_elsewhere_is_skipped() {
    let store = memory_store();
    store
        .try_acquire(&fp("P12"), "other-host", AcquireOptions::new(MINUTE))
        .await
        .unwrap();
    let post = FakeTarget::ok("t");
    let run = coordinator(store, Vec::new(), vec![target("tiktok", post.clone())]);

    let report = run
        .run(&product("P12").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    assert_eq!(
        report.disposition,
        Disposition::Skipped(SkipReason::HeldByOther {
            owner: "other-host".into()
        })
    );
    assert_eq!(post.calls(), 0);
}

#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let clock = ManualClock::shared(1_000_000);
    let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::with_clock(clock.clone()));
    store
        .try_acquire(&fp("P13"), "crashed", AcquireOptions::new(MINUTE))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(61));

    let run = coordinator(store.clone(), Vec::new(), vec![target("tiktok", FakeTarget::ok("t"))]);
    let report = run
        .run(&product("P13").with_existing_media("https://cdn.example/x.mp4"))
        .await;

    assert_eq!(report.disposition, Disposition::Completed(Outcome::Success));
    let record = store.get(&fp("P13")).await.unwrap().unwrap();
    assert_eq!(record.acquisitions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_lock_taken_over_mid_run_stops_before_publishing() {
    let clock = ManualClock::shared(1_000_000);
    let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::with_clock(clock.clone()));
    let gen = FakeProvider::ready_after(10, "https://cdn.example/late.mp4");
    let post = FakeTarget::ok("t-1");
    let run = coordinator(
        store.clone(),
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        vec![target("tiktok", post.clone())],
    )
    .with_options(RunOptions {
        lock_ttl: MINUTE,
        heartbeat: Some(SECOND),
        ..options()
    });
    let item = product("P-X");

    let takeover = async {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        clock.advance(Duration::from_secs(120));
        store
            .try_acquire(&fp("P-X"), "other-host", AcquireOptions::new(MINUTE))
            .await
            .unwrap()
    };
    let (report, taken) = tokio::join!(run.run(&item), takeover);

    assert!(matches!(taken, AcquireOutcome::Acquired(_)));
    assert_eq!(report.disposition, Disposition::LockLost);
    assert!(gen.polls() < 10);
    assert_eq!(post.calls(), 0);

    let record = store.get(&fp("P-X")).await.unwrap().unwrap();
    assert_eq!(record.lock_owner.as_deref(), Some("other-host"));
    assert_eq!(record.outcome, None);
}

#[tokio::test(start_paused = true)]
async fn test_takeover_without_heartbeat_blocks_publishing() {
    let clock = ManualClock::shared(1_000_000);
    let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::with_clock(clock.clone()));
    let gen = FakeProvider::ready_after(3, "https://cdn.example/late.mp4");
    let post = FakeTarget::ok("t-1");
    let run = coordinator(
        store.clone(),
        vec![provider("a", gen.clone(), SECOND, MINUTE)],
        vec![target("tiktok", post.clone())],
    )
    .with_options(RunOptions {
        lock_ttl: MINUTE,
        ..options()
    });
    let item = product("P-Y");

    let takeover = async {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        clock.advance(Duration::from_secs(120));
        store
            .try_acquire(&fp("P-Y"), "other-host", AcquireOptions::new(MINUTE))
            .await
            .unwrap()
    };
    let (report, taken) = tokio::join!(run.run(&item), takeover);

    assert!(matches!(taken, AcquireOutcome::Acquired(_)));
    assert_eq!(report.disposition, Disposition::LockLost);
    assert_eq!(report.path(), "a=ready");
    assert_eq!(gen.submits(), 1);
    assert_eq!(post.calls(), 0);
    let record = store.get(&fp("P-Y")).await.unwrap().unwrap();
    assert_eq!(record.lock_owner.as_deref(), Some("other-host"));
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn test_run_futures_are_send() {
    let run = coordinator(
        memory_store(),
        vec![provider("a", FakeProvider::ready("https://cdn.example/v.mp4"), SECOND, MINUTE)],
        vec![target("tiktok", FakeTarget::ok("t"))],
    );
    let item = product("S1");
    let single = run.run(&item);
    assert_send(&single);
    let batch = run.process(vec![product("S2")]);
    assert_send(&batch);
}

#[tokio::test(start_paused = true)]
async fn test_retry_failed_reprocesses_failures_only() {
    let store = memory_store();
    let failing = coordinator(
        store.clone(),
        vec![provider("a", FakeProvider::job_fails("boom"), SECOND, MINUTE)],
        Vec::new(),
    );
    assert_eq!(
        failing.run(&product("P14")).await.disposition,
        Disposition::Completed(Outcome::GenerationFailed)
    );

    let healthy = FakeProvider::ready("https://cdn.example/ok.mp4");
    let plain = coordinator(
        store.clone(),
        vec![provider("a", healthy.clone(), SECOND, MINUTE)],
        vec![target("tiktok", FakeTarget::ok("t"))],
    );
    assert!(matches!(
        plain.run(&product("P14")).await.disposition,
        Disposition::Skipped(SkipReason::AlreadyCompleted(Outcome::GenerationFailed))
    ));

    let retrying = plain.with_options(RunOptions {
        retry_failed: true,
        ..options()
    });
    assert_eq!(
        retrying.run(&product("P14")).await.disposition,
        Disposition::Completed(Outcome::Success)
    );
    assert_eq!(
        retrying.run(&product("P14")).await.disposition,
        Disposition::Skipped(SkipReason::AlreadyCompleted(Outcome::Success))
    );
    assert_eq!(healthy.submits(), 1);
}

#[tokio::test]
async fn test_cycle_dedupes_and_counts() {
    let post = FakeTarget::ok("t");
    let run = coordinator(memory_store(), Vec::new(), vec![target("tiktok", post.clone())])
        .with_options(RunOptions {
            concurrency: 3,
            ..options()
        });
    let source = StaticProductSource::new(vec![
        product("A").with_existing_media("https://cdn.example/a.mp4"),
        product("B").with_existing_media("https://cdn.example/b.mp4"),
        product("A").with_existing_media("https://cdn.example/a.mp4"),
        product("C"),
    ]);

    let summary = run.run_cycle(&source).await.unwrap();

    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.reports.len(), 3);
    let fingerprints: Vec<_> = summary.reports.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(fingerprints, vec!["A", "B", "C"]);
    assert_eq!(summary.by_outcome().get(&Outcome::Success), Some(&2));
    assert_eq!(summary.by_outcome().get(&Outcome::GenerationFailed), Some(&1));
    assert!(summary.has_failures());
    assert_eq!(post.calls(), 2);
}

#[tokio::test]
async fn test_cycle_after_shutdown_starts_nothing() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();
    let post = FakeTarget::ok("t");
    let run = coordinator(memory_store(), Vec::new(), vec![target("tiktok", post.clone())])
        .with_shutdown(shutdown);

    let summary = run
        .process(vec![product("A").with_existing_media("https://cdn.example/a.mp4")])
        .await;

    assert_eq!(summary.not_started, 1);
    assert!(summary.reports.is_empty());
    assert_eq!(post.calls(), 0);
}
