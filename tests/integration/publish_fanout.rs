//! Multi-target publishing

use std::sync::Arc;
use std::time::Duration;

use product_video_publisher::clients::ClientError;
use product_video_publisher::model::{MediaUrl, Outcome, ProductMetadata, PublishStatus};
use product_video_publisher::pipeline::{PublishFanout, RateLimit, RateLimiter, RetryExecutor, SideEffects};
use product_video_publisher::shutdown::ShutdownCoordinator;

use crate::support::{fanout, fp, target, FakeTarget};

fn media() -> MediaUrl {
    MediaUrl::parse("https://cdn.example/x.mp4").unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_one_of_three_targets_succeeds() {
    let good = FakeTarget::ok("post-1");
    let rejected = FakeTarget::failing(ClientError::status(400, "caption too long"));
    let flaky = FakeTarget::failing(ClientError::status(503, "unavailable"));
    let fanout = fanout(vec![
        target("instagram", good.clone()),
        target("twitter", rejected.clone()),
        target("youtube", flaky.clone()),
    ]);

    let effects = SideEffects::new();
    let report = fanout
        .publish(&fp("P1"), &media(), &ProductMetadata::titled("Lamp"), &effects)
        .await;

    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert!(report.outcome.is_published());
    assert_eq!(report.attempts.len(), 3);

    let ig = &report.attempts["instagram"];
    assert_eq!(ig.status, PublishStatus::Succeeded);
    assert_eq!(ig.external_post_id.as_deref(), Some("post-1"));

    let tw = &report.attempts["twitter"];
    assert_eq!(tw.status, PublishStatus::Failed);
    assert_eq!(tw.attempt_number, 1);
    assert!(tw.last_error.is_some());

    let yt = &report.attempts["youtube"];
    assert_eq!(yt.status, PublishStatus::Exhausted);
    assert_eq!(yt.attempt_number, 3);
    assert_eq!(flaky.calls(), 3);

    assert_eq!(report.post_ids().len(), 1);
    assert!(effects.occurred());
}

#[tokio::test]
async fn test_zero_targets_is_not_a_failure() {
    let disabled = {
        let mut t = target("tiktok", FakeTarget::ok("p"));
        t.enabled = false;
        t
    };
    let fanout = fanout(vec![disabled]);

    let effects = SideEffects::new();
    let report = fanout
        .publish(&fp("P1"), &media(), &ProductMetadata::titled("Lamp"), &effects)
        .await;

    assert_eq!(report.outcome, Outcome::NoPlatformsConfigured);
    assert!(report.attempts.is_empty());
    assert!(!effects.occurred());
}

#[tokio::test]
async fn test_all_targets_succeed() {
    let a = FakeTarget::ok("a-1");
    let b = FakeTarget::ok("b-1");
    let fanout = fanout(vec![target("a", a.clone()), target("b", b.clone())]);

    let report = fanout
        .publish(&fp("P1"), &media(), &ProductMetadata::titled("Lamp"), &SideEffects::new())
        .await;

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(a.urls(), vec!["https://cdn.example/x.mp4".to_string()]);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn test_every_target_failing() {
    let fanout = fanout(vec![
        target("a", FakeTarget::failing(ClientError::status(401, "expired token"))),
        target("b", FakeTarget::failing(ClientError::malformed("no id"))),
    ]);

    let report = fanout
        .publish(&fp("P1"), &media(), &ProductMetadata::titled("Lamp"), &SideEffects::new())
        .await;

    assert_eq!(report.outcome, Outcome::Failed);
    assert!(report
        .attempts
        .values()
        .all(|a| a.status == PublishStatus::Failed));
}

#[tokio::test]
async fn test_caption_truncated_per_target() {
    let short = FakeTarget::ok("s");
    let long = FakeTarget::ok("l");
    let fanout = fanout(vec![
        target("short", short.clone()).with_caption_limit(Some(5)),
        target("long", long.clone()),
    ]);
    let mut metadata = ProductMetadata::titled("Desk lamp");
    metadata.hashtags = vec!["lighting".into()];

    fanout
        .publish(&fp("P1"), &media(), &metadata, &SideEffects::new())
        .await;

    let short_caption = short.posts.lock().unwrap()[0].1.clone();
    let long_caption = long.posts.lock().unwrap()[0].1.clone();
    assert_eq!(short_caption.chars().count(), 5);
    assert!(long_caption.contains("#lighting"));
}

#[tokio::test(start_paused = true)]
async fn test_targets_publish_concurrently() {
    let targets = (0..4)
        .map(|i| target(&format!("t{i}"), FakeTarget::slow("id", Duration::from_secs(10))))
        .collect();
    let fanout = fanout(targets).with_max_parallel(4);

    let started = tokio::time::Instant::now();
    let report = fanout
        .publish(&fp("P1"), &media(), &ProductMetadata::titled("Lamp"), &SideEffects::new())
        .await;

    assert_eq!(report.outcome, Outcome::Success);
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_target_is_throttled() {
    let client = FakeTarget::ok("id");
    let limiter = RateLimiter::new().with_limit(
        "tiktok",
        RateLimit {
            capacity: 1,
            refill_per_second: 0.5,
        },
    );
    let fanout = PublishFanout::new(
        vec![crate::support::target("tiktok", client.clone())],
        Arc::new(limiter),
        RetryExecutor::new(),
    );

    let started = tokio::time::Instant::now();
    for n in 0..2 {
        fanout
            .publish(&fp(&format!("P{n}")), &media(), &ProductMetadata::titled("Lamp"), &SideEffects::new())
            .await;
    }

    assert_eq!(client.calls(), 2);
    assert!(started.elapsed() >= Duration::from_millis(1_900));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_unsent_posts() {
    let shutdown = ShutdownCoordinator::shared();
    let limiter = Arc::new(
        RateLimiter::new()
            .with_limit(
                "tiktok",
                RateLimit {
                    capacity: 1,
                    refill_per_second: 0.01,
                },
            )
            .with_shutdown(shutdown.clone()),
    );
    let tiktok = FakeTarget::ok("t-1");
    let youtube = FakeTarget::ok("y-1");
    let fanout = PublishFanout::new(
        vec![target("tiktok", tiktok.clone()), target("youtube", youtube.clone())],
        limiter.clone(),
        RetryExecutor::new(),
    )
    .with_max_parallel(1);

    // Drain the bucket so the next tiktok post has to wait
    limiter.acquire("tiktok").await;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.request_shutdown();
    });

    let effects = SideEffects::new();
    let report = fanout
        .publish(&fp("P9"), &media(), &ProductMetadata::titled("Lamp"), &effects)
        .await;

    assert_eq!(tiktok.calls(), 0);
    assert_eq!(youtube.calls(), 0);
    assert_eq!(report.outcome, Outcome::Failed);
    for attempt in report.attempts.values() {
        assert_eq!(attempt.status, PublishStatus::Failed);
        assert_eq!(attempt.attempt_number, 0);
        assert!(attempt.last_error.as_deref().unwrap().contains("cancelled"));
    }
    assert!(!effects.occurred());
}
