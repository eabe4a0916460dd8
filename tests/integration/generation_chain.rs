//! Provider fallback chain

use std::sync::Arc;
use std::time::Duration;

use product_video_publisher::clients::{ClientError, JobStatus, ProbeResult};
use product_video_publisher::model::{GenerationStatus, MediaSource, MediaUrl};
use product_video_publisher::pipeline::generation::GenerationOutcome;
use product_video_publisher::pipeline::{ProbeSettings, SideEffects};

use crate::support::{generation, product, provider, FakeProvider, FixedProbe, FixedScript};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_third_provider_succeeds_after_two_failures() {
    let p1 = FakeProvider::rejecting(ClientError::status(400, "bad script"));
    let p2 = FakeProvider::job_fails("render crashed");
    let p3 = FakeProvider::ready_after(2, "https://cdn.example/p3.mp4");
    let coordinator = generation(vec![
        provider("p1", p1.clone(), SECOND, MINUTE),
        provider("p2", p2.clone(), SECOND, MINUTE),
        provider("p3", p3.clone(), SECOND, MINUTE),
    ]);

    let effects = SideEffects::new();
    let result = coordinator.resolve(&product("P9"), &effects).await;

    assert_eq!(
        result.media_url().map(MediaUrl::as_str),
        Some("https://cdn.example/p3.mp4")
    );
    assert_eq!(result.path(), "p1=failed,p2=failed,p3=ready");
    assert_eq!(result.attempts[0].external_job_id, None);
    assert!(result.attempts[1].last_error.as_deref().unwrap().contains("render crashed"));
    assert_eq!(result.attempts[2].polls, 3);
    assert_eq!(p1.submits(), 1, "fatal submission must not be retried");
    assert_eq!(p3.polls(), 3);
    assert!(effects.occurred());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_provider_falls_back() {
    let a = FakeProvider::never_ready();
    let b = FakeProvider::ready("https://cdn.example/y.mp4");
    let coordinator = generation(vec![
        provider("a", a.clone(), Duration::from_secs(10), MINUTE),
        provider("b", b.clone(), Duration::from_secs(10), MINUTE),
    ]);

    let result = coordinator.resolve(&product("P2"), &SideEffects::new()).await;

    let statuses: Vec<_> = result.attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![GenerationStatus::TimedOut, GenerationStatus::Ready]);
    assert_eq!(result.path(), "a=timed_out,b=ready");
    assert!(matches!(
        result.outcome,
        GenerationOutcome::Ready { ref source, .. } if *source == MediaSource::Provider("b".into())
    ));
    assert!(a.polls() >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_all_providers_failing() {
    let a = FakeProvider::job_fails("nope");
    let b = FakeProvider::rejecting(ClientError::status(503, "down"));
    let coordinator = generation(vec![
        provider("a", a, SECOND, MINUTE),
        provider("b", b.clone(), SECOND, MINUTE),
    ]);

    let result = coordinator.resolve(&product("P3"), &SideEffects::new()).await;

    assert_eq!(result.outcome, GenerationOutcome::AllProvidersFailed);
    assert_eq!(result.path(), "a=failed,b=failed");
    assert_eq!(b.submits(), 3, "server errors are retried up to the budget");
}

#[tokio::test]
async fn test_existing_media_skips_providers() {
    let a = FakeProvider::ready("https://cdn.example/new.mp4");
    let coordinator = generation(vec![provider("a", a.clone(), SECOND, MINUTE)]);
    let item = product("P1").with_existing_media("https://cdn/x.mp4");

    let effects = SideEffects::new();
    let result = coordinator.resolve(&item, &effects).await;

    assert_eq!(result.media_url().map(MediaUrl::as_str), Some("https://cdn/x.mp4"));
    assert!(result.attempts.is_empty());
    assert_eq!(a.submits(), 0);
    assert!(!effects.occurred());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_existing_media_is_regenerated() {
    let a = FakeProvider::ready("https://cdn.example/fresh.mp4");
    let coordinator = generation(vec![provider("a", a.clone(), SECOND, MINUTE)]).with_probe(
        Arc::new(FixedProbe(ProbeResult::Unreachable("404".into()))),
        ProbeSettings::default(),
    );
    let item = product("P1").with_existing_media("https://cdn.example/gone.mp4");

    let result = coordinator.resolve(&item, &SideEffects::new()).await;

    assert_eq!(
        result.media_url().map(MediaUrl::as_str),
        Some("https://cdn.example/fresh.mp4")
    );
    assert_eq!(a.submits(), 1);
}

#[tokio::test]
async fn test_forbidden_probe_tolerance_is_configurable() {
    let item = product("P1").with_existing_media("https://cdn.example/x.mp4");
    let probe = Arc::new(FixedProbe(ProbeResult::LikelyReachable(403)));

    let tolerant = generation(Vec::new()).with_probe(probe.clone(), ProbeSettings::default());
    let result = tolerant.resolve(&item, &SideEffects::new()).await;
    assert!(result.media_url().is_some());

    let strict = generation(Vec::new()).with_probe(
        probe,
        ProbeSettings {
            tolerate_forbidden: false,
            ..ProbeSettings::default()
        },
    );
    let result = strict.resolve(&item, &SideEffects::new()).await;
    assert_eq!(result.outcome, GenerationOutcome::AllProvidersFailed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_errors_keep_polling() {
    let a = FakeProvider::polling(
        vec![
            Err(ClientError::network("connection reset")),
            Err(ClientError::status(502, "bad gateway")),
        ],
        Ok(JobStatus::succeeded("https://cdn.example/z.mp4")),
    );
    let coordinator = generation(vec![provider("a", a.clone(), SECOND, MINUTE)]);

    let result = coordinator.resolve(&product("P4"), &SideEffects::new()).await;

    assert_eq!(result.path(), "a=ready");
    assert_eq!(a.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_poll_error_fails_provider() {
    let a = FakeProvider::polling(Vec::new(), Err(ClientError::status(404, "unknown job")));
    let b = FakeProvider::ready("https://cdn.example/b.mp4");
    let coordinator = generation(vec![
        provider("a", a.clone(), SECOND, MINUTE),
        provider("b", b, SECOND, MINUTE),
    ]);

    let result = coordinator.resolve(&product("P5"), &SideEffects::new()).await;

    assert_eq!(result.path(), "a=failed,b=ready");
    assert_eq!(a.polls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_without_url_is_provider_failure() {
    let a = FakeProvider::polling(
        Vec::new(),
        Ok(JobStatus {
            state: product_video_publisher::clients::JobState::Succeeded,
            media_url: None,
            error: None,
        }),
    );
    let coordinator = generation(vec![provider("a", a, SECOND, MINUTE)]);

    let result = coordinator.resolve(&product("P6"), &SideEffects::new()).await;

    assert_eq!(result.outcome, GenerationOutcome::AllProvidersFailed);
    assert_eq!(result.attempts[0].status, GenerationStatus::Failed);
}

#[tokio::test]
async fn test_script_failure_is_setup_error() {
    let a = FakeProvider::ready("https://cdn.example/a.mp4");
    let coordinator = product_video_publisher::pipeline::GenerationCoordinator::new(
        vec![provider("a", a.clone(), SECOND, MINUTE)],
        Arc::new(FixedScript(Err(ClientError::status(401, "bad key")))),
        Arc::new(product_video_publisher::pipeline::RateLimiter::new()),
        product_video_publisher::pipeline::RetryExecutor::new(),
    );

    let effects = SideEffects::new();
    let result = coordinator.resolve(&product("P7"), &effects).await;

    assert!(matches!(result.outcome, GenerationOutcome::SetupFailed(_)));
    assert_eq!(a.submits(), 0);
    assert!(!effects.occurred());
}
