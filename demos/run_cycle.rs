//! Example running one processing cycle against in-process fakes
//!
//! Run with:
//! ```bash
//! cargo run --example run_cycle
//! ```
//!
//! The first provider never finishes, so the chain falls back to the second.
//! One platform is flaky and recovers after a retry. Running the cycle a
//! second time shows every product skipped as already completed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use product_video_publisher::clients::script::TemplateScriptProvider;
use product_video_publisher::clients::source::StaticProductSource;
use product_video_publisher::clients::{
    ClientError, ClientResult, Credentials, GenerationProviderClient, JobStatus,
    PublishTargetClient,
};
use product_video_publisher::fingerprint::ProductFingerprint;
use product_video_publisher::model::{MediaUrl, Product, ProductMetadata};
use product_video_publisher::pipeline::{
    GenerationCoordinator, ProviderSlot, PublishFanout, PublishTarget, RateLimit, RateLimiter,
    RetryExecutor, RunCoordinator, RunOptions,
};
use product_video_publisher::store::InMemoryProcessingStore;

/// Provider whose jobs never leave the queue
struct StuckProvider;

#[async_trait]
impl GenerationProviderClient for StuckProvider {
    async fn submit(&self, _script: &str, _metadata: &ProductMetadata) -> ClientResult<String> {
        Ok("stuck-1".to_string())
    }

    async fn poll_status(&self, _job_id: &str) -> ClientResult<JobStatus> {
        Ok(JobStatus::processing())
    }
}

/// Provider that renders after a couple of polls
struct QuickProvider {
    polls: AtomicU32,
}

#[async_trait]
impl GenerationProviderClient for QuickProvider {
    async fn submit(&self, _script: &str, metadata: &ProductMetadata) -> ClientResult<String> {
        Ok(format!("render-{}", metadata.title.to_lowercase().replace(' ', "-")))
    }

    async fn poll_status(&self, job_id: &str) -> ClientResult<JobStatus> {
        if self.polls.fetch_add(1, Ordering::SeqCst) % 3 < 2 {
            return Ok(JobStatus::processing());
        }
        Ok(JobStatus::succeeded(format!("https://cdn.example/{job_id}.mp4")))
    }
}

/// Platform failing every other post with a 503
struct FlakyPlatform {
    name: &'static str,
    posts: AtomicU32,
}

#[async_trait]
impl PublishTargetClient for FlakyPlatform {
    async fn post(
        &self,
        media_url: &MediaUrl,
        caption: &str,
        _credentials: &Credentials,
    ) -> ClientResult<String> {
        let n = self.posts.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 0 {
            return Err(ClientError::status(503, "service unavailable"));
        }
        println!("  [{}] posted {media_url} ({} chars)", self.name, caption.chars().count());
        Ok(format!("{}-{n}", self.name))
    }
}

fn products() -> Result<Vec<Product>, Box<dyn std::error::Error>> {
    let mut lamp = ProductMetadata::titled("Desk Lamp");
    lamp.description = Some("Warm light for late nights".to_string());
    lamp.hashtags = vec!["lamp".to_string(), "home".to_string()];

    Ok(vec![
        Product::new(ProductFingerprint::parse("SKU-LAMP")?, lamp),
        Product::new(ProductFingerprint::parse("SKU-MUG")?, ProductMetadata::titled("Mug"))
            .with_existing_media("https://cdn.example/mug.mp4"),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("product_video_publisher=info")
        .init();

    let limiter = Arc::new(
        RateLimiter::new().with_limit("tiktok", RateLimit::per_window(2, Duration::from_secs(1))),
    );
    let retry = RetryExecutor::new();

    let generation = GenerationCoordinator::new(
        vec![
            ProviderSlot::new(
                "stuck",
                Arc::new(StuckProvider),
                Duration::from_millis(100),
                Duration::from_millis(500),
            ),
            ProviderSlot::new(
                "quick",
                Arc::new(QuickProvider {
                    polls: AtomicU32::new(0),
                }),
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
        ],
        Arc::new(TemplateScriptProvider::default()),
        limiter.clone(),
        retry.clone(),
    );
    let fanout = PublishFanout::new(
        vec![
            PublishTarget::new(
                "tiktok",
                Arc::new(FlakyPlatform {
                    name: "tiktok",
                    posts: AtomicU32::new(0),
                }),
            )
            .with_caption_limit(Some(150)),
            PublishTarget::new(
                "youtube",
                Arc::new(FlakyPlatform {
                    name: "youtube",
                    posts: AtomicU32::new(0),
                }),
            ),
        ],
        limiter,
        retry,
    );

    let coordinator = RunCoordinator::new(
        Arc::new(InMemoryProcessingStore::new()),
        Arc::new(generation),
        Arc::new(fanout),
    )
    .with_owner_prefix("demo")
    .with_options(RunOptions {
        concurrency: 2,
        ..RunOptions::default()
    });
    let source = StaticProductSource::new(products()?);

    println!("=== First cycle ===");
    let summary = coordinator.run_cycle(&source).await?;
    for report in &summary.reports {
        println!("{}: {} (path: {})", report.fingerprint, report.disposition, report.path());
        for (target, id) in report.post_ids() {
            println!("  {target} -> {id}");
        }
    }

    println!("\n=== Second cycle ===");
    let summary = coordinator.run_cycle(&source).await?;
    for report in &summary.reports {
        println!("{}: {}", report.fingerprint, report.disposition);
    }
    println!("\nSkipped: {}", summary.skipped());
    Ok(())
}
