//! # Product Video Publisher
//!
//! Turns product rows into published videos. For each product the pipeline
//! reuses existing media or walks a chain of long-running generation
//! providers, then fans the media out to every enabled publish target, each
//! with its own rate limit and retry policy. A durable processing store
//! guarantees that a product is processed at most once per cycle, even when
//! scheduled invocations overlap.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use product_video_publisher::config::PipelineConfig;
//! use product_video_publisher::clients::source::JsonProductSource;
//! use product_video_publisher::store::ProcessingStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load("publisher.json".as_ref())?;
//! config.validate()?;
//!
//! let store: Arc<dyn ProcessingStore> = Arc::new(config.open_store()?);
//! let coordinator = config.build_coordinator(store, None)?;
//! let summary = coordinator
//!     .run_cycle(&JsonProductSource::new("products.jsonl"))
//!     .await?;
//! println!("{} product(s) processed", summary.reports.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`pipeline`] - rate limiter, retry executor, provider fallback chain,
//!   publish fan-out and the per-product run coordinator
//! - [`store`] - processing lock and idempotency records (in memory or on disk)
//! - [`clients`] - capability traits for external collaborators plus generic
//!   HTTP, file and CSV adaptors
//! - [`config`] - validated JSON configuration and wiring
//! - [`model`] - products, media URLs, attempts and outcomes

#![warn(missing_docs)]
#![warn(clippy::all)]

/// CLI command implementations
pub mod cli;

/// External collaborator interfaces and adaptors
pub mod clients;

/// Injectable wall clock
pub mod clock;

/// Pipeline configuration
pub mod config;

/// Product fingerprints (idempotency keys)
pub mod fingerprint;

/// Metrics collection
pub mod metrics;

/// Domain data model
pub mod model;

/// Orchestration core
pub mod pipeline;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Processing lock and idempotency store
pub mod store;

pub use fingerprint::ProductFingerprint;
pub use model::{MediaUrl, Outcome, Product, ProductMetadata};
