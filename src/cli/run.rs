//! `run` command: one processing cycle over a product file

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{load_config, Cli, CliError, OutputFormat};
use crate::clients::source::JsonProductSource;
use crate::clients::CsvWritebackSink;
use crate::metrics;
use crate::pipeline::{CycleSummary, RunReport};
use crate::shutdown::SharedShutdown;
use crate::store::ProcessingStore;

/// Maximum allowed product concurrency
const MAX_CONCURRENCY: usize = 32;

/// Parse and validate concurrency value
fn parse_concurrency(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("concurrency must be at least 1".to_string());
    }
    if value > MAX_CONCURRENCY {
        return Err(format!(
            "concurrency {value} exceeds maximum of {MAX_CONCURRENCY}"
        ));
    }
    Ok(value)
}

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunCommand {
    /// Pipeline configuration file (JSON)
    #[arg(long, default_value = "publisher.json")]
    pub config: PathBuf,

    /// Products file (JSON array or JSON lines)
    #[arg(long)]
    pub products: PathBuf,

    /// Products processed concurrently (overrides the configuration, max 32)
    #[arg(long, value_parser = parse_concurrency)]
    pub concurrency: Option<usize>,

    /// Re-run products that already have an outcome
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Re-run products whose recorded outcome is a failure
    #[arg(long, default_value_t = false)]
    pub retry_failed: bool,

    /// Append outcomes to this CSV file
    #[arg(long)]
    pub writeback: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl RunCommand {
    /// Execute one cycle
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let (mut config, _warnings) = load_config(&self.config)?;
        if let Some(concurrency) = self.concurrency {
            config.run.concurrency = concurrency;
        }
        config.run.force |= self.force;
        config.run.retry_failed |= self.retry_failed;

        if let Some(addr) = self.metrics_addr {
            metrics::init_metrics(addr)?;
        }

        let store: Arc<dyn ProcessingStore> = Arc::new(config.open_store()?);
        let mut coordinator = config.build_coordinator(store, Some(shutdown))?;
        if let Some(path) = &self.writeback {
            info!("Writing outcomes to {}", path.display());
            coordinator = coordinator.with_sink(Arc::new(CsvWritebackSink::new(path)));
        }

        let source = JsonProductSource::new(&self.products);
        let spinner = (cli.output_format == OutputFormat::Human).then(create_spinner);
        let result = coordinator.run_cycle(&source).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        let summary = result?;

        match cli.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?),
            OutputFormat::Human => print_summary(&summary),
        }

        let failed = summary
            .reports
            .iter()
            .filter_map(RunReport::outcome)
            .filter(|o| o.is_failure())
            .count();
        if failed > 0 {
            return Err(CliError::RunFailed { failed });
        }
        Ok(())
    }
}

fn create_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Processing products");
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn report_json(report: &RunReport) -> serde_json::Value {
    json!({
        "fingerprint": report.fingerprint.as_str(),
        "disposition": report.disposition.label(),
        "outcome": report.outcome().map(|o| o.as_str()),
        "media_url": report.media_url.as_ref().map(|u| u.as_str()),
        "path": report.path(),
        "generation": report.generation.iter().map(|a| json!({
            "provider": a.provider,
            "status": a.status.as_str(),
            "external_job_id": a.external_job_id,
            "polls": a.polls,
            "error": a.last_error,
        })).collect::<Vec<_>>(),
        "publish": report.publish.values().map(|a| json!({
            "target": a.target,
            "status": a.status.as_str(),
            "attempts": a.attempt_number,
            "post_id": a.external_post_id,
            "error": a.last_error,
        })).collect::<Vec<_>>(),
        "errors": report.errors,
    })
}

fn summary_json(summary: &CycleSummary) -> serde_json::Value {
    let outcomes: serde_json::Map<String, serde_json::Value> = summary
        .by_outcome()
        .into_iter()
        .map(|(o, n)| (o.as_str().to_string(), json!(n)))
        .collect();
    json!({
        "processed": summary.reports.len(),
        "skipped": summary.skipped(),
        "duplicates": summary.duplicates,
        "not_started": summary.not_started,
        "dispositions": summary.by_disposition(),
        "outcomes": outcomes,
        "runs": summary.reports.iter().map(report_json).collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &CycleSummary) {
    for report in &summary.reports {
        println!("{}: {}", report.fingerprint, report.disposition);
        let path = report.path();
        if !path.is_empty() {
            println!("  path: {path}");
        }
        if let Some(url) = &report.media_url {
            println!("  media: {url}");
        }
        for attempt in report.publish.values() {
            match &attempt.external_post_id {
                Some(id) => println!("  {} -> {} ({id})", attempt.target, attempt.status.as_str()),
                None => println!("  {} -> {}", attempt.target, attempt.status.as_str()),
            }
        }
        for error in &report.errors {
            println!("  error: {error}");
        }
    }

    println!("\nSummary:");
    println!("  Processed: {}", summary.reports.len());
    for (outcome, count) in summary.by_outcome() {
        println!("  {outcome}: {count}");
    }
    if summary.skipped() > 0 {
        println!("  Skipped: {}", summary.skipped());
    }
    if summary.duplicates > 0 {
        println!("  Duplicates ignored: {}", summary.duplicates);
    }
    if summary.not_started > 0 {
        println!("  Not started (shutdown): {}", summary.not_started);
    }
}
