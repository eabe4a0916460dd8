//! `status` command: inspect processing records

use chrono::{DateTime, Utc};
use clap::Args;
use std::path::PathBuf;

use super::{load_config, parse_fingerprint, Cli, CliError, OutputFormat};
use crate::fingerprint::ProductFingerprint;
use crate::store::{ProcessingRecord, ProcessingStore, RecordState, StoreError};

/// Status command arguments
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// Pipeline configuration file (JSON)
    #[arg(long, default_value = "publisher.json")]
    pub config: PathBuf,

    /// Only this fingerprint
    #[arg(long, value_parser = parse_fingerprint)]
    pub fingerprint: Option<ProductFingerprint>,
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn describe(record: &ProcessingRecord, now: i64) -> String {
    match record.state(now) {
        RecordState::Completed(outcome) => format!(
            "completed {outcome} at {}",
            record.completed_at.map(format_millis).unwrap_or_default()
        ),
        RecordState::Locked { owner, expires_at } => {
            format!("locked by {owner} until {}", format_millis(expires_at))
        }
        RecordState::Stale { owner } => format!("stale lock left by {owner}"),
        RecordState::Released => "released".to_string(),
    }
}

impl StatusCommand {
    /// Print one record or all of them
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let (config, _) = load_config(&self.config)?;
        let store = config.open_store()?;

        let records = match &self.fingerprint {
            Some(fp) => vec![store
                .get(fp)
                .await?
                .ok_or_else(|| StoreError::NotFound(fp.to_string()))?],
            None => store.list().await?,
        };

        match cli.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No processing records in {}", store.root().display());
                    return Ok(());
                }
                let now = Utc::now().timestamp_millis();
                for record in &records {
                    println!(
                        "{} | {} | acquisitions={}",
                        record.fingerprint,
                        describe(record, now),
                        record.acquisitions
                    );
                    if let Some(url) = &record.media_url {
                        println!("    media: {url}");
                    }
                    for (target, id) in &record.post_ids {
                        println!("    {target}: {id}");
                    }
                }
                println!("\n{} record(s)", records.len());
            }
        }
        Ok(())
    }
}
