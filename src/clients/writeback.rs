//! Writeback sinks for terminal outcomes
//!
//! The CSV sink appends one row per recorded outcome so the result of every
//! product is visible next to the input sheet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClientError, ClientResult, WritebackSink};
use crate::fingerprint::ProductFingerprint;
use crate::model::{MediaUrl, Outcome};

/// Sink that discards outcomes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl WritebackSink for NoopSink {
    async fn record_outcome(
        &self,
        _fingerprint: &ProductFingerprint,
        _outcome: Outcome,
        _media_url: Option<&MediaUrl>,
        _post_ids: &BTreeMap<String, String>,
    ) -> ClientResult<()> {
        Ok(())
    }
}

/// One CSV row
#[derive(Debug, Serialize)]
struct OutcomeRecord {
    fingerprint: String,
    outcome: &'static str,
    media_url: String,
    post_ids: String,
    recorded_at: String,
}

/// Appends outcomes to a CSV file
///
/// The header is written when the file is new or empty. Writes are serialised
/// and run on the blocking pool.
#[derive(Debug, Clone)]
pub struct CsvWritebackSink {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl CsvWritebackSink {
    /// Create a sink appending to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `target=post_id` pairs separated by `;`
fn format_post_ids(post_ids: &BTreeMap<String, String>) -> String {
    post_ids
        .iter()
        .map(|(target, id)| format!("{target}={id}"))
        .collect::<Vec<_>>()
        .join(";")
}

fn append_row(path: &Path, record: &OutcomeRecord) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create directory: {e}"))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
    let needs_header = file
        .metadata()
        .map(|m| m.len() == 0)
        .map_err(|e| format!("failed to stat {}: {e}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(BufWriter::new(file));
    writer
        .serialize(record)
        .map_err(|e| format!("failed to write row: {e}"))?;
    writer.flush().map_err(|e| format!("failed to flush: {e}"))?;
    Ok(())
}

#[async_trait]
impl WritebackSink for CsvWritebackSink {
    async fn record_outcome(
        &self,
        fingerprint: &ProductFingerprint,
        outcome: Outcome,
        media_url: Option<&MediaUrl>,
        post_ids: &BTreeMap<String, String>,
    ) -> ClientResult<()> {
        let record = OutcomeRecord {
            fingerprint: fingerprint.to_string(),
            outcome: outcome.as_str(),
            media_url: media_url.map(ToString::to_string).unwrap_or_default(),
            post_ids: format_post_ids(post_ids),
            recorded_at: DateTime::<Utc>::from(std::time::SystemTime::now()).to_rfc3339(),
        };

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_row(&path, &record))
            .await
            .map_err(|e| ClientError::other(format!("writeback task failed: {e}")))?
            .map_err(ClientError::other)?;

        debug!(fingerprint = %fingerprint, outcome = %outcome, "Outcome written back");
        Ok(())
    }
}
