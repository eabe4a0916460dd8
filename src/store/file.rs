//! Durable file-backed processing store
//!
//! Layout under the store directory:
//! - `records/<storage key>.json`: one pretty-printed record per fingerprint
//! - `.store.lock`: store-wide advisory lock (fd-lock)
//!
//! Every mutation takes the exclusive advisory lock, reads the current record,
//! decides, and replaces the file atomically (temp file + fsync + rename), so
//! test-and-set holds across processes sharing the directory. Blocking file
//! I/O runs on the blocking pool.

use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    apply_complete, apply_release, apply_renew, decide_acquire, AcquireOptions, AcquireOutcome,
    Completion, ProcessingRecord, ProcessingStore, StoreError, StoreResult, SCHEMA_VERSION,
};
use crate::clock::{SharedClock, SystemClock};
use crate::fingerprint::ProductFingerprint;

/// Maximum allowed record file size (1 MB)
pub const MAX_RECORD_FILE_SIZE: u64 = 1024 * 1024;

const RECORDS_DIR: &str = "records";
const LOCK_FILE: &str = ".store.lock";

/// Directory-backed store
#[derive(Debug, Clone)]
pub struct FileProcessingStore {
    root: Arc<PathBuf>,
    clock: SharedClock,
}

impl FileProcessingStore {
    /// Open (creating if needed) a store in `root`
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with_clock(root, SystemClock::shared())
    }

    /// Open with an injected clock
    pub fn open_with_clock(root: impl Into<PathBuf>, clock: SharedClock) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(RECORDS_DIR)).map_err(|e| {
            StoreError::Io(format!("Failed to create store directory {}: {e}", root.display()))
        })?;
        debug!(path = %root.display(), "Opened processing store");
        Ok(Self {
            root: Arc::new(root),
            clock,
        })
    }

    /// Store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record file for a fingerprint
    pub fn record_path(&self, fingerprint: &ProductFingerprint) -> PathBuf {
        record_path(&self.root, fingerprint)
    }

    /// Run `f` on the blocking pool while holding the store lock
    async fn locked<T, F>(&self, exclusive: bool, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, i64) -> StoreResult<T> + Send + 'static,
    {
        let root = self.root.clone();
        let clock = self.clock.clone();
        tokio::task::spawn_blocking(move || {
            let mut lock = RwLock::new(open_lock_file(&root)?);
            if exclusive {
                let _guard = lock
                    .write()
                    .map_err(|e| StoreError::Lock(format!("Failed to acquire write lock: {e}")))?;
                f(&root, clock.now_millis())
            } else {
                let _guard = lock
                    .read()
                    .map_err(|e| StoreError::Lock(format!("Failed to acquire read lock: {e}")))?;
                f(&root, clock.now_millis())
            }
        })
        .await
        .map_err(|e| StoreError::Io(format!("store task failed: {e}")))?
    }
}

fn record_path(root: &Path, fingerprint: &ProductFingerprint) -> PathBuf {
    root.join(RECORDS_DIR)
        .join(format!("{}.json", fingerprint.storage_key()))
}

fn open_lock_file(root: &Path) -> StoreResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(root.join(LOCK_FILE))
        .map_err(|e| StoreError::Lock(format!("Failed to open lock file: {e}")))
}

/// Read and validate one record file
fn read_record(path: &Path) -> StoreResult<Option<ProcessingRecord>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(e.to_string())),
    };
    if metadata.len() > MAX_RECORD_FILE_SIZE {
        return Err(StoreError::RecordTooLarge {
            size: metadata.len(),
            max: MAX_RECORD_FILE_SIZE,
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let record: ProcessingRecord = serde_json::from_str(&contents).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to deserialize processing record");
        StoreError::Serialization(e.to_string())
    })?;

    if record.schema_version != SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            found_version = record.schema_version,
            expected_version = SCHEMA_VERSION,
            "Processing record schema version mismatch"
        );
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            found: record.schema_version,
        });
    }
    Ok(Some(record))
}

/// Atomically replace a record file
fn write_record(path: &Path, record: &ProcessingRecord) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| StoreError::Io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(json.as_bytes())
        .map_err(|e| StoreError::Io(format!("Failed to write temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| StoreError::Io(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| StoreError::Io(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::Io(format!("Failed to persist temp file: {e}")))?;

    // Make the rename durable
    if let Ok(dir) = File::open(parent_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[async_trait]
impl ProcessingStore for FileProcessingStore {
    async fn try_acquire(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        options: AcquireOptions,
    ) -> StoreResult<AcquireOutcome> {
        let fingerprint = fingerprint.clone();
        let owner = owner.to_string();
        self.locked(true, move |root, now| {
            let path = record_path(root, &fingerprint);
            let existing = read_record(&path)?;
            let (outcome, write) =
                decide_acquire(existing.as_ref(), &fingerprint, &owner, options, now);
            if let Some(record) = write {
                write_record(&path, &record)?;
            }
            debug!(fingerprint = %fingerprint, owner = %owner, result = outcome.label(), "try_acquire");
            Ok(outcome)
        })
        .await
    }

    async fn renew(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<ProcessingRecord> {
        let fingerprint = fingerprint.clone();
        let owner = owner.to_string();
        self.locked(true, move |root, now| {
            let path = record_path(root, &fingerprint);
            let next = apply_renew(read_record(&path)?.as_ref(), &fingerprint, &owner, ttl, now)?;
            write_record(&path, &next)?;
            Ok(next)
        })
        .await
    }

    async fn complete(
        &self,
        fingerprint: &ProductFingerprint,
        owner: &str,
        completion: Completion,
    ) -> StoreResult<ProcessingRecord> {
        let fingerprint = fingerprint.clone();
        let owner = owner.to_string();
        self.locked(true, move |root, now| {
            let path = record_path(root, &fingerprint);
            let next = apply_complete(
                read_record(&path)?.as_ref(),
                &fingerprint,
                &owner,
                completion,
                now,
            )?;
            write_record(&path, &next)?;
            Ok(next)
        })
        .await
    }

    async fn release(&self, fingerprint: &ProductFingerprint, owner: &str) -> StoreResult<()> {
        let fingerprint = fingerprint.clone();
        let owner = owner.to_string();
        self.locked(true, move |root, now| {
            let path = record_path(root, &fingerprint);
            if let Some(next) = apply_release(read_record(&path)?.as_ref(), &fingerprint, &owner, now)? {
                write_record(&path, &next)?;
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, fingerprint: &ProductFingerprint) -> StoreResult<Option<ProcessingRecord>> {
        let fingerprint = fingerprint.clone();
        self.locked(false, move |root, _| read_record(&record_path(root, &fingerprint)))
            .await
    }

    async fn list(&self) -> StoreResult<Vec<ProcessingRecord>> {
        self.locked(false, |root, _| {
            let entries = std::fs::read_dir(root.join(RECORDS_DIR))
                .map_err(|e| StoreError::Io(e.to_string()))?;

            let mut records = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| StoreError::Io(e.to_string()))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    // One unreadable file must not hide every other record
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
                }
            }
            records.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
            Ok(records)
        })
        .await
    }

    async fn forget(&self, fingerprint: &ProductFingerprint) -> StoreResult<bool> {
        let fingerprint = fingerprint.clone();
        self.locked(true, move |root, _| {
            match std::fs::remove_file(record_path(root, &fingerprint)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StoreError::Io(e.to_string())),
            }
        })
        .await
    }
}
