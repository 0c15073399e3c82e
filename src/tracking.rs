//! Per-item audit trail.
//!
//! The driver only ever upserts string fields keyed by item identifier.
//! [`JsonTrackingFile`] keeps them in a JSON object on disk;
//! [`MemoryTracking`] keeps them in memory. [`FailureLog`] is the separate
//! human-readable dump of every failed item.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::WorkItem;

/// Field names written by the driver.
pub mod fields {
    pub const EXECUTION_REQUESTED: &str = "execution_requested";
    pub const EXECUTION_ID: &str = "execution_id";
    pub const EXECUTION_WORKFLOW_ID: &str = "execution_workflow_id";
    pub const EXECUTION_START_TIME: &str = "execution_start_time";
    pub const EXECUTION_END_TIME: &str = "execution_end_time";
    pub const EXECUTION_STATUS: &str = "execution_status";
    pub const EXECUTION_ERROR: &str = "execution_error";
}

/// Timestamp format used in tracking records.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub type TrackingFields = BTreeMap<String, String>;

/// Current local time formatted for a tracking record.
pub fn now_stamp() -> String {
    chrono::Local::now().format(TIME_FORMAT).to_string()
}

/// Upsert-by-identifier sink.
#[async_trait]
pub trait TrackingSink: Send + Sync {
    /// Merge `fields` into the record for `identifier`, creating it if needed.
    async fn record(&self, identifier: u64, fields: TrackingFields) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

type Rows = BTreeMap<u64, TrackingFields>;

/// Tracking records stored as `{"<identifier>": {"field": "value", ...}}`.
///
/// Each upsert is a full read-modify-write of the file under an internal lock.
pub struct JsonTrackingFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonTrackingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records currently on disk. A missing file reads as empty.
    pub async fn rows(&self) -> Result<BTreeMap<u64, TrackingFields>> {
        let _guard = self.lock.lock().await;
        self.read_rows().await
    }

    async fn read_rows(&self) -> Result<Rows> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Rows::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Other(format!(
                    "tracking file {} is unreadable: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Rows::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TrackingSink for JsonTrackingFile {
    async fn record(&self, identifier: u64, fields: TrackingFields) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows().await?;
        rows.entry(identifier).or_default().extend(fields);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&rows)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(identifier, "tracking record updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTracking {
    rows: Mutex<Rows>,
}

impl MemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, identifier: u64) -> Option<TrackingFields> {
        self.rows.lock().await.get(&identifier).cloned()
    }

    pub async fn rows(&self) -> BTreeMap<u64, TrackingFields> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl TrackingSink for MemoryTracking {
    async fn record(&self, identifier: u64, fields: TrackingFields) -> Result<()> {
        self.rows
            .lock()
            .await
            .entry(identifier)
            .or_default()
            .extend(fields);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Failure log
// ---------------------------------------------------------------------------

/// Append-only text file receiving the message, details and full item of
/// every failed execution.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(
        &self,
        item: &WorkItem,
        message: &str,
        details: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut block = format!("\n\n\n\n{message}\n");
        if let Some(details) = details {
            block.push_str(details);
            block.push('\n');
        }
        block.push_str(&serde_json::to_string_pretty(item)?);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(block.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
