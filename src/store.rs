//! Work-item store: the queue file and its mirrors.
//!
//! The queue lives in a single JSON array `[QueueState, WorkItem, ...]`.
//! Three paths are involved per run: the *working* file mutated live, the
//! *save* file mirrored after every change (what a resume restores from),
//! and the write-once *initial* snapshot kept for audit.
//!
//! Every write goes to a temp file in the same directory and is renamed
//! over the target, so a crash never leaves a half-written queue behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Payload, QueueSnapshot, QueueState, WorkItem};

/// Field rewritten in stored payloads when credentials are refreshed.
pub const REFRESH_TOKEN_FIELD: &str = "refreshToken";

/// Locations of the files that make up one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub working: PathBuf,
    pub save: PathBuf,
    pub initial: PathBuf,
}

impl StorePaths {
    /// `<dir>/<project>.json`, `<dir>/save_<project>.json`, and the initial
    /// snapshot next to the save file.
    pub fn for_project(dir: impl AsRef<Path>, project: &str) -> Self {
        let dir = dir.as_ref();
        Self::new(
            dir.join(format!("{project}.json")),
            dir.join(format!("save_{project}.json")),
        )
    }

    /// Derive the initial snapshot path as `initial_<save name>` beside `save`.
    pub fn new(working: impl Into<PathBuf>, save: impl Into<PathBuf>) -> Self {
        let save = save.into();
        let name = save
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue.json".to_string());
        let initial = save.with_file_name(format!("initial_{name}"));
        Self {
            working: working.into(),
            save,
            initial,
        }
    }
}

/// File-backed queue. Callers serialize access to `persist`; the store
/// itself holds no lock.
#[derive(Debug, Clone)]
pub struct WorkItemStore {
    paths: StorePaths,
}

impl WorkItemStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub async fn working_exists(&self) -> bool {
        tokio::fs::try_exists(&self.paths.working)
            .await
            .unwrap_or(false)
    }

    pub async fn save_exists(&self) -> bool {
        tokio::fs::try_exists(&self.paths.save).await.unwrap_or(false)
    }

    /// Build a fresh queue from `content`, numbering items 1, 2, 3, ... and
    /// overwriting any previous working file.
    pub async fn create(&self, content: Vec<Payload>) -> Result<QueueSnapshot> {
        if content.is_empty() {
            return Err(Error::EmptyQueue);
        }

        let items = content
            .into_iter()
            .zip(1u64..)
            .map(|(payload, identifier)| WorkItem::new(identifier, payload))
            .collect();
        let snapshot = QueueSnapshot {
            state: QueueState::default(),
            items,
        };

        if let Some(parent) = self.paths.working.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.persist(&snapshot.state, &snapshot.items).await?;

        info!(
            path = %self.paths.working.display(),
            items = snapshot.items.len(),
            "queue created"
        );
        Ok(snapshot)
    }

    /// Read and validate the working file.
    pub async fn load(&self) -> Result<QueueSnapshot> {
        read_queue(&self.paths.working).await
    }

    /// Read and validate the save file without touching the working file.
    pub async fn load_save(&self) -> Result<QueueSnapshot> {
        read_queue(&self.paths.save).await
    }

    /// Replace the working file with the given state and pending items.
    pub async fn persist(&self, state: &QueueState, items: &[WorkItem]) -> Result<()> {
        let bytes = encode(state, items)?;
        write_atomic(&self.paths.working, &bytes).await?;
        debug!(
            pending = items.len(),
            processed = state.nb_processed_items,
            "queue persisted"
        );
        Ok(())
    }

    /// Copy the working file to the save path.
    pub async fn mirror_to_save(&self) -> Result<()> {
        copy_atomic(&self.paths.working, &self.paths.save).await
    }

    /// Copy the working file to the initial snapshot path.
    pub async fn snapshot_initial(&self) -> Result<()> {
        copy_atomic(&self.paths.working, &self.paths.initial).await
    }

    /// Copy the save file back over the working file.
    pub async fn restore_from_save(&self) -> Result<()> {
        copy_atomic(&self.paths.save, &self.paths.working).await?;
        info!(
            from = %self.paths.save.display(),
            to = %self.paths.working.display(),
            "working file restored from save"
        );
        Ok(())
    }

    /// Substitute the `refreshToken` field of every stored payload.
    /// Returns how many payloads were updated.
    pub async fn refresh_token(&self, token: &str) -> Result<usize> {
        let mut snapshot = self.load().await?;
        let mut updated = 0;
        for item in &mut snapshot.items {
            if let Some(field) = item.payload.get_mut(REFRESH_TOKEN_FIELD) {
                *field = Value::String(token.to_string());
                updated += 1;
            }
        }
        self.persist(&snapshot.state, &snapshot.items).await?;
        info!(updated, "Token updated");
        Ok(updated)
    }

    /// Delete the working file only.
    pub async fn discard_working(&self) -> Result<()> {
        remove_if_exists(&self.paths.working).await
    }

    /// Delete the working and save files. Their absence marks a finished run.
    pub async fn remove_run_files(&self) -> Result<()> {
        remove_if_exists(&self.paths.working).await?;
        remove_if_exists(&self.paths.save).await
    }
}

fn encode(state: &QueueState, items: &[WorkItem]) -> Result<Vec<u8>> {
    let mut doc = Vec::with_capacity(items.len() + 1);
    doc.push(serde_json::to_value(state)?);
    for item in items {
        doc.push(serde_json::to_value(item)?);
    }
    Ok(serde_json::to_vec(&doc)?)
}

fn decode(path: &Path, bytes: &[u8]) -> Result<QueueSnapshot> {
    let corrupt = |reason: String| Error::CorruptQueue {
        path: path.to_path_buf(),
        reason,
    };

    let doc: Vec<Value> =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("not a JSON array: {e}")))?;
    let Some((head, rest)) = doc.split_first() else {
        return Err(corrupt("missing queue state head".to_string()));
    };

    let state: QueueState = serde_json::from_value(head.clone())
        .map_err(|e| corrupt(format!("bad queue state head: {e}")))?;
    if let Some(id) = state.duplicate_id() {
        return Err(corrupt(format!("identifier {id} processed twice")));
    }
    if state.nb_processed_items != state.processed_item_ids.len() as u64 {
        return Err(corrupt(format!(
            "nb_processed_items is {} but {} identifiers are recorded",
            state.nb_processed_items,
            state.processed_item_ids.len()
        )));
    }

    let mut items = Vec::with_capacity(rest.len());
    let mut pending_ids = HashSet::with_capacity(rest.len());
    for (index, value) in rest.iter().enumerate() {
        let item: WorkItem = serde_json::from_value(value.clone())
            .map_err(|e| corrupt(format!("bad work item at position {}: {e}", index + 1)))?;
        if state.is_processed(item.identifier) {
            return Err(corrupt(format!(
                "identifier {} is both pending and processed",
                item.identifier
            )));
        }
        if !pending_ids.insert(item.identifier) {
            return Err(corrupt(format!(
                "identifier {} is pending twice",
                item.identifier
            )));
        }
        items.push(item);
    }

    Ok(QueueSnapshot { state, items })
}

async fn read_queue(path: &Path) -> Result<QueueSnapshot> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::CorruptQueue {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    decode(path, &bytes)
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

/// Write `bytes` to `target` via a synced temp file and a rename.
async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(target);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, target).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn copy_atomic(from: &Path, to: &Path) -> Result<()> {
    let bytes = tokio::fs::read(from).await?;
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomic(to, &bytes).await
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
