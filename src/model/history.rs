use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::run::{BackupRun, ObjectStatus, RunStatus};

/// Current history schema version for migrations
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

/// Root history structure persisted to disk
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunHistory {
    /// Schema version for future migrations
    pub version: u32,

    /// All recorded runs, oldest first
    pub runs: Vec<BackupRun>,

    /// Last time history was updated
    pub last_updated: DateTime<Utc>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self {
            version: HISTORY_SCHEMA_VERSION,
            runs: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Insert a run, or replace the entry with the same id.
    pub fn upsert_run(&mut self, run: BackupRun) {
        if let Some(existing) = self.runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run;
        } else {
            self.runs.push(run);
        }
        self.last_updated = Utc::now();
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only run history with atomic persistence.
///
/// Writes go through a temp file, fsync, then rename, serialized by a save
/// mutex so concurrent updates never interleave on disk.
pub struct HistoryStore {
    history: Arc<RwLock<RunHistory>>,
    history_path: PathBuf,
    save_mutex: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub async fn new(history_path: PathBuf) -> Result<Self> {
        let history = if history_path.exists() {
            Self::load(&history_path).await?
        } else {
            debug!("No existing history found, starting empty");
            RunHistory::new()
        };

        Ok(Self {
            history: Arc::new(RwLock::new(history)),
            history_path,
            save_mutex: Arc::new(Mutex::new(())),
        })
    }

    async fn load(path: &Path) -> Result<RunHistory> {
        debug!("Loading run history from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read history file")?;

        let history: RunHistory =
            serde_json::from_str(&content).context("Failed to parse history file")?;

        debug!("Loaded history with {} runs", history.runs.len());
        Ok(history)
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, RunHistory> {
        self.history.read().await
    }

    /// Record a run (new or updated) and persist.
    pub async fn record_run(&self, run: BackupRun) -> Result<()> {
        let _save_guard = self.save_mutex.lock().await;

        let snapshot = {
            let mut history = self.history.write().await;
            history.upsert_run(run);
            history.clone()
        }; // Write lock released here

        self.save_atomic(&snapshot).await
    }

    /// Watermark of the most recent Completed run that completed `object`
    /// for `username`. Used by the incremental strategy in file mode.
    pub async fn last_completed_watermark(
        &self,
        username: &str,
        object: &str,
    ) -> Option<DateTime<Utc>> {
        let history = self.history.read().await;

        history
            .runs
            .iter()
            .rev()
            .filter(|run| run.username == username && run.status == RunStatus::Completed)
            .find_map(|run| {
                run.results
                    .iter()
                    .find(|r| r.object_name == object && r.status == ObjectStatus::Completed)
                    .and_then(|r| r.watermark)
            })
    }

    async fn save_atomic(&self, history: &RunHistory) -> Result<()> {
        let temp_path = self.history_path.with_extension("tmp");

        debug!("Saving history atomically to: {}", self.history_path.display());

        // 1. Write to temporary file
        let json =
            serde_json::to_string_pretty(history).context("Failed to serialize history")?;

        tokio::fs::write(&temp_path, &json)
            .await
            .context("Failed to write temporary history file")?;

        // 2. fsync temporary file
        let temp_file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await?;

        temp_file
            .sync_all()
            .await
            .context("Failed to sync temporary history file")?;

        drop(temp_file);

        // 3. Atomic rename
        tokio::fs::rename(&temp_path, &self.history_path)
            .await
            .context("Failed to rename temporary history file")?;

        Ok(())
    }
}
