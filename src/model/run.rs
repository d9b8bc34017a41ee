use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    File,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Terminal outcome of one object within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Completed,
    Failed,
    Skipped,
}

/// Per-object result appended to the run when its task reaches a terminal
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectBackupResult {
    pub object_name: String,
    pub status: ObjectStatus,
    pub record_count: u64,
    pub byte_count: u64,
    pub duration_ms: u64,

    /// Lower bound for the next delta query; set on Completed only.
    pub watermark: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub warning: Option<String>,
}

impl ObjectBackupResult {
    pub fn completed(
        object_name: impl Into<String>,
        record_count: u64,
        byte_count: u64,
        duration_ms: u64,
        watermark: DateTime<Utc>,
    ) -> Self {
        Self {
            object_name: object_name.into(),
            status: ObjectStatus::Completed,
            record_count,
            byte_count,
            duration_ms,
            watermark: Some(watermark),
            error: None,
            warning: None,
        }
    }

    pub fn failed(object_name: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            object_name: object_name.into(),
            status: ObjectStatus::Failed,
            record_count: 0,
            byte_count: 0,
            duration_ms,
            watermark: None,
            error: Some(error.into()),
            warning: None,
        }
    }

    pub fn skipped(object_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            object_name: object_name.into(),
            status: ObjectStatus::Skipped,
            record_count: 0,
            byte_count: 0,
            duration_ms: 0,
            watermark: None,
            error: Some(reason.into()),
            warning: None,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

/// One backup run, opened at start and closed on finish or cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub username: String,
    pub kind: RunKind,
    pub target_kind: TargetKind,
    pub destination: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub results: Vec<ObjectBackupResult>,
}

impl BackupRun {
    pub fn open(
        username: impl Into<String>,
        kind: RunKind,
        target_kind: TargetKind,
        destination: impl Into<String>,
    ) -> Self {
        let started_at = Utc::now();
        let id = format!(
            "run_{}_{:03}",
            started_at.format("%Y%m%d_%H%M%S"),
            started_at.timestamp_subsec_millis()
        );
        Self {
            id,
            username: username.into(),
            kind,
            target_kind,
            destination: destination.into(),
            started_at,
            finished_at: None,
            status: RunStatus::InProgress,
            results: Vec::new(),
        }
    }

    pub fn close(&mut self, status: RunStatus) {
        self.finished_at = Some(Utc::now());
        self.status = status;
    }

    pub fn completed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ObjectStatus::Completed)
            .count()
    }

    pub fn failed_or_skipped_count(&self) -> usize {
        self.results.len() - self.completed_count()
    }

    /// Process exit code contract: 0 all objects completed, 2 partial
    /// failure, 3 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Cancelled => 3,
            RunStatus::Failed => 4,
            _ if self.failed_or_skipped_count() > 0 => 2,
            _ => 0,
        }
    }
}
