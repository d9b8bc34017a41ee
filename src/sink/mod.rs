pub mod file;
pub mod table;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::model::TargetKind;

pub use file::FileSink;
pub use table::TableSink;

/// Destination for extracted record rows.
///
/// Dialect-specific SQL and filesystem layout live behind this trait; the
/// orchestration core only sees the capability set.
#[async_trait]
pub trait Sink: Send + Sync {
    fn target_kind(&self) -> TargetKind;

    /// When true the incremental strategy is suppressed and every object is
    /// queried in full.
    fn recreate_tables(&self) -> bool {
        false
    }

    /// Destination-safe name for an object's table or file stem.
    fn sanitize_table_name(&self, object: &str) -> String {
        object.to_string()
    }

    /// Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Consume the object CSV the extract engine produced; returns rows
    /// written as the sink counted them.
    async fn write_data(&self, object: &str, csv_path: &Path, run_id: &str) -> Result<u64>;

    /// Watermark of the last confirmed write for this object, if the sink
    /// tracks one. Consulted by the incremental strategy.
    async fn last_backup_timestamp(&self, object: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record a confirmed write so the next run can go delta. Called only
    /// after `write_data` returns.
    async fn record_completion(&self, _object: &str, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    /// End-of-run hook (compression, connection teardown prep).
    async fn finalize(&self, _dest_root: &Path) -> Result<()> {
        Ok(())
    }
}
