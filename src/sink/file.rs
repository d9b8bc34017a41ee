use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::model::TargetKind;

use super::Sink;

/// Filesystem sink: CSVs stay where the extract engine wrote them; this sink
/// confirms row counts and optionally replaces the loose CSVs with one zip
/// archive at end of run.
pub struct FileSink {
    compress: bool,
}

impl FileSink {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn target_kind(&self) -> TargetKind {
        TargetKind::File
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn write_data(&self, object: &str, csv_path: &Path, _run_id: &str) -> Result<u64> {
        let path = csv_path.to_path_buf();
        let object = object.to_string();

        tokio::task::spawn_blocking(move || {
            let rows = csv_row_count(&path)?;

            // The naive count is wrong on quoted newlines; the CSV-aware
            // count is authoritative and a divergence only warns.
            let fast = fast_line_count(&path)?;
            if fast != rows {
                warn!(
                    "{}: line count {} diverges from CSV row count {} (quoted newlines)",
                    object, fast, rows
                );
            }

            Ok(rows)
        })
        .await
        .context("Row count task panicked")?
    }

    async fn last_backup_timestamp(&self, _object: &str) -> Result<Option<DateTime<Utc>>> {
        // File mode watermarks come from the run history, not the sink.
        Ok(None)
    }

    async fn finalize(&self, dest_root: &Path) -> Result<()> {
        if !self.compress {
            return Ok(());
        }
        let root = dest_root.to_path_buf();
        tokio::task::spawn_blocking(move || compress_output(&root))
            .await
            .context("Compression task panicked")?
    }
}

/// CSV-aware data-row count (header excluded).
pub fn csv_row_count(path: &Path) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = 0u64;
    for record in reader.records() {
        record.context("Failed to read CSV record")?;
        rows += 1;
    }
    Ok(rows)
}

/// Naive `lines - 1` count; undercounts quoted newlines by design.
pub fn fast_line_count(path: &Path) -> Result<u64> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let lines = std::io::BufReader::new(file).lines().count() as u64;
    Ok(lines.saturating_sub(1))
}

/// Replace the loose object CSVs under `dest_root` with one Deflate archive.
fn compress_output(dest_root: &Path) -> Result<()> {
    let mut csv_files: Vec<PathBuf> = std::fs::read_dir(dest_root)
        .context("Failed to read output directory")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    csv_files.sort();

    if csv_files.is_empty() {
        debug!("No CSVs to compress in {}", dest_root.display());
        return Ok(());
    }

    let archive_name = format!("backup_{}.zip", Utc::now().format("%Y%m%d_%H%M%S"));
    let archive_path = dest_root.join(&archive_name);

    let file = std::fs::File::create(&archive_path)
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for csv_path in &csv_files {
        let name = csv_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("CSV file name is not valid UTF-8")?;

        writer.start_file(name, options)?;
        let bytes = std::fs::read(csv_path)
            .with_context(|| format!("Failed to read {}", csv_path.display()))?;
        writer.write_all(&bytes)?;
    }

    writer.finish().context("Failed to finish archive")?;

    for csv_path in &csv_files {
        std::fs::remove_file(csv_path)
            .with_context(|| format!("Failed to remove {}", csv_path.display()))?;
    }

    info!(
        "Compressed {} CSVs into {}",
        csv_files.len(),
        archive_path.display()
    );
    Ok(())
}
