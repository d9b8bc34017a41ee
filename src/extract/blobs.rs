use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::TenantClient;

/// Directory under the output root holding raw blob bodies.
pub const BLOB_DIR: &str = "_blobs";

/// Column added to relational sinks pointing at the downloaded blob file.
pub const BLOB_PATH_COLUMN: &str = "BLOB_FILE_PATH";

/// Catalog of objects carrying a binary field worth a sidecar download.
pub const BLOB_FIELDS: &[(&str, &str)] = &[
    ("Attachment", "Body"),
    ("ContentVersion", "VersionData"),
    ("ContentNote", "Content"),
    ("EventLogFile", "LogFile"),
    ("MobileApplicationDetail", "ApplicationBinary"),
    ("ApexClass", "Body"),
    ("ApexTrigger", "Body"),
    ("ApexPage", "Body"),
    ("ApexComponent", "Body"),
    ("StaticResource", "Body"),
    ("Document", "Body"),
];

/// Binary field for an object, if it is in the sidecar catalog.
pub fn blob_field(object: &str) -> Option<&'static str> {
    BLOB_FIELDS
        .iter()
        .find(|(name, _)| *name == object)
        .map(|(_, field)| *field)
}

/// Where one record's blob lands relative to the output root.
pub fn blob_relative_path(object: &str, record_id: &str) -> PathBuf {
    PathBuf::from(BLOB_DIR).join(object).join(record_id)
}

/// Downloads binary bodies for every row of an already-written object CSV.
///
/// Runs only after the CSV is closed; individual blob failures are logged
/// and skipped so one bad record never sinks the object.
pub struct BlobDownloader {
    client: Arc<TenantClient>,
}

impl BlobDownloader {
    pub fn new(client: Arc<TenantClient>) -> Self {
        Self { client }
    }

    /// Fetch all blobs for `object`, returning how many were written.
    pub async fn download_all(
        &self,
        object: &str,
        field: &str,
        csv_path: &Path,
        dest_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let ids = read_id_column(csv_path)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let blob_dir = dest_root.join(BLOB_DIR).join(object);
        tokio::fs::create_dir_all(&blob_dir)
            .await
            .context("Failed to create blob directory")?;

        let mut written = 0u64;
        for id in ids {
            if cancel.is_cancelled() {
                debug!("{}: blob download cancelled after {} files", object, written);
                break;
            }

            match self.client.get_blob(object, &id, field).await {
                Ok(bytes) => {
                    tokio::fs::write(blob_dir.join(&id), &bytes)
                        .await
                        .with_context(|| format!("Failed to write blob for {}", id))?;
                    written += 1;
                }
                Err(e) => {
                    warn!("Failed to fetch blob {}/{}: {}", object, id, e);
                }
            }
        }

        debug!("{}: downloaded {} blobs", object, written);
        Ok(written)
    }
}

/// Read the `Id` column of an object CSV.
pub fn read_id_column(csv_path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let id_index = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .position(|h| h.eq_ignore_ascii_case("Id"));

    let Some(id_index) = id_index else {
        return Ok(Vec::new());
    };

    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        if let Some(id) = record.get(id_index) {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    Ok(ids)
}
