use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column, Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

use crate::extract::blobs::{blob_field, blob_relative_path, BLOB_PATH_COLUMN};
use crate::model::TargetKind;

use super::Sink;

/// Metadata table driving delta decisions for the relational sink.
const META_TABLE: &str = "_backup_runs";

/// Relational warehouse sink.
///
/// One table per object, all columns TEXT, names sanitized for the dialect.
/// Recreate mode drops and rebuilds each table from the CSV header; append
/// mode creates missing tables and inserts on top. An internal
/// `_backup_runs` table tracks the last confirmed write per table.
pub struct TableSink {
    url: String,
    recreate: bool,
    pool: tokio::sync::OnceCell<SqlitePool>,
}

impl TableSink {
    pub fn new(url: impl Into<String>, recreate: bool) -> Self {
        Self {
            url: url.into(),
            recreate,
            pool: tokio::sync::OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect(&self.url)
                    .await
                    .with_context(|| format!("Failed to connect to {}", self.url))?;

                sqlx::query(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (table_name TEXT PRIMARY KEY, last_completed_at TEXT NOT NULL)",
                    META_TABLE
                ))
                .execute(&pool)
                .await
                .context("Failed to create metadata table")?;

                debug!("Connected table sink: {}", self.url);
                Ok(pool)
            })
            .await
    }

    /// Dump one object table back out as CSV (restore-from-database path).
    pub async fn export_csv(&self, object: &str, dest_path: &Path) -> Result<u64> {
        let pool = self.pool().await?;
        let table = self.sanitize_table_name(object);

        let rows = sqlx::query(&format!("SELECT * FROM \"{}\"", table))
            .fetch_all(pool)
            .await
            .with_context(|| format!("Failed to read table {}", table))?;

        let mut writer = csv::Writer::from_path(dest_path)
            .with_context(|| format!("Failed to create {}", dest_path.display()))?;

        let mut exported = 0u64;
        if let Some(first) = rows.first() {
            let headers: Vec<String> =
                first.columns().iter().map(|c| c.name().to_string()).collect();
            writer.write_record(&headers)?;

            for row in &rows {
                let mut record = Vec::with_capacity(headers.len());
                for i in 0..headers.len() {
                    let value: Option<String> = row.try_get(i)?;
                    record.push(value.unwrap_or_default());
                }
                writer.write_record(&record)?;
                exported += 1;
            }
        }
        writer.flush()?;
        Ok(exported)
    }
}

#[async_trait]
impl Sink for TableSink {
    fn target_kind(&self) -> TargetKind {
        TargetKind::Database
    }

    fn recreate_tables(&self) -> bool {
        self.recreate
    }

    fn sanitize_table_name(&self, object: &str) -> String {
        let mut name: String = object
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            name.insert(0, '_');
        }
        if name.is_empty() {
            name.push('_');
        }
        name
    }

    async fn connect(&self) -> Result<()> {
        self.pool().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn write_data(&self, object: &str, csv_path: &Path, _run_id: &str) -> Result<u64> {
        let (mut headers, rows) = {
            let path = csv_path.to_path_buf();
            tokio::task::spawn_blocking(move || read_csv_rows(&path))
                .await
                .context("CSV read task panicked")??
        };

        // Blob catalog objects carry the sidecar file path as an extra column.
        let blob_id_index = match blob_field(object) {
            Some(_) => {
                let id_index = headers.iter().position(|h| h.eq_ignore_ascii_case("Id"));
                if id_index.is_some() {
                    headers.push(BLOB_PATH_COLUMN.to_string());
                }
                id_index
            }
            None => None,
        };

        if headers.is_empty() {
            bail!("CSV for {} has no header row", object);
        }

        let pool = self.pool().await?;
        let table = self.sanitize_table_name(object);

        if self.recreate {
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
                .execute(pool)
                .await
                .with_context(|| format!("Failed to drop table {}", table))?;
        }

        let column_defs: Vec<String> = headers
            .iter()
            .map(|h| format!("\"{}\" TEXT", self.sanitize_table_name(h)))
            .collect();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            table,
            column_defs.join(", ")
        ))
        .execute(pool)
        .await
        .with_context(|| format!("Failed to create table {}", table))?;

        let placeholders = vec!["?"; headers.len()].join(", ");
        let insert_sql = format!("INSERT INTO \"{}\" VALUES ({})", table, placeholders);

        // One transaction per object; workers never share a table.
        let mut tx = pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let mut query = sqlx::query(&insert_sql);
            for value in &row {
                query = query.bind(value);
            }
            if let Some(id_index) = blob_id_index {
                let id = row.get(id_index).cloned().unwrap_or_default();
                let blob_path = blob_relative_path(object, &id);
                query = query.bind(blob_path.to_string_lossy().to_string());
            }
            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert into {}", table))?;
            written += 1;
        }
        tx.commit().await?;

        info!("{}: wrote {} rows into table {}", object, written, table);
        Ok(written)
    }

    async fn last_backup_timestamp(&self, object: &str) -> Result<Option<DateTime<Utc>>> {
        let pool = self.pool().await?;
        let table = self.sanitize_table_name(object);

        let row = sqlx::query(&format!(
            "SELECT last_completed_at FROM {} WHERE table_name = ?",
            META_TABLE
        ))
        .bind(&table)
        .fetch_optional(pool)
        .await
        .context("Failed to read backup metadata")?;

        match row {
            Some(row) => {
                let raw: String = row.try_get(0)?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("Malformed watermark for {}: {}", table, raw))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn record_completion(&self, object: &str, at: DateTime<Utc>) -> Result<()> {
        let pool = self.pool().await?;
        let table = self.sanitize_table_name(object);

        sqlx::query(&format!(
            "INSERT INTO {} (table_name, last_completed_at) VALUES (?, ?) \
             ON CONFLICT(table_name) DO UPDATE SET last_completed_at = excluded.last_completed_at",
            META_TABLE
        ))
        .bind(&table)
        .bind(at.to_rfc3339())
        .execute(pool)
        .await
        .context("Failed to record backup completion")?;
        Ok(())
    }
}

fn read_csv_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        let mut row: Vec<String> = record.iter().map(|v| v.to_string()).collect();
        // Flexible CSVs may come up short; pad so every insert binds fully.
        row.resize(headers.len(), String::new());
        rows.push(row);
    }
    Ok((headers, rows))
}
