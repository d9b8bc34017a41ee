use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{BulkJobState, IngestOperation, TenantClient};
use crate::config::models::{RestoreMode, UnresolvedReferencePolicy};
use crate::model::ObjectDescriptor;
use crate::relationships::RelationshipAnalyzer;

use super::mapping::IdMapping;
use super::order::{self, LookupEdge};
use super::transform::TransformConfig;

/// Rows shown per object in a dry-run preview.
pub const DRY_RUN_PREVIEW_ROWS: usize = 10;

const INITIAL_POLL_DELAY: Duration = Duration::from_secs(1);
const MAX_POLL_DELAY: Duration = Duration::from_secs(30);

/// Options for one restore run.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    pub batch_size: usize,
    pub stop_on_error: bool,
    pub validate_before_restore: bool,
    pub preserve_ids: bool,
    pub dry_run: bool,
    pub unresolved_references: UnresolvedReferencePolicy,
    /// Concurrent batches within one object.
    pub ingest_fanout: usize,
    pub transform: TransformConfig,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            mode: RestoreMode::Insert,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            stop_on_error: false,
            validate_before_restore: false,
            preserve_ids: false,
            dry_run: false,
            unresolved_references: UnresolvedReferencePolicy::DropField,
            ingest_fanout: crate::config::DEFAULT_INGEST_FANOUT,
            transform: TransformConfig::default(),
        }
    }
}

impl RestoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.ingest_fanout == 0 {
            bail!("ingest_fanout must be at least 1");
        }
        if let RestoreMode::Upsert { external_id_field } = &self.mode {
            if external_id_field.is_empty() {
                bail!("upsert mode requires an external id field");
            }
        }
        Ok(())
    }

    fn operation(&self) -> IngestOperation {
        match self.mode {
            RestoreMode::Insert => IngestOperation::Insert,
            RestoreMode::Upsert { .. } => IngestOperation::Upsert,
            RestoreMode::Update => IngestOperation::Update,
        }
    }

    fn external_id_field(&self) -> Option<&str> {
        match &self.mode {
            RestoreMode::Upsert { external_id_field } => Some(external_id_field),
            _ => None,
        }
    }
}

/// One source dataset: an object CSV from a backup directory (or a table
/// export produced by the relational sink).
#[derive(Debug, Clone)]
pub struct RestoreDataset {
    pub object: String,
    pub csv_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectRestoreResult {
    pub object: String,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred_rows: u64,
    pub batches: u64,
    pub errors: Vec<String>,
}

/// Per-object dry-run preview: transformed rows with references resolved,
/// plus the call estimate.
#[derive(Debug, Clone)]
pub struct DryRunPreview {
    pub object: String,
    pub total_rows: u64,
    pub estimated_api_calls: u64,
    pub would_defer: u64,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub dropped_fields: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub order: Vec<String>,
    pub objects: Vec<ObjectRestoreResult>,
    pub deferred_updates_applied: u64,
    pub dry_run: bool,
    pub previews: Vec<DryRunPreview>,
    pub cancelled: bool,
    pub stopped_on_error: bool,
}

impl RestoreReport {
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            3
        } else if self.stopped_on_error || self.objects.iter().any(|o| o.failed > 0) {
            2
        } else {
            0
        }
    }
}

/// A lookup value nulled during insert, to be set by the update pass.
#[derive(Debug, Clone)]
struct PendingReference {
    object: String,
    old_id: String,
    field: String,
    parent: String,
    old_parent_ref: String,
}

/// A row held back because a reference had no mapping yet.
#[derive(Debug, Clone)]
struct HeldRow {
    old_id: Option<String>,
    row: Vec<String>,
}

struct LoadedDataset {
    object: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Applies source datasets to a target tenant over the Bulk ingest API in
/// dependency order, remapping relationship fields through the run's id
/// mapping.
pub struct RestoreEngine {
    client: Arc<TenantClient>,
    analyzer: Arc<RelationshipAnalyzer>,
    mapping: Arc<IdMapping>,
}

impl RestoreEngine {
    pub fn new(client: Arc<TenantClient>) -> Self {
        let analyzer = Arc::new(RelationshipAnalyzer::new(client.clone()));
        Self {
            client,
            analyzer,
            mapping: Arc::new(IdMapping::new()),
        }
    }

    pub fn mapping(&self) -> &Arc<IdMapping> {
        &self.mapping
    }

    /// Execute (or, with `dry_run`, preview) a restore.
    pub async fn execute(
        &self,
        datasets: Vec<RestoreDataset>,
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        options.validate()?;
        if datasets.is_empty() {
            bail!("Restore needs at least one dataset");
        }

        let mut descriptors: HashMap<String, ObjectDescriptor> = HashMap::new();
        for dataset in &datasets {
            let describe = self
                .analyzer
                .describe_cached(&dataset.object)
                .await
                .with_context(|| format!("Cannot describe target object {}", dataset.object))?;
            descriptors.insert(
                dataset.object.clone(),
                ObjectDescriptor::from_describe(&describe),
            );
        }

        let mut loaded: HashMap<String, LoadedDataset> = HashMap::new();
        for dataset in datasets {
            let path = dataset.csv_path.clone();
            let (headers, rows) = tokio::task::spawn_blocking(move || read_csv(&path))
                .await
                .context("Dataset read task panicked")??;
            loaded.insert(
                dataset.object.clone(),
                LoadedDataset {
                    object: dataset.object,
                    headers,
                    rows,
                },
            );
        }

        if options.validate_before_restore {
            preflight(&loaded, &descriptors)?;
        }

        // Lookup graph over the selected objects only.
        let selected: HashSet<String> = loaded.keys().cloned().collect();
        let mut lookups: HashMap<String, Vec<LookupEdge>> = HashMap::new();
        for (object, dataset) in &loaded {
            let descriptor = &descriptors[object];
            let mut edges = Vec::new();
            for field in descriptor.reference_fields() {
                if !dataset.headers.iter().any(|h| h == &field.name) {
                    continue;
                }
                if let Some(parent) =
                    field.reference_to.iter().find(|p| selected.contains(*p))
                {
                    edges.push(LookupEdge {
                        field: field.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            lookups.insert(object.clone(), edges);
        }

        let plan = order::plan(&lookups);
        info!("Restore order: {}", plan.order.join(" -> "));

        let mut report = RestoreReport {
            order: plan.order.clone(),
            dry_run: options.dry_run,
            ..RestoreReport::default()
        };
        let mut pending_references: Vec<PendingReference> = Vec::new();

        for object in &plan.order {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let dataset = &loaded[object];
            let deferred_fields: HashMap<&str, &str> = plan
                .deferred
                .iter()
                .filter(|d| &d.object == object)
                .map(|d| (d.field.as_str(), d.parent.as_str()))
                .collect();
            let resolvable: Vec<&LookupEdge> = lookups[object]
                .iter()
                .filter(|e| !deferred_fields.contains_key(e.field.as_str()))
                .collect();

            let (result, preview) = self
                .process_object(
                    dataset,
                    &deferred_fields,
                    &resolvable,
                    options,
                    cancel,
                    &mut pending_references,
                )
                .await;

            let failed = result.failed;
            report.objects.push(result);
            if let Some(preview) = preview {
                report.previews.push(preview);
            }

            if options.stop_on_error && failed > 0 {
                warn!("{}: failures with stop_on_error set, halting restore", object);
                report.stopped_on_error = true;
                break;
            }
        }

        if !options.dry_run && !report.cancelled && !report.stopped_on_error {
            report.deferred_updates_applied = self
                .apply_deferred_references(&pending_references, options, cancel)
                .await;
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
        }

        Ok(report)
    }

    /// Transform, resolve, batch, and submit one object's rows.
    async fn process_object(
        &self,
        dataset: &LoadedDataset,
        deferred_fields: &HashMap<&str, &str>,
        resolvable: &[&LookupEdge],
        options: &RestoreOptions,
        cancel: &CancellationToken,
        pending_references: &mut Vec<PendingReference>,
    ) -> (ObjectRestoreResult, Option<DryRunPreview>) {
        let object = &dataset.object;
        let mut result = ObjectRestoreResult {
            object: object.clone(),
            ..ObjectRestoreResult::default()
        };

        let id_index = dataset
            .headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case("Id"));

        // Insert and upsert uploads cannot carry Id unless ids are preserved.
        let drop_id = id_index.is_some()
            && !options.preserve_ids
            && !matches!(options.mode, RestoreMode::Update);
        let output_headers: Vec<String> = dataset
            .headers
            .iter()
            .enumerate()
            .filter(|(i, _)| !(drop_id && Some(*i) == id_index))
            .map(|(_, h)| h.clone())
            .collect();
        let dropped_fields: Vec<String> = if drop_id {
            vec!["Id".to_string()]
        } else {
            Vec::new()
        };

        let mut output_rows: Vec<Vec<String>> = Vec::new();
        let mut output_old_ids: Vec<Option<String>> = Vec::new();
        let mut held_rows: Vec<HeldRow> = Vec::new();

        for source_row in &dataset.rows {
            let mut row = source_row.clone();
            row.resize(dataset.headers.len(), String::new());
            let old_id = id_index.and_then(|i| {
                let id = &row[i];
                (!id.is_empty()).then(|| id.clone())
            });

            options.transform.apply(&dataset.headers, &mut row);

            // Cyclic lookups are nulled now and set by the update pass.
            for (i, header) in dataset.headers.iter().enumerate() {
                if let Some(parent) = deferred_fields.get(header.as_str()) {
                    if !row[i].is_empty() {
                        if let Some(old_id) = &old_id {
                            pending_references.push(PendingReference {
                                object: object.clone(),
                                old_id: old_id.clone(),
                                field: header.clone(),
                                parent: parent.to_string(),
                                old_parent_ref: row[i].clone(),
                            });
                        }
                        row[i].clear();
                    }
                }
            }

            // Resolve remaining lookups through the id mapping. Held rows
            // keep their pre-resolution values so the retry starts clean.
            let pre_resolve = matches!(
                options.unresolved_references,
                UnresolvedReferencePolicy::DeferRow
            )
            .then(|| row.clone());

            let mut hold = false;
            for edge in resolvable {
                let Some(i) = dataset.headers.iter().position(|h| h == &edge.field) else {
                    continue;
                };
                if row[i].is_empty() {
                    continue;
                }
                match self.resolve_reference(&edge.parent, &row[i], options) {
                    Some(new_id) => row[i] = new_id,
                    None => match options.unresolved_references {
                        UnresolvedReferencePolicy::DropField => row[i].clear(),
                        UnresolvedReferencePolicy::DeferRow => {
                            hold = true;
                            break;
                        }
                    },
                }
            }
            if hold {
                held_rows.push(HeldRow {
                    old_id,
                    row: pre_resolve.unwrap_or(row),
                });
                continue;
            }

            // Update mode rows must land on a target id.
            if matches!(options.mode, RestoreMode::Update) && !options.preserve_ids {
                let Some(i) = id_index else {
                    result.failed += 1;
                    result.errors.push("row has no Id column".to_string());
                    continue;
                };
                match self.mapping.resolve(object, &row[i]) {
                    Some(new_id) => row[i] = new_id,
                    None => {
                        result.failed += 1;
                        result
                            .errors
                            .push(format!("no target id for {}", row[i]));
                        continue;
                    }
                }
            }

            let output: Vec<String> = row
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !(drop_id && Some(*i) == id_index))
                .map(|(_, v)| v)
                .collect();
            output_rows.push(output);
            output_old_ids.push(old_id);
        }

        result.deferred_rows = held_rows.len() as u64;

        if options.dry_run {
            let total = output_rows.len() as u64 + result.deferred_rows;
            let preview = DryRunPreview {
                object: object.clone(),
                total_rows: total,
                estimated_api_calls: total.div_ceil(options.batch_size as u64),
                would_defer: result.deferred_rows,
                headers: output_headers,
                rows: output_rows
                    .iter()
                    .take(DRY_RUN_PREVIEW_ROWS)
                    .cloned()
                    .collect(),
                dropped_fields,
            };
            return (result, Some(preview));
        }

        self.submit_rows(
            object,
            &output_headers,
            output_rows,
            output_old_ids,
            options,
            cancel,
            &mut result,
        )
        .await;

        // One late attempt for held rows now that earlier loads may have
        // filled the mapping; still-unresolved references are dropped.
        if !held_rows.is_empty() && !cancel.is_cancelled() {
            let mut retry_rows = Vec::new();
            let mut retry_old_ids = Vec::new();
            for held in held_rows {
                let mut row = held.row;
                for edge in resolvable {
                    let Some(i) = dataset.headers.iter().position(|h| h == &edge.field) else {
                        continue;
                    };
                    if row[i].is_empty() {
                        continue;
                    }
                    match self.resolve_reference(&edge.parent, &row[i], options) {
                        Some(new_id) => row[i] = new_id,
                        None => row[i].clear(),
                    }
                }

                // Update mode rows must land on a target id.
                if matches!(options.mode, RestoreMode::Update) && !options.preserve_ids {
                    let Some(i) = id_index else {
                        result.failed += 1;
                        result.errors.push("row has no Id column".to_string());
                        continue;
                    };
                    match self.mapping.resolve(object, &row[i]) {
                        Some(new_id) => row[i] = new_id,
                        None => {
                            result.failed += 1;
                            result.errors.push(format!("no target id for {}", row[i]));
                            continue;
                        }
                    }
                }

                let output: Vec<String> = row
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !(drop_id && Some(*i) == id_index))
                    .map(|(_, v)| v)
                    .collect();
                retry_rows.push(output);
                retry_old_ids.push(held.old_id);
            }
            self.submit_rows(
                object,
                &output_headers,
                retry_rows,
                retry_old_ids,
                options,
                cancel,
                &mut result,
            )
            .await;
        }

        (result, None)
    }

    fn resolve_reference(
        &self,
        parent: &str,
        old_value: &str,
        options: &RestoreOptions,
    ) -> Option<String> {
        if options.preserve_ids {
            return Some(old_value.to_string());
        }
        self.mapping.resolve(parent, old_value)
    }

    /// Chunk rows into batches and submit with bounded fan-out; all batch
    /// results are collected before the caller moves to dependent objects.
    #[allow(clippy::too_many_arguments)]
    async fn submit_rows(
        &self,
        object: &str,
        headers: &[String],
        rows: Vec<Vec<String>>,
        old_ids: Vec<Option<String>>,
        options: &RestoreOptions,
        cancel: &CancellationToken,
        result: &mut ObjectRestoreResult,
    ) {
        if rows.is_empty() {
            return;
        }

        let batches: Vec<(Vec<Vec<String>>, Vec<Option<String>>)> = rows
            .chunks(options.batch_size)
            .zip(old_ids.chunks(options.batch_size))
            .map(|(rows, ids)| (rows.to_vec(), ids.to_vec()))
            .collect();

        let outcomes: Vec<BatchOutcome> = stream::iter(batches)
            .map(|(batch_rows, batch_old_ids)| {
                let object = object.to_string();
                let headers = headers.to_vec();
                async move {
                    // No new batch is submitted once cancellation is signaled.
                    if cancel.is_cancelled() {
                        return BatchOutcome::cancelled(batch_rows.len() as u64);
                    }
                    match self
                        .submit_batch(&object, &headers, &batch_rows, &batch_old_ids, options, cancel)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => BatchOutcome::failed_whole(
                            batch_rows.len() as u64,
                            format!("batch submission failed: {}", e),
                        ),
                    }
                }
            })
            .buffered(options.ingest_fanout)
            .collect()
            .await;

        for outcome in outcomes {
            result.batches += 1;
            result.submitted += outcome.submitted;
            result.succeeded += outcome.succeeded;
            result.failed += outcome.failed;
            result.errors.extend(outcome.errors);
        }
    }

    async fn submit_batch(
        &self,
        object: &str,
        headers: &[String],
        rows: &[Vec<String>],
        old_ids: &[Option<String>],
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let csv = render_csv(headers, rows)?;
        let job = self
            .client
            .create_ingest_job(object, options.operation(), options.external_id_field())
            .await?;
        debug!("{}: ingest job {} ({} rows)", object, job.id, rows.len());

        self.client.upload_ingest_data(&job.id, csv).await?;
        self.client.set_ingest_uploaded(&job.id).await?;

        let mut delay = INITIAL_POLL_DELAY;
        let job_info = loop {
            let info = self.client.get_ingest_job(&job.id).await?;
            if info.state.is_terminal() {
                break info;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    let _ = self.client.abort_ingest_job(&job.id).await;
                    bail!("ingest job {} cancelled", job.id);
                }
            }
            delay = std::cmp::min(delay * 2, MAX_POLL_DELAY);
        };

        if job_info.state != BulkJobState::JobComplete {
            let message = job_info
                .error_message
                .unwrap_or_else(|| format!("ingest job ended in state {:?}", job_info.state));
            return Ok(BatchOutcome::failed_whole(rows.len() as u64, message));
        }

        let success_csv = self.client.get_successful_results(&job.id).await?;
        let failure_csv = self.client.get_failed_results(&job.id).await?;

        let new_ids = parse_result_column(&success_csv, "sf__Id")?;
        let failures = parse_failures(&failure_csv)?;

        // Result rows correlate to submitted rows by batch-local order; a
        // count mismatch voids the mapping for this batch rather than risk
        // wrong pairs.
        if new_ids.len() == old_ids.len() {
            for (old_id, new_id) in old_ids.iter().zip(new_ids.iter()) {
                if let Some(old_id) = old_id {
                    if let Err(e) = self.mapping.insert(object, old_id, new_id) {
                        return Err(e);
                    }
                }
            }
        } else if !new_ids.is_empty() {
            warn!(
                "{}: {} success rows for {} submitted, skipping id correlation",
                object,
                new_ids.len(),
                old_ids.len()
            );
        }

        Ok(BatchOutcome {
            submitted: rows.len() as u64,
            succeeded: new_ids.len() as u64,
            failed: failures.len() as u64,
            errors: failures,
        })
    }

    /// Second pass: set the lookups that were nulled to break cycles.
    async fn apply_deferred_references(
        &self,
        pending: &[PendingReference],
        options: &RestoreOptions,
        cancel: &CancellationToken,
    ) -> u64 {
        if pending.is_empty() {
            return 0;
        }

        // One update job per (object, field) group.
        let mut groups: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
        for reference in pending {
            let Some(row_id) = self.resolve_reference(&reference.object, &reference.old_id, options)
            else {
                continue;
            };
            let Some(parent_id) =
                self.resolve_reference(&reference.parent, &reference.old_parent_ref, options)
            else {
                debug!(
                    "{}: parent {} {} never loaded, leaving {} unset",
                    reference.object, reference.parent, reference.old_parent_ref, reference.field
                );
                continue;
            };
            groups
                .entry((reference.object.clone(), reference.field.clone()))
                .or_default()
                .push((row_id, parent_id));
        }

        let mut applied = 0u64;
        for ((object, field), updates) in groups {
            if cancel.is_cancelled() {
                break;
            }
            let headers = vec!["Id".to_string(), field.clone()];
            let rows: Vec<Vec<String>> = updates
                .iter()
                .map(|(id, parent)| vec![id.clone(), parent.clone()])
                .collect();

            let mut update_options = options.clone();
            update_options.mode = RestoreMode::Update;

            for chunk in rows.chunks(options.batch_size) {
                if cancel.is_cancelled() {
                    break;
                }
                let old_ids = vec![None; chunk.len()];
                match self
                    .submit_batch(&object, &headers, chunk, &old_ids, &update_options, cancel)
                    .await
                {
                    Ok(outcome) => applied += outcome.succeeded,
                    Err(e) => warn!("{}: deferred update failed: {}", object, e),
                }
            }
            info!("{}: deferred {} updates applied", object, field);
        }
        applied
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    submitted: u64,
    succeeded: u64,
    failed: u64,
    errors: Vec<String>,
}

impl BatchOutcome {
    fn failed_whole(rows: u64, message: String) -> Self {
        Self {
            submitted: rows,
            succeeded: 0,
            failed: rows,
            errors: vec![message],
        }
    }

    fn cancelled(rows: u64) -> Self {
        Self {
            submitted: 0,
            succeeded: 0,
            failed: rows,
            errors: vec!["cancelled before submission".to_string()],
        }
    }
}

fn preflight(
    loaded: &HashMap<String, LoadedDataset>,
    descriptors: &HashMap<String, ObjectDescriptor>,
) -> Result<()> {
    let mut problems = Vec::new();
    for (object, dataset) in loaded {
        let descriptor = &descriptors[object];
        for header in &dataset.headers {
            if !descriptor.has_field(header) {
                problems.push(format!("{}: unknown field {}", object, header));
            }
        }
    }
    if !problems.is_empty() {
        problems.sort();
        bail!("Preflight validation failed:\n  {}", problems.join("\n  "));
    }
    Ok(())
}

fn read_csv(path: &std::path::Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
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
        rows.push(record.iter().map(|v| v.to_string()).collect());
    }
    Ok((headers, rows))
}

fn render_csv(headers: &[String], rows: &[Vec<String>]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer.into_inner().context("CSV writer flush failed")?;
    String::from_utf8(bytes).context("Rendered CSV is not UTF-8")
}

/// Ordered values of one column from an ingest result CSV.
fn parse_result_column(csv_text: &str, column: &str) -> Result<Vec<String>> {
    if csv_text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let index = reader
        .headers()
        .context("Failed to read result header")?
        .iter()
        .position(|h| h == column);
    let Some(index) = index else {
        return Ok(Vec::new());
    };

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read result record")?;
        values.push(record.get(index).unwrap_or_default().to_string());
    }
    Ok(values)
}

/// Failure lines (`sf__Error`) from a failed-results CSV.
fn parse_failures(csv_text: &str) -> Result<Vec<String>> {
    parse_result_column(csv_text, "sf__Error")
}
