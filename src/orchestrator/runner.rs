use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ExtractError, TenantClient};
use crate::config::models::MAX_PARALLELISM;
use crate::extract::blobs::blob_field;
use crate::extract::{BlobDownloader, ExtractEngine, ExtractRequest};
use crate::incremental;
use crate::model::{
    BackupRun, HistoryStore, ObjectBackupResult, ObjectDescriptor, ObjectStatus, ObjectTask,
    RunKind, RunStatus, TaskStatus,
};
use crate::observability::progress::{ProgressHub, ProgressSink, TaskPhase, TaskUpdate};
use crate::relationships::RelationshipAnalyzer;
use crate::sink::Sink;

use super::manifest::{BackupManifest, ObjectManifestEntry, RecordTypeEntry, RelationshipManifest};
use super::related::{self, RelatedSelection};

/// Options for one backup run; validated before any work starts.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub parallelism: usize,
    pub output_root: PathBuf,

    /// Per-object record cap; 0 = unlimited.
    pub record_limit: u64,

    pub incremental: bool,
    pub custom_where: Option<String>,
    pub include_related: bool,
    pub relationship_depth: u32,
    pub priority_only: bool,
    pub preserve_relationships: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            parallelism: MAX_PARALLELISM,
            output_root: PathBuf::from("."),
            record_limit: 0,
            incremental: false,
            custom_where: None,
            include_related: false,
            relationship_depth: 1,
            priority_only: false,
            preserve_relationships: false,
        }
    }
}

impl BackupOptions {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            bail!(
                "parallelism must be between 1 and {}, got {}",
                MAX_PARALLELISM,
                self.parallelism
            );
        }
        if !(1..=3).contains(&self.relationship_depth) {
            bail!(
                "relationship_depth must be 1, 2 or 3, got {}",
                self.relationship_depth
            );
        }
        if self.output_root.as_os_str().is_empty() {
            bail!("output_root must not be empty");
        }
        Ok(())
    }
}

/// Shared context handed to every worker.
struct WorkerCtx {
    engine: ExtractEngine,
    blobs: BlobDownloader,
    sink: Arc<dyn Sink>,
    history: Arc<HistoryStore>,
    hub: Arc<ProgressHub>,
    options: BackupOptions,
    cancel: CancellationToken,
    run_id: String,
    run_started: DateTime<Utc>,
    username: String,
}

/// Drives selected object tasks through extract and sink with a bounded
/// worker pool, then runs the related-records post-pass and manifests.
pub struct Orchestrator {
    client: Arc<TenantClient>,
    analyzer: Arc<RelationshipAnalyzer>,
    sink: Arc<dyn Sink>,
    history: Arc<HistoryStore>,
    progress: Arc<dyn ProgressSink>,
    username: String,
}

impl Orchestrator {
    pub fn new(
        client: Arc<TenantClient>,
        sink: Arc<dyn Sink>,
        history: Arc<HistoryStore>,
        progress: Arc<dyn ProgressSink>,
        username: impl Into<String>,
    ) -> Self {
        let analyzer = Arc::new(RelationshipAnalyzer::new(client.clone()));
        Self {
            client,
            analyzer,
            sink,
            history,
            progress,
            username: username.into(),
        }
    }

    pub fn analyzer(&self) -> &Arc<RelationshipAnalyzer> {
        &self.analyzer
    }

    /// Execute one backup run to completion or cancellation.
    ///
    /// Individual task failures never abort siblings; only option validation
    /// and sink connection errors fail the run before it starts.
    pub async fn run(
        &self,
        selection: Vec<ObjectTask>,
        options: &BackupOptions,
        related_selection: Option<RelatedSelection>,
        cancel: CancellationToken,
    ) -> Result<BackupRun> {
        options.validate()?;
        if selection.is_empty() {
            bail!("Selection must contain at least one object");
        }

        tokio::fs::create_dir_all(&options.output_root)
            .await
            .context("Failed to create output root")?;
        self.sink.connect().await.context("Failed to connect sink")?;

        let kind = if options.incremental {
            RunKind::Incremental
        } else {
            RunKind::Full
        };
        let mut run = BackupRun::open(
            &self.username,
            kind,
            self.sink.target_kind(),
            options.output_root.display().to_string(),
        );
        self.history.record_run(run.clone()).await?;

        info!(
            "Run {} started: {} objects, parallelism {}",
            run.id,
            selection.len(),
            options.parallelism
        );

        let hub = ProgressHub::new(self.progress.clone(), selection.len(), cancel.clone());
        let ctx = Arc::new(WorkerCtx {
            engine: ExtractEngine::new(self.client.clone()),
            blobs: BlobDownloader::new(self.client.clone()),
            sink: self.sink.clone(),
            history: self.history.clone(),
            hub: hub.clone(),
            options: options.clone(),
            cancel: cancel.clone(),
            run_id: run.id.clone(),
            run_started: run.started_at,
            username: self.username.clone(),
        });

        run.results
            .extend(execute_task_pool(selection, ctx.clone()).await);

        if options.include_related && options.record_limit > 0 && !cancel.is_cancelled() {
            match self.related_pass(&run, options, related_selection, &ctx).await {
                Ok(results) => run.results.extend(results),
                Err(e) => warn!("Related-records pass failed: {}", e),
            }
        }

        if options.preserve_relationships && !cancel.is_cancelled() {
            if let Err(e) = self.write_backup_manifest(&run, options).await {
                warn!("Failed to write backup manifest: {}", e);
            }
        }

        if cancel.is_cancelled() {
            // Partial outputs stay in place on cancellation.
            run.close(RunStatus::Cancelled);
        } else {
            if let Err(e) = self.sink.finalize(&options.output_root).await {
                warn!("Sink finalize failed: {}", e);
            }
            run.close(RunStatus::Completed);
        }

        hub.shutdown().await;
        self.sink.disconnect().await?;
        self.history.record_run(run.clone()).await?;

        info!(
            "Run {} finished: {:?}, {}/{} objects completed",
            run.id,
            run.status,
            run.completed_count(),
            run.results.len()
        );
        Ok(run)
    }

    /// Back up children related to the parents this run already produced.
    async fn related_pass(
        &self,
        run: &BackupRun,
        options: &BackupOptions,
        selection: Option<RelatedSelection>,
        ctx: &Arc<WorkerCtx>,
    ) -> Result<Vec<ObjectBackupResult>> {
        let parents: Vec<String> = run
            .results
            .iter()
            .filter(|r| r.status == ObjectStatus::Completed && r.record_count > 0)
            .map(|r| r.object_name.clone())
            .collect();
        if parents.is_empty() {
            return Ok(Vec::new());
        }

        let nodes = match selection {
            Some(confirmed) => confirmed.as_nodes(),
            None => {
                related::discover_nodes(
                    &self.analyzer,
                    &parents,
                    options.relationship_depth,
                    options.priority_only,
                )
                .await?
            }
        };
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut already: HashSet<String> =
            run.results.iter().map(|r| r.object_name.clone()).collect();
        let mut parent_ids: HashMap<String, Vec<String>> = HashMap::new();
        for parent in &parents {
            match self.analyzer.extract_ids(parent, &options.output_root) {
                Ok(ids) => {
                    parent_ids.insert(parent.clone(), ids);
                }
                Err(e) => warn!("Cannot read id set for {}: {}", parent, e),
            }
        }

        let max_level = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let mut results = Vec::new();

        for level in 1..=max_level {
            if ctx.cancel.is_cancelled() {
                break;
            }

            for rel_task in related::group_level_tasks(&nodes, level, &parent_ids, &already) {
                if ctx.cancel.is_cancelled() {
                    break;
                }

                let child = rel_task.child_object.clone();
                already.insert(child.clone());

                let describe = match self.analyzer.describe_cached(&child).await {
                    Ok(d) => d,
                    Err(e) => {
                        results.push(ObjectBackupResult::failed(&child, e.to_string(), 0));
                        continue;
                    }
                };

                let mut task = ObjectTask::new(ObjectDescriptor::from_describe(&describe));
                task.where_clause = Some(rel_task.where_fragment.clone());
                // Children of a limited parent set are pulled in full.
                task.record_limit = 0;

                ctx.hub.log(format!(
                    "Related: {} via {} (depth {})",
                    child,
                    rel_task.parent_fields.join(", "),
                    level
                ));

                let result = process_task(ctx, task).await;
                if result.status == ObjectStatus::Completed
                    && result.record_count > 0
                    && level < max_level
                {
                    match self.analyzer.extract_ids(&child, &options.output_root) {
                        Ok(ids) => {
                            parent_ids.insert(child.clone(), ids);
                        }
                        Err(e) => warn!("Cannot read id set for {}: {}", child, e),
                    }
                }
                results.push(result);
            }
        }

        let manifest =
            RelationshipManifest::new(options.relationship_depth, parents, &nodes);
        manifest.write(&options.output_root).await?;

        Ok(results)
    }

    async fn write_backup_manifest(&self, run: &BackupRun, options: &BackupOptions) -> Result<()> {
        let mut entries = Vec::new();
        for result in &run.results {
            if result.status != ObjectStatus::Completed {
                continue;
            }
            let describe = self.analyzer.describe_cached(&result.object_name).await?;
            let record_types = describe
                .record_type_infos
                .iter()
                .map(|rt| RecordTypeEntry {
                    id: rt.record_type_id.clone(),
                    name: rt.name.clone(),
                })
                .collect();
            entries.push(ObjectManifestEntry::from_descriptor(
                &ObjectDescriptor::from_describe(&describe),
                record_types,
            ));
        }
        BackupManifest::new(entries).write(&options.output_root).await
    }
}

/// Drain the task queue with a bounded pool of workers.
///
/// Cancellation is observed before every dequeue; tasks still queued when
/// the run is cancelled are reported Skipped.
async fn execute_task_pool(
    selection: Vec<ObjectTask>,
    ctx: Arc<WorkerCtx>,
) -> Vec<ObjectBackupResult> {
    let worker_count = ctx.options.parallelism.min(selection.len()).max(1);
    let queue = Arc::new(Mutex::new(VecDeque::from(selection)));
    let results = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let queue = queue.clone();
        let results = results.clone();
        let ctx = ctx.clone();

        handles.push(tokio::spawn(async move {
            loop {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let task = {
                    let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
                    queue.pop_front()
                };
                let Some(task) = task else { break };

                let result = process_task(&ctx, task).await;
                results.lock().unwrap_or_else(|p| p.into_inner()).push(result);
                ctx.hub.task_done();
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    // Whatever is still queued after cancellation is skipped, not lost.
    let leftover: Vec<ObjectTask> = {
        let mut queue = queue.lock().unwrap_or_else(|p| p.into_inner());
        queue.drain(..).collect()
    };
    let mut collected = {
        let mut results = results.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *results)
    };
    for task in leftover {
        collected.push(ObjectBackupResult::skipped(
            task.object_name(),
            "run cancelled",
        ));
        ctx.hub.task_done();
    }
    collected
}

/// Per-object pipeline: delta decision, predicate merge, extract, blob
/// sidecar, sink write, result emission.
async fn process_task(ctx: &Arc<WorkerCtx>, mut task: ObjectTask) -> ObjectBackupResult {
    let object = task.object_name().to_string();
    let started = Instant::now();
    task.start();
    ctx.hub.log(format!("Backing up {}", object));

    let scope = match incremental::decide(
        &task.descriptor,
        ctx.sink.as_ref(),
        &ctx.history,
        &ctx.username,
        ctx.options.incremental,
    )
    .await
    {
        Ok(scope) => scope,
        Err(e) => {
            task.finish(TaskStatus::Failed {
                error: e.to_string(),
            });
            return ObjectBackupResult::failed(&object, e.to_string(), elapsed_ms(started));
        }
    };

    let user_where = crate::extract::soql::merge_where(
        task.where_clause.as_deref(),
        ctx.options.custom_where.as_deref(),
    );
    let where_clause = incremental::effective_where(&scope, user_where.as_deref());
    if scope.is_delta() {
        ctx.hub.log(format!("{}: delta query", object));
    }

    let limit = if task.record_limit > 0 {
        task.record_limit
    } else {
        ctx.options.record_limit
    };
    let request = ExtractRequest {
        object: object.clone(),
        fields: task.projected_fields(),
        where_clause,
        limit,
    };

    let hub = ctx.hub.clone();
    let status_object = object.clone();
    let on_status = move |update: TaskUpdate| {
        hub.task_update(&status_object, update);
    };

    let outcome = match ctx
        .engine
        .query(&request, &ctx.options.output_root, &ctx.cancel, &on_status)
        .await
    {
        Ok(outcome) => outcome,
        Err(ExtractError::Cancelled) => {
            task.finish(TaskStatus::Skipped {
                reason: "run cancelled".to_string(),
            });
            return ObjectBackupResult::skipped(&object, "run cancelled");
        }
        Err(ExtractError::Fault { fault, message }) => {
            let message = match fault.hint() {
                Some(hint) => format!("{} ({})", message, hint),
                None => message,
            };
            return if fault.skips_object() {
                task.finish(TaskStatus::Skipped {
                    reason: message.clone(),
                });
                ctx.hub.log(format!("{}: skipped: {}", object, message));
                ObjectBackupResult::skipped(&object, message)
            } else {
                task.finish(TaskStatus::Failed {
                    error: message.clone(),
                });
                ctx.hub.log(format!("{}: failed: {}", object, message));
                ObjectBackupResult::failed(&object, message, elapsed_ms(started))
            };
        }
    };

    // Blob sidecar runs only after the CSV is closed.
    if let Some(field) = blob_field(&object) {
        ctx.hub.task_update(
            &object,
            TaskUpdate {
                phase: TaskPhase::DownloadingBlobs,
                records: outcome.rows,
                bytes: outcome.bytes,
            },
        );
        if let Err(e) = ctx
            .blobs
            .download_all(
                &object,
                field,
                &outcome.csv_path,
                &ctx.options.output_root,
                &ctx.cancel,
            )
            .await
        {
            warn!("{}: blob sidecar failed: {}", object, e);
        }
    }

    ctx.hub.task_update(
        &object,
        TaskUpdate {
            phase: TaskPhase::WritingSink,
            records: outcome.rows,
            bytes: outcome.bytes,
        },
    );

    let written = match ctx
        .sink
        .write_data(&object, &outcome.csv_path, &ctx.run_id)
        .await
    {
        Ok(written) => written,
        Err(e) => {
            task.finish(TaskStatus::Failed {
                error: e.to_string(),
            });
            return ObjectBackupResult::failed(&object, e.to_string(), elapsed_ms(started));
        }
    };

    // Watermark is recorded only after the sink write confirms.
    if let Err(e) = ctx.sink.record_completion(&object, ctx.run_started).await {
        warn!("{}: failed to record completion watermark: {}", object, e);
    }

    let mut result = ObjectBackupResult::completed(
        &object,
        outcome.rows,
        outcome.bytes,
        elapsed_ms(started),
        ctx.run_started,
    );
    if written != outcome.rows {
        let warning = format!(
            "sink confirmed {} rows but extract produced {}",
            written, outcome.rows
        );
        warn!("{}: {}", object, warning);
        result = result.with_warning(warning);
    }

    task.finish(TaskStatus::Completed);
    task.metrics.records = outcome.rows;
    task.metrics.bytes = outcome.bytes;
    task.metrics.duration_ms = result.duration_ms;

    ctx.hub.log(format!(
        "{}: completed, {} records ({} bytes)",
        object, outcome.rows, outcome.bytes
    ));
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClientConfig;
    use crate::model::descriptor::FieldDescriptor;
    use crate::observability::TerminalProgress;
    use crate::sink::FileSink;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(name: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            name: name.to_string(),
            label: name.to_string(),
            queryable: true,
            fields: vec![
                FieldDescriptor {
                    name: "Id".to_string(),
                    field_type: "id".to_string(),
                    external_id: false,
                    reference_to: vec![],
                    createable: false,
                    updateable: false,
                },
                FieldDescriptor {
                    name: "Name".to_string(),
                    field_type: "string".to_string(),
                    external_id: false,
                    reference_to: vec![],
                    createable: true,
                    updateable: true,
                },
            ],
        }
    }

    async fn orchestrator_for(
        server: &MockServer,
        history_dir: &std::path::Path,
    ) -> Orchestrator {
        let client =
            Arc::new(TenantClient::new(ClientConfig::new(server.uri(), "token")).unwrap());
        let history = Arc::new(
            HistoryStore::new(history_dir.join("history.json"))
                .await
                .unwrap(),
        );
        Orchestrator::new(
            client,
            Arc::new(FileSink::new(false)),
            history,
            Arc::new(TerminalProgress),
            "ada@example.com",
        )
    }

    /// Mount a full query-job lifecycle keyed by a SOQL body fragment.
    async fn mount_query(server: &MockServer, soql_fragment: &str, job_id: &str, csv: &str) {
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .and(body_string_contains(soql_fragment))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": job_id,
                "state": "UploadComplete",
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/services/data/v62.0/jobs/query/{}", job_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": job_id,
                "state": "JobComplete",
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!(
                "/services/data/v62.0/jobs/query/{}/results",
                job_id
            )))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string(csv.to_string()),
            )
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/services/data/v62.0/jobs/query/{}", job_id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    fn options_into(dir: &std::path::Path) -> BackupOptions {
        BackupOptions {
            parallelism: 2,
            output_root: dir.to_path_buf(),
            ..BackupOptions::default()
        }
    }

    #[test]
    fn test_option_validation() {
        let mut options = BackupOptions::default();
        options.output_root = PathBuf::from("/tmp/x");
        assert!(options.validate().is_ok());

        options.parallelism = 0;
        assert!(options.validate().is_err(), "zero workers rejected");
        options.parallelism = MAX_PARALLELISM + 1;
        assert!(options.validate().is_err(), "over the pool ceiling rejected");
        options.parallelism = 4;

        options.relationship_depth = 0;
        assert!(options.validate().is_err());
        options.relationship_depth = 4;
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn test_full_run_single_object() {
        let server = MockServer::start().await;
        mount_query(
            &server,
            "FROM Account",
            "750A",
            "Id,Name\n001A,Acme\n001B,Globex\n001C,Initech\n",
        )
        .await;

        let out = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(&server, out.path()).await;

        let run = orchestrator
            .run(
                vec![ObjectTask::new(descriptor("Account"))],
                &options_into(out.path()),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.exit_code(), 0);
        assert_eq!(run.results.len(), 1);
        let result = &run.results[0];
        assert_eq!(result.status, ObjectStatus::Completed);
        assert_eq!(result.record_count, 3);
        assert!(result.watermark.is_some(), "completed result carries watermark");
        assert_eq!(result.watermark.unwrap(), run.started_at);

        let csv = std::fs::read_to_string(out.path().join("Account.csv")).unwrap();
        assert_eq!(csv.lines().count(), 4, "header plus recordCount lines");
    }

    #[tokio::test]
    async fn test_unsupported_object_skips_without_aborting_siblings() {
        let server = MockServer::start().await;
        mount_query(&server, "FROM Account", "750A", "Id,Name\n001A,Acme\n").await;
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .and(body_string_contains("FROM Announcement"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"[{"errorCode":"INVALIDENTITY","message":"Object Announcement is not supported by the Bulk API"}]"#,
            ))
            .mount(&server)
            .await;

        let out = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(&server, out.path()).await;

        let run = orchestrator
            .run(
                vec![
                    ObjectTask::new(descriptor("Account")),
                    ObjectTask::new(descriptor("Announcement")),
                ],
                &options_into(out.path()),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.exit_code(), 2, "partial failure exits 2");

        let skipped = run
            .results
            .iter()
            .find(|r| r.object_name == "Announcement")
            .unwrap();
        assert_eq!(skipped.status, ObjectStatus::Skipped);
        assert!(
            skipped.error.as_deref().unwrap().contains("not supported by the Bulk API"),
            "skip reason carries the remote message: {:?}",
            skipped.error
        );

        let completed = run.results.iter().find(|r| r.object_name == "Account").unwrap();
        assert_eq!(completed.status, ObjectStatus::Completed);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_skips_everything() {
        let server = MockServer::start().await;
        let out = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(&server, out.path()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = orchestrator
            .run(
                vec![
                    ObjectTask::new(descriptor("Account")),
                    ObjectTask::new(descriptor("Contact")),
                ],
                &options_into(out.path()),
                None,
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.exit_code(), 3);
        assert_eq!(run.results.len(), 2);
        assert!(run
            .results
            .iter()
            .all(|r| r.status == ObjectStatus::Skipped));

        // No extract job was ever created.
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_related_pass_pulls_children_of_limited_parents() {
        let server = MockServer::start().await;

        // Parent extract limited to 2 rows.
        mount_query(
            &server,
            "FROM Account",
            "750A",
            "Id,Name\n001A,Acme\n001B,Globex\n",
        )
        .await;
        // Child extract must be filtered to the parent's id set.
        mount_query(
            &server,
            "(AccountId IN ('001A','001B'))",
            "750B",
            "Id,AccountId\n003A,001A\n003B,001B\n003C,001A\n",
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/sobjects/Account/describe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Account",
                "queryable": true,
                "fields": [],
                "childRelationships": [
                    {"childSObject": "Contact", "field": "AccountId", "relationshipName": "Contacts"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/sobjects/Contact/describe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Contact",
                "queryable": true,
                "fields": [
                    {"name": "Id", "type": "id"},
                    {"name": "AccountId", "type": "reference", "referenceTo": ["Account"]}
                ],
                "childRelationships": []
            })))
            .mount(&server)
            .await;

        let out = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(&server, out.path()).await;

        let mut options = options_into(out.path());
        options.record_limit = 2;
        options.include_related = true;
        options.relationship_depth = 1;

        let run = orchestrator
            .run(
                vec![ObjectTask::new(descriptor("Account"))],
                &options,
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.exit_code(), 0);
        let contact = run
            .results
            .iter()
            .find(|r| r.object_name == "Contact")
            .expect("related Contact backed up");
        assert_eq!(contact.status, ObjectStatus::Completed);
        assert_eq!(contact.record_count, 3);

        let manifest_raw = std::fs::read_to_string(
            out.path().join(super::super::manifest::RELATIONSHIP_MANIFEST_FILE),
        )
        .unwrap();
        let manifest: super::super::manifest::RelationshipManifest =
            serde_json::from_str(&manifest_raw).unwrap();
        assert_eq!(manifest.depth, 1);
        assert_eq!(manifest.parents, vec!["Account"]);
        assert_eq!(manifest.related_objects[0].object, "Contact");
        assert_eq!(manifest.related_objects[0].parent_field, "AccountId");
    }

    #[tokio::test]
    async fn test_run_recorded_in_history() {
        let server = MockServer::start().await;
        mount_query(&server, "FROM Account", "750A", "Id,Name\n001A,Acme\n").await;

        let out = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(&server, out.path()).await;

        let run = orchestrator
            .run(
                vec![ObjectTask::new(descriptor("Account"))],
                &options_into(out.path()),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let watermark = orchestrator
            .history
            .last_completed_watermark("ada@example.com", "Account")
            .await;
        assert_eq!(
            watermark,
            Some(run.started_at),
            "history carries the run-start watermark"
        );
    }
}
