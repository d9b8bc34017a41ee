use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::error::classify_remote;
use crate::api::{BulkJobState, ExtractError, ExtractFault, TenantClient};
use crate::observability::progress::{TaskPhase, TaskUpdate};

use super::soql;

/// First poll delay; doubles up to [`MAX_POLL_DELAY`].
pub const INITIAL_POLL_DELAY: Duration = Duration::from_secs(1);
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(30);

/// Rows requested per result page.
pub const PAGE_MAX_RECORDS: usize = 10_000;

/// Status callback invoked as the job advances. Delivery throttling is the
/// caller's concern (the progress hub coalesces).
pub type StatusFn<'a> = &'a (dyn Fn(TaskUpdate) + Send + Sync);

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub object: String,
    pub fields: Vec<String>,
    pub where_clause: Option<String>,
    /// 0 = unlimited.
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub rows: u64,
    pub bytes: u64,
    pub csv_path: PathBuf,
}

/// Drives one Bulk query job from creation to a drained, closed result.
pub struct ExtractEngine {
    client: Arc<TenantClient>,
}

impl ExtractEngine {
    pub fn new(client: Arc<TenantClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<TenantClient> {
        &self.client
    }

    /// Extract one object to `dest_root/<object>.csv`.
    ///
    /// Transient and pool-shutdown faults get exactly one automatic
    /// reconnect + retry; every other classified fault short-circuits.
    pub async fn query(
        &self,
        request: &ExtractRequest,
        dest_root: &Path,
        cancel: &CancellationToken,
        on_status: StatusFn<'_>,
    ) -> Result<ExtractOutcome, ExtractError> {
        match self.query_once(request, dest_root, cancel, on_status).await {
            Err(ExtractError::Fault { fault, message }) if fault.is_retryable() => {
                warn!(
                    "Retrying {} after transient fault: {}",
                    request.object, message
                );
                if let Err(e) = self.client.reconnect() {
                    return Err(ExtractError::fault(ExtractFault::Fatal, e.to_string()));
                }
                self.query_once(request, dest_root, cancel, on_status).await
            }
            other => other,
        }
    }

    async fn query_once(
        &self,
        request: &ExtractRequest,
        dest_root: &Path,
        cancel: &CancellationToken,
        on_status: StatusFn<'_>,
    ) -> Result<ExtractOutcome, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let soql = soql::build_query(
            &request.object,
            &request.fields,
            request.where_clause.as_deref(),
            request.limit,
        );
        debug!("{}: {}", request.object, soql);

        on_status(TaskUpdate {
            phase: TaskPhase::CreatingJob,
            records: 0,
            bytes: 0,
        });

        let job = self
            .client
            .create_query_job(&soql)
            .await
            .map_err(|e| ExtractError::from_api(&e))?;

        debug!("{}: created query job {}", request.object, job.id);

        self.wait_for_completion(&job.id, job.state, cancel, on_status)
            .await?;

        let outcome = self
            .drain_results(&job.id, &request.object, dest_root, cancel, on_status)
            .await;

        // Close is best-effort; a failure here never fails the extract.
        if let Err(e) = self.client.close_query_job(&job.id).await {
            debug!("Failed to close query job {}: {}", job.id, e);
        }

        outcome
    }

    /// Poll with exponential backoff until the job reaches a terminal state.
    ///
    /// A terminal job is never polled again: JobComplete returns, Failed and
    /// Aborted classify and error out.
    async fn wait_for_completion(
        &self,
        job_id: &str,
        initial_state: BulkJobState,
        cancel: &CancellationToken,
        on_status: StatusFn<'_>,
    ) -> Result<(), ExtractError> {
        let mut state = initial_state;
        let mut last_error: Option<String> = None;
        let mut delay = INITIAL_POLL_DELAY;

        loop {
            match state {
                BulkJobState::JobComplete => return Ok(()),
                BulkJobState::Failed | BulkJobState::Aborted => {
                    let message = last_error
                        .unwrap_or_else(|| format!("query job ended in state {:?}", state));
                    return Err(ExtractError::fault(classify_remote(400, &message), message));
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    // Ask the remote to stop; it may still finish.
                    if let Err(e) = self.client.abort_query_job(job_id).await {
                        debug!("Abort request for job {} failed: {}", job_id, e);
                    }
                    return Err(ExtractError::Cancelled);
                }
            }

            let info = self
                .client
                .get_query_job(job_id)
                .await
                .map_err(|e| ExtractError::from_api(&e))?;

            on_status(TaskUpdate {
                phase: TaskPhase::Polling,
                records: info.number_records_processed,
                bytes: 0,
            });

            state = info.state;
            last_error = info.error_message;
            delay = std::cmp::min(delay * 2, MAX_POLL_DELAY);
        }
    }

    /// Drain all result pages into the object CSV.
    ///
    /// Every page is a standalone CSV with its own header; the first page is
    /// written whole, later pages have the header stripped. Each page is
    /// flushed before the next is requested, so a failure never leaves a
    /// partial row past the last committed page.
    async fn drain_results(
        &self,
        job_id: &str,
        object: &str,
        dest_root: &Path,
        cancel: &CancellationToken,
        on_status: StatusFn<'_>,
    ) -> Result<ExtractOutcome, ExtractError> {
        tokio::fs::create_dir_all(dest_root)
            .await
            .map_err(|e| ExtractError::fault(ExtractFault::Fatal, e.to_string()))?;

        let csv_path = dest_root.join(format!("{}.csv", object));
        let mut file = tokio::fs::File::create(&csv_path)
            .await
            .map_err(|e| ExtractError::fault(ExtractFault::Fatal, e.to_string()))?;

        let mut locator: Option<String> = None;
        let mut first_page = true;
        let mut rows = 0u64;
        let mut bytes = 0u64;

        loop {
            if cancel.is_cancelled() {
                if let Err(e) = self.client.abort_query_job(job_id).await {
                    debug!("Abort request for job {} failed: {}", job_id, e);
                }
                return Err(ExtractError::Cancelled);
            }

            let page = self
                .client
                .get_query_results(job_id, locator.as_deref(), PAGE_MAX_RECORDS)
                .await
                .map_err(|e| ExtractError::from_api(&e))?;

            rows += count_page_rows(&page.csv)?;

            let chunk = if first_page {
                page.csv.as_str()
            } else {
                strip_header_line(&page.csv)
            };

            if !chunk.is_empty() {
                file.write_all(chunk.as_bytes())
                    .await
                    .map_err(|e| ExtractError::fault(ExtractFault::Fatal, e.to_string()))?;
                file.flush()
                    .await
                    .map_err(|e| ExtractError::fault(ExtractFault::Fatal, e.to_string()))?;
                bytes += chunk.len() as u64;
            }

            on_status(TaskUpdate {
                phase: TaskPhase::Downloading,
                records: rows,
                bytes,
            });

            match page.locator {
                Some(next) => locator = Some(next),
                None => break,
            }
            first_page = false;
        }

        debug!("{}: drained {} rows ({} bytes)", object, rows, bytes);

        Ok(ExtractOutcome {
            rows,
            bytes,
            csv_path,
        })
    }
}

/// CSV-aware data-row count for one result page (header excluded).
fn count_page_rows(page_csv: &str) -> Result<u64, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(page_csv.as_bytes());

    let mut rows = 0u64;
    for record in reader.records() {
        record.map_err(|e| {
            ExtractError::fault(ExtractFault::CsvSerialize, format!("malformed CSV page: {}", e))
        })?;
        rows += 1;
    }
    Ok(rows)
}

/// Drop the header line of a follow-up page.
fn strip_header_line(page_csv: &str) -> &str {
    match page_csv.find('\n') {
        Some(idx) => &page_csv[idx + 1..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClientConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine_for(server: &MockServer) -> ExtractEngine {
        let client = TenantClient::new(ClientConfig::new(server.uri(), "token")).unwrap();
        ExtractEngine::new(Arc::new(client))
    }

    fn request(object: &str) -> ExtractRequest {
        ExtractRequest {
            object: object.to_string(),
            fields: vec!["Id".to_string(), "Name".to_string()],
            where_clause: None,
            limit: 0,
        }
    }

    fn no_status() -> impl Fn(TaskUpdate) + Send + Sync {
        |_| {}
    }

    async fn mount_job_lifecycle(server: &MockServer, job_id: &str) {
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
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
                "numberRecordsProcessed": 3,
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/services/data/v62.0/jobs/query/{}", job_id)))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_single_page_extract_writes_header_and_rows() {
        let server = MockServer::start().await;
        mount_job_lifecycle(&server, "750A").await;
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/query/750A/results"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string("Id,Name\n001A,Acme\n001B,Globex\n001C,Initech\n"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server);
        let outcome = engine
            .query(&request("Account"), dir.path(), &CancellationToken::new(), &no_status())
            .await
            .expect("extract should succeed");

        assert_eq!(outcome.rows, 3);
        let written = std::fs::read_to_string(dir.path().join("Account.csv")).unwrap();
        assert_eq!(written.lines().count(), 4, "header plus three data rows");
        assert!(written.starts_with("Id,Name\n"));
    }

    #[tokio::test]
    async fn test_pagination_strips_follow_up_headers() {
        let server = MockServer::start().await;
        mount_job_lifecycle(&server, "750B").await;
        // First page hands out a locator, second page ends the drain.
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/query/750B/results"))
            .and(query_param("locator", "PAGE2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string("Id,Name\n001B,Globex\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/query/750B/results"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "PAGE2")
                    .set_body_string("Id,Name\n001A,Acme\n"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server);
        let outcome = engine
            .query(&request("Account"), dir.path(), &CancellationToken::new(), &no_status())
            .await
            .expect("paginated extract should succeed");

        assert_eq!(outcome.rows, 2);
        let written = std::fs::read_to_string(dir.path().join("Account.csv")).unwrap();
        assert_eq!(
            written, "Id,Name\n001A,Acme\n001B,Globex\n",
            "exactly one header line survives pagination"
        );
    }

    #[tokio::test]
    async fn test_unsupported_object_classifies_for_skip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"[{"errorCode":"INVALIDENTITY","message":"Object X is not supported by the Bulk API"}]"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server);
        let err = engine
            .query(&request("X"), dir.path(), &CancellationToken::new(), &no_status())
            .await
            .expect_err("unsupported object must error");

        match err {
            ExtractError::Fault { fault, .. } => {
                assert_eq!(fault, ExtractFault::UnsupportedByBulk);
                assert!(fault.skips_object());
            }
            other => panic!("expected classified fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_fault_retried_once() {
        let server = MockServer::start().await;
        // First creation attempt fails with a 503; the retry succeeds.
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/query"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_job_lifecycle(&server, "750C").await;
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/query/750C/results"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string("Id,Name\n001A,Acme\n"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server);
        let outcome = engine
            .query(&request("Account"), dir.path(), &CancellationToken::new(), &no_status())
            .await
            .expect("one transient fault should be retried");

        assert_eq!(outcome.rows, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_creates_no_job() {
        let server = MockServer::start().await;
        // No mocks mounted: any request would 404 and fail the test through
        // the classified error instead of Cancelled.
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(&server);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .query(&request("Account"), dir.path(), &cancel, &no_status())
            .await
            .expect_err("cancelled extract must not run");
        assert!(matches!(err, ExtractError::Cancelled));
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[test]
    fn test_count_page_rows_is_csv_aware() {
        // A quoted newline is one record, not two lines.
        let page = "Id,Description\n001A,\"line one\nline two\"\n001B,plain\n";
        assert_eq!(count_page_rows(page).unwrap(), 2);
    }

    #[test]
    fn test_strip_header_line() {
        assert_eq!(strip_header_line("Id,Name\n001A,Acme\n"), "001A,Acme\n");
        assert_eq!(strip_header_line("Id,Name"), "");
    }
}
