use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::TenantClient;
use super::error::ApiError;

/// Remote lifecycle state shared by query and ingest jobs.
///
/// Terminal states are never polled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkJobState {
    Queued,
    UploadComplete,
    InProgress,
    Aborted,
    JobComplete,
    Failed,
}

impl BulkJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulkJobState::JobComplete | BulkJobState::Aborted | BulkJobState::Failed
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default)]
    pub number_records_processed: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One page of query results.
pub struct QueryResultPage {
    /// Standalone CSV chunk; every page carries its own header row.
    pub csv: String,
    /// Locator for the next page; `None` once the result set is drained.
    pub locator: Option<String>,
    /// Row count the remote reported for this page, when present.
    pub record_count: Option<u64>,
}

/// Header carrying the next-page locator; the literal string `null` marks
/// the final page.
const LOCATOR_HEADER: &str = "Sforce-Locator";
const RECORD_COUNT_HEADER: &str = "Sforce-NumberOfRecords";

impl TenantClient {
    /// Create an asynchronous CSV query job.
    pub async fn create_query_job(&self, soql: &str) -> Result<QueryJobInfo, ApiError> {
        let body = json!({
            "operation": "query",
            "query": soql,
            "contentType": "CSV",
            "columnDelimiter": "COMMA",
            "lineEnding": "LF",
        });
        self.post_json("jobs/query", &body).await
    }

    pub async fn get_query_job(&self, job_id: &str) -> Result<QueryJobInfo, ApiError> {
        self.get_json(&format!("jobs/query/{}", job_id)).await
    }

    /// Fetch one page of results via the server-provided locator.
    pub async fn get_query_results(
        &self,
        job_id: &str,
        locator: Option<&str>,
        max_records: usize,
    ) -> Result<QueryResultPage, ApiError> {
        let mut query: Vec<(&str, String)> = vec![("maxRecords", max_records.to_string())];
        if let Some(locator) = locator {
            query.push(("locator", locator.to_string()));
        }

        let response = self
            .get_raw(&format!("jobs/query/{}/results", job_id), &query)
            .await?;

        let next_locator = response
            .headers()
            .get(LOCATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| *v != "null" && !v.is_empty())
            .map(|v| v.to_string());

        let record_count = response
            .headers()
            .get(RECORD_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueryResultPage {
            csv: response.text().await?,
            locator: next_locator,
            record_count,
        })
    }

    /// Request abort of an in-flight query job (best effort on cancel).
    pub async fn abort_query_job(&self, job_id: &str) -> Result<(), ApiError> {
        self.patch_json(
            &format!("jobs/query/{}", job_id),
            &json!({"state": "Aborted"}),
        )
        .await
    }

    /// Delete a drained query job so the remote can reclaim it.
    pub async fn close_query_job(&self, job_id: &str) -> Result<(), ApiError> {
        self.delete(&format!("jobs/query/{}", job_id)).await
    }
}
