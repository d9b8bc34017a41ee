use serde::{Deserialize, Serialize};
use serde_json::json;

use super::bulk_query::BulkJobState;
use super::client::TenantClient;
use super::error::ApiError;

/// Write operation applied by an ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngestOperation {
    Insert,
    Upsert,
    Update,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJobInfo {
    pub id: String,
    pub state: BulkJobState,
    #[serde(default)]
    pub number_records_processed: u64,
    #[serde(default)]
    pub number_records_failed: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TenantClient {
    /// Create an ingest job for one object and operation.
    pub async fn create_ingest_job(
        &self,
        object: &str,
        operation: IngestOperation,
        external_id_field: Option<&str>,
    ) -> Result<IngestJobInfo, ApiError> {
        let mut body = json!({
            "object": object,
            "operation": operation,
            "contentType": "CSV",
            "lineEnding": "LF",
        });
        if let Some(field) = external_id_field {
            body["externalIdFieldName"] = json!(field);
        }
        self.post_json("jobs/ingest", &body).await
    }

    /// Upload the CSV batch body for a job in Open state.
    pub async fn upload_ingest_data(&self, job_id: &str, csv: String) -> Result<(), ApiError> {
        self.put_csv(&format!("jobs/ingest/{}/batches", job_id), csv)
            .await
    }

    /// Mark the upload finished so the remote starts processing.
    pub async fn set_ingest_uploaded(&self, job_id: &str) -> Result<(), ApiError> {
        self.patch_json(
            &format!("jobs/ingest/{}", job_id),
            &json!({"state": "UploadComplete"}),
        )
        .await
    }

    pub async fn get_ingest_job(&self, job_id: &str) -> Result<IngestJobInfo, ApiError> {
        self.get_json(&format!("jobs/ingest/{}", job_id)).await
    }

    /// CSV of rows the remote accepted (`sf__Id`, `sf__Created`, then the
    /// uploaded columns).
    pub async fn get_successful_results(&self, job_id: &str) -> Result<String, ApiError> {
        let response = self
            .get_raw(&format!("jobs/ingest/{}/successfulResults", job_id), &[])
            .await?;
        Ok(response.text().await?)
    }

    /// CSV of rejected rows (`sf__Error`, then the uploaded columns).
    pub async fn get_failed_results(&self, job_id: &str) -> Result<String, ApiError> {
        let response = self
            .get_raw(&format!("jobs/ingest/{}/failedResults", job_id), &[])
            .await?;
        Ok(response.text().await?)
    }

    /// Request abort of an ingest job (cancellation path, best effort).
    pub async fn abort_ingest_job(&self, job_id: &str) -> Result<(), ApiError> {
        self.patch_json(
            &format!("jobs/ingest/{}", job_id),
            &json!({"state": "Aborted"}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::ClientConfig;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> TenantClient {
        TenantClient::new(ClientConfig::new(server.uri(), "session-token"))
            .expect("client should build")
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(IngestOperation::Insert).unwrap(),
            serde_json::json!("insert")
        );
        assert_eq!(
            serde_json::to_value(IngestOperation::Upsert).unwrap(),
            serde_json::json!("upsert")
        );
    }

    #[tokio::test]
    async fn test_create_ingest_job_includes_external_id_for_upsert() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/data/v62.0/jobs/ingest"))
            .and(body_partial_json(serde_json::json!({
                "object": "Account",
                "operation": "upsert",
                "externalIdFieldName": "External_Key__c",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "751000000000001",
                "state": "UploadComplete",
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let job = client
            .create_ingest_job("Account", IngestOperation::Upsert, Some("External_Key__c"))
            .await
            .expect("ingest job should be created");

        assert_eq!(job.id, "751000000000001");
    }

    #[tokio::test]
    async fn test_upload_then_upload_complete() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/services/data/v62.0/jobs/ingest/751X/batches"))
            .and(body_string_contains("Name\nAcme"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/services/data/v62.0/jobs/ingest/751X"))
            .and(body_partial_json(serde_json::json!({"state": "UploadComplete"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client
            .upload_ingest_data("751X", "Name\nAcme\n".to_string())
            .await
            .expect("upload should succeed");
        client
            .set_ingest_uploaded("751X")
            .await
            .expect("state patch should succeed");
    }

    #[tokio::test]
    async fn test_result_sets_return_csv_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/services/data/v62.0/jobs/ingest/751X/successfulResults",
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("\"sf__Id\",\"sf__Created\",\"Name\"\n\"001N\",\"true\",\"Acme\"\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v62.0/jobs/ingest/751X/failedResults"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("\"sf__Id\",\"sf__Error\",\"Name\"\n\"\",\"REQUIRED_FIELD_MISSING\",\"\"\n"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let ok = client.get_successful_results("751X").await.unwrap();
        assert!(ok.contains("sf__Id"));
        let failed = client.get_failed_results("751X").await.unwrap();
        assert!(failed.contains("REQUIRED_FIELD_MISSING"));
    }
}
