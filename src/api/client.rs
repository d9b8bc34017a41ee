use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::ApiError;

pub const DEFAULT_API_VERSION: &str = "62.0";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for one authenticated tenant session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base instance URL, e.g. `https://example.my.tenant.com`.
    pub instance_url: String,

    /// Bearer session token (opaque; obtained from the credential store).
    pub access_token: String,

    /// Pinned API version, e.g. `62.0`.
    pub api_version: String,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ClientConfig {
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            access_token: access_token.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Authenticated HTTP client for one tenant.
///
/// Proxy environment variables (`HTTP_PROXY`, `HTTPS_PROXY`, `NO_PROXY`) are
/// honored through the system-proxy default of the underlying client.
/// `reconnect` rebuilds the connection pool in place; callers keep using the
/// same handle.
pub struct TenantClient {
    config: ClientConfig,
    http: RwLock<reqwest::Client>,
}

impl TenantClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Self::build_http(&config)?;
        Ok(Self {
            config,
            http: RwLock::new(http),
        })
    }

    fn build_http(config: &ClientConfig) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
            .context("Access token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert("X-PrettyPrint", HeaderValue::from_static("0"));

        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .context("Failed to build HTTP client")
    }

    /// Drop the current connection pool and build a fresh one.
    ///
    /// Used by the single automatic retry after a transient or pool-shutdown
    /// fault.
    pub fn reconnect(&self) -> Result<()> {
        warn!("Rebuilding tenant HTTP connection pool");
        let fresh = Self::build_http(&self.config)?;
        let mut guard = self
            .http
            .write()
            .map_err(|_| anyhow::anyhow!("HTTP client lock poisoned"))?;
        *guard = fresh;
        Ok(())
    }

    pub fn api_version(&self) -> &str {
        &self.config.api_version
    }

    fn http(&self) -> reqwest::Client {
        // Client is a cheap handle; clone out so the lock is never held
        // across a request.
        self.http
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Absolute URL for a versioned data-API path.
    pub fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.config.instance_url.trim_end_matches('/'),
            self.config.api_version,
            path.trim_start_matches('/')
        )
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.data_url(path);
        debug!("GET {}", url);
        let response = self.http().get(&url).send().await?;
        Self::decode_json(response).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = self.data_url(path);
        debug!("POST {}", url);
        let response = self.http().post(&url).json(body).send().await?;
        Self::decode_json(response).await
    }

    pub async fn patch_json(&self, path: &str, body: &serde_json::Value) -> Result<(), ApiError> {
        let url = self.data_url(path);
        debug!("PATCH {}", url);
        let response = self.http().patch(&url).json(body).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let url = self.data_url(path);
        debug!("DELETE {}", url);
        let response = self.http().delete(&url).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// PUT a raw CSV body (ingest batch upload).
    pub async fn put_csv(&self, path: &str, csv: String) -> Result<(), ApiError> {
        let url = self.data_url(path);
        debug!("PUT {} ({} bytes)", url, csv.len());
        let response = self
            .http()
            .put(&url)
            .header("Content-Type", "text/csv")
            .body(csv)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// GET returning the raw response for CSV/binary payloads.
    pub async fn get_raw(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.data_url(path);
        debug!("GET {} (raw)", url);
        let response = self.http().get(&url).query(query).send().await?;
        Self::check_status(response).await
    }

    /// Fetch a record's binary field body.
    pub async fn get_blob(&self, object: &str, id: &str, field: &str) -> Result<Vec<u8>, ApiError> {
        let path = format!("sobjects/{}/{}/{}", object, id, field);
        let response = self.get_raw(&path, &[]).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = parse_remote_error(&body);

        if status.as_u16() == 401 {
            return Err(ApiError::Auth(message));
        }
        Err(ApiError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

/// Flatten the remote error body into one line.
///
/// The tenant answers errors as a JSON array of `{errorCode, message}`
/// entries; anything else is passed through verbatim.
fn parse_remote_error(body: &str) -> String {
    if let Ok(serde_json::Value::Array(entries)) = serde_json::from_str(body) {
        let lines: Vec<String> = entries
            .iter()
            .filter_map(|e| {
                let message = e.get("message").and_then(|m| m.as_str())?;
                match e.get("errorCode").and_then(|c| c.as_str()) {
                    Some(code) => Some(format!("{}: {}", code, message)),
                    None => Some(message.to_string()),
                }
            })
            .collect();
        if !lines.is_empty() {
            return lines.join("; ");
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "remote returned an empty error body".to_string()
    } else {
        trimmed.to_string()
    }
}
