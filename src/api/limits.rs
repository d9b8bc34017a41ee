use serde::Deserialize;
use std::collections::HashMap;

use super::client::TenantClient;
use super::error::ApiError;

/// One quota bucket as reported by the limits endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LimitUsage {
    pub max: i64,
    pub remaining: i64,
}

impl LimitUsage {
    pub fn used(&self) -> i64 {
        self.max - self.remaining
    }
}

/// Advisory tenant quotas; displayed, never enforced.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantLimits(pub HashMap<String, LimitUsage>);

impl TenantLimits {
    pub fn daily_api_requests(&self) -> Option<LimitUsage> {
        self.0.get("DailyApiRequests").copied()
    }

    pub fn daily_bulk_query_jobs(&self) -> Option<LimitUsage> {
        self.0.get("DailyBulkV2QueryJobs").copied()
    }
}

impl TenantClient {
    pub async fn get_limits(&self) -> Result<TenantLimits, ApiError> {
        self.get_json("limits").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_parse_known_buckets() {
        let limits: TenantLimits = serde_json::from_str(
            r#"{
                "DailyApiRequests": {"Max": 100000, "Remaining": 98000},
                "DailyBulkV2QueryJobs": {"Max": 10000, "Remaining": 9990},
                "SomethingElse": {"Max": 5, "Remaining": 5}
            }"#,
        )
        .unwrap();

        let api = limits.daily_api_requests().expect("bucket present");
        assert_eq!(api.max, 100000);
        assert_eq!(api.used(), 2000);

        let bulk = limits.daily_bulk_query_jobs().expect("bucket present");
        assert_eq!(bulk.remaining, 9990);
    }

    #[test]
    fn test_missing_buckets_are_none() {
        let limits: TenantLimits = serde_json::from_str("{}").unwrap();
        assert!(limits.daily_api_requests().is_none());
    }
}
