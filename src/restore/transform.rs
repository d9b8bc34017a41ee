use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Fields holding user references that cross-tenant loads must remap.
pub const USER_REFERENCE_FIELDS: &[&str] = &["OwnerId", "CreatedById", "LastModifiedById"];

const RECORD_TYPE_FIELD: &str = "RecordTypeId";

/// Cross-tenant transformation applied to every row before submission:
/// user references, record type ids, and per-field picklist values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Source user id (or username) -> target user id
    #[serde(default)]
    pub user_map: HashMap<String, String>,

    /// Source record type id -> target record type id
    #[serde(default)]
    pub record_type_map: HashMap<String, String>,

    /// Field name -> (source picklist value -> target value)
    #[serde(default)]
    pub picklist_map: HashMap<String, HashMap<String, String>>,
}

impl TransformConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read transform config {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse transform config")
    }

    pub fn is_empty(&self) -> bool {
        self.user_map.is_empty() && self.record_type_map.is_empty() && self.picklist_map.is_empty()
    }

    /// Remap one row in place. Values without a mapping pass through.
    pub fn apply(&self, headers: &[String], row: &mut [String]) {
        for (i, header) in headers.iter().enumerate() {
            let Some(value) = row.get_mut(i) else { continue };
            if value.is_empty() {
                continue;
            }

            if USER_REFERENCE_FIELDS
                .iter()
                .any(|f| f.eq_ignore_ascii_case(header))
            {
                if let Some(mapped) = self.user_map.get(value.as_str()) {
                    *value = mapped.clone();
                }
            } else if header.eq_ignore_ascii_case(RECORD_TYPE_FIELD) {
                if let Some(mapped) = self.record_type_map.get(value.as_str()) {
                    *value = mapped.clone();
                }
            } else if let Some(field_map) = self.picklist_map.get(header) {
                if let Some(mapped) = field_map.get(value.as_str()) {
                    *value = mapped.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_user_reference_remapping() {
        let mut config = TransformConfig::default();
        config
            .user_map
            .insert("005OLD".to_string(), "005NEW".to_string());

        let h = headers(&["Name", "OwnerId", "CreatedById"]);
        let mut r = row(&["Acme", "005OLD", "005OLD"]);
        config.apply(&h, &mut r);

        assert_eq!(r, row(&["Acme", "005NEW", "005NEW"]));
    }

    #[test]
    fn test_record_type_remapping() {
        let mut config = TransformConfig::default();
        config
            .record_type_map
            .insert("012OLD".to_string(), "012NEW".to_string());

        let h = headers(&["RecordTypeId", "Name"]);
        let mut r = row(&["012OLD", "Acme"]);
        config.apply(&h, &mut r);

        assert_eq!(r[0], "012NEW");
        assert_eq!(r[1], "Acme");
    }

    #[test]
    fn test_picklist_remapping_is_per_field() {
        let mut config = TransformConfig::default();
        let mut industry = HashMap::new();
        industry.insert("Tech".to_string(), "Technology".to_string());
        config.picklist_map.insert("Industry".to_string(), industry);

        let h = headers(&["Industry", "Segment"]);
        let mut r = row(&["Tech", "Tech"]);
        config.apply(&h, &mut r);

        assert_eq!(r[0], "Technology", "mapped field remapped");
        assert_eq!(r[1], "Tech", "other fields untouched");
    }

    #[test]
    fn test_unmapped_values_pass_through() {
        let mut config = TransformConfig::default();
        config
            .user_map
            .insert("005OLD".to_string(), "005NEW".to_string());

        let h = headers(&["OwnerId"]);
        let mut r = row(&["005OTHER"]);
        config.apply(&h, &mut r);
        assert_eq!(r[0], "005OTHER");

        let mut empty = row(&[""]);
        config.apply(&h, &mut empty);
        assert_eq!(empty[0], "");
    }

    #[test]
    fn test_empty_config_is_detectable() {
        assert!(TransformConfig::default().is_empty());

        let mut config = TransformConfig::default();
        config.user_map.insert("a".to_string(), "b".to_string());
        assert!(!config.is_empty());
    }
}
