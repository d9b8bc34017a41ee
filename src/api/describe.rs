use serde::{Deserialize, Serialize};

use super::client::TenantClient;
use super::error::ApiError;

/// One entry of the global object listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalObject {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub queryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalDescribe {
    #[serde(default)]
    pub sobjects: Vec<GlobalObject>,
}

/// Full per-object schema description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SObjectDescribe {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub queryable: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescribe>,
    #[serde(default)]
    pub child_relationships: Vec<ChildRelationship>,
    #[serde(default)]
    pub record_type_infos: Vec<RecordTypeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescribe {
    pub name: String,

    #[serde(rename = "type", default)]
    pub field_type: String,

    #[serde(default)]
    pub external_id: bool,

    /// Parent objects this lookup field points at; empty for non-references.
    #[serde(default)]
    pub reference_to: Vec<String>,

    #[serde(default)]
    pub createable: bool,

    #[serde(default)]
    pub updateable: bool,

    #[serde(default)]
    pub nillable: bool,
}

impl FieldDescribe {
    pub fn is_reference(&self) -> bool {
        !self.reference_to.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRelationship {
    #[serde(rename = "childSObject")]
    pub child_sobject: String,

    /// Lookup field on the child that stores this parent's id.
    pub field: String,

    #[serde(default)]
    pub relationship_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTypeInfo {
    pub record_type_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub developer_name: String,
    #[serde(default)]
    pub active: bool,
}

impl TenantClient {
    /// List every object the tenant exposes.
    pub async fn describe_global(&self) -> Result<GlobalDescribe, ApiError> {
        self.get_json("sobjects").await
    }

    /// Full schema for one object.
    pub async fn describe_sobject(&self, name: &str) -> Result<SObjectDescribe, ApiError> {
        self.get_json(&format!("sobjects/{}/describe", name)).await
    }

    /// Row count for an aggregate `SELECT COUNT()` query (preview displays).
    pub async fn query_count(&self, soql: &str) -> Result<u64, ApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CountResult {
            total_size: u64,
        }

        let result: CountResult = {
            let response = self.get_raw("query", &[("q", soql.to_string())]).await?;
            response
                .json()
                .await
                .map_err(|e| ApiError::Protocol(format!("malformed count response: {}", e)))?
        };
        Ok(result.total_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_describe_defaults() {
        // Minimal field JSON still deserializes; optional facets default off.
        let field: FieldDescribe =
            serde_json::from_str(r#"{"name":"Name","type":"string"}"#).unwrap();
        assert_eq!(field.name, "Name");
        assert_eq!(field.field_type, "string");
        assert!(!field.external_id);
        assert!(!field.is_reference());
    }

    #[test]
    fn test_reference_field_detection() {
        let field: FieldDescribe = serde_json::from_str(
            r#"{"name":"AccountId","type":"reference","referenceTo":["Account"]}"#,
        )
        .unwrap();
        assert!(field.is_reference());
        assert_eq!(field.reference_to, vec!["Account"]);
    }

    #[test]
    fn test_describe_deserializes_camel_case() {
        let describe: SObjectDescribe = serde_json::from_str(
            r#"{
                "name": "Contact",
                "label": "Contact",
                "queryable": true,
                "fields": [
                    {"name": "Id", "type": "id"},
                    {"name": "AccountId", "type": "reference", "referenceTo": ["Account"]}
                ],
                "childRelationships": [
                    {"childSObject": "Case", "field": "ContactId", "relationshipName": "Cases"}
                ],
                "recordTypeInfos": [
                    {"recordTypeId": "012000000000000AAA", "name": "Master", "active": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(describe.name, "Contact");
        assert!(describe.queryable);
        assert_eq!(describe.fields.len(), 2);
        assert_eq!(describe.child_relationships[0].child_sobject, "Case");
        assert_eq!(describe.child_relationships[0].field, "ContactId");
        assert_eq!(describe.record_type_infos[0].name, "Master");
    }
}
