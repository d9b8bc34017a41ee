use serde::{Deserialize, Serialize};

use crate::api::SObjectDescribe;

/// Object name suffixes that never carry a modification timestamp.
///
/// Objects matching any of these are always queried in full, regardless of
/// incremental mode.
pub const NO_TIMESTAMP_SUFFIXES: &[&str] = &[
    "History",
    "__History",
    "__mdt",
    "Share",
    "__Share",
    "Feed",
    "ChangeEvent",
    "__ChangeEvent",
];

/// Schema snapshot for one object, built from describe and cached per
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub name: String,
    pub label: String,
    pub queryable: bool,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: String,
    pub external_id: bool,
    pub reference_to: Vec<String>,
    pub createable: bool,
    pub updateable: bool,
}

impl ObjectDescriptor {
    pub fn from_describe(describe: &SObjectDescribe) -> Self {
        Self {
            name: describe.name.clone(),
            label: describe.label.clone(),
            queryable: describe.queryable,
            fields: describe
                .fields
                .iter()
                .map(|f| FieldDescriptor {
                    name: f.name.clone(),
                    field_type: f.field_type.clone(),
                    external_id: f.external_id,
                    reference_to: f.reference_to.clone(),
                    createable: f.createable,
                    updateable: f.updateable,
                })
                .collect(),
        }
    }

    /// Whether delta queries on `LastModifiedDate` are possible for this
    /// object, per the suffix catalog.
    pub fn supports_last_modified(&self) -> bool {
        !NO_TIMESTAMP_SUFFIXES
            .iter()
            .any(|suffix| self.name.ends_with(suffix))
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Lookup fields pointing at a parent object.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.reference_to.is_empty())
    }

    pub fn external_id_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.external_id)
            .map(|f| f.name.clone())
            .collect()
    }
}
