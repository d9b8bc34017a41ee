use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::ObjectDescriptor;
use crate::relationships::RelationshipNode;

pub const RELATIONSHIP_MANIFEST_FILE: &str = "_relationship_manifest.json";
pub const BACKUP_MANIFEST_FILE: &str = "_manifest.json";

/// Descriptor of the related-records post-pass, written next to the CSVs so
/// a later restore knows how the datasets hang together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipManifest {
    pub generated_at: DateTime<Utc>,
    pub depth: u32,
    pub parents: Vec<String>,
    pub related_objects: Vec<RelatedObjectEntry>,
    pub restore_instructions: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedObjectEntry {
    pub object: String,
    pub parent_object: String,
    pub parent_field: String,
    pub depth: u32,
}

impl RelationshipManifest {
    pub fn new(depth: u32, parents: Vec<String>, nodes: &[RelationshipNode]) -> Self {
        Self {
            generated_at: Utc::now(),
            depth,
            parents,
            related_objects: nodes
                .iter()
                .map(|n| RelatedObjectEntry {
                    object: n.object.clone(),
                    parent_object: n.parent_object.clone(),
                    parent_field: n.parent_field.clone(),
                    depth: n.depth,
                })
                .collect(),
            restore_instructions: "Restore parents before children; remap each listed \
parent_field through the id mapping captured while parents load."
                .to_string(),
        }
    }

    pub async fn write(&self, dest_root: &Path) -> Result<()> {
        write_json(&dest_root.join(RELATIONSHIP_MANIFEST_FILE), self).await
    }
}

/// Field metadata, external-id map, and record-type map captured when
/// `preserve_relationships` is set; consumed by restore preflight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub generated_at: DateTime<Utc>,
    pub objects: Vec<ObjectManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectManifestEntry {
    pub object: String,
    pub fields: Vec<FieldMeta>,
    pub external_id_fields: Vec<String>,
    pub record_types: Vec<RecordTypeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: String,
    pub external_id: bool,
    pub reference_to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordTypeEntry {
    pub id: String,
    pub name: String,
}

impl ObjectManifestEntry {
    pub fn from_descriptor(
        descriptor: &ObjectDescriptor,
        record_types: Vec<RecordTypeEntry>,
    ) -> Self {
        Self {
            object: descriptor.name.clone(),
            fields: descriptor
                .fields
                .iter()
                .map(|f| FieldMeta {
                    name: f.name.clone(),
                    field_type: f.field_type.clone(),
                    external_id: f.external_id,
                    reference_to: f.reference_to.clone(),
                })
                .collect(),
            external_id_fields: descriptor.external_id_fields(),
            record_types,
        }
    }
}

impl BackupManifest {
    pub fn new(objects: Vec<ObjectManifestEntry>) -> Self {
        Self {
            generated_at: Utc::now(),
            objects,
        }
    }

    pub async fn write(&self, dest_root: &Path) -> Result<()> {
        write_json(&dest_root.join(BACKUP_MANIFEST_FILE), self).await
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize manifest")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(object: &str, parent: &str, field: &str, depth: u32) -> RelationshipNode {
        RelationshipNode {
            object: object.to_string(),
            parent_object: parent.to_string(),
            parent_field: field.to_string(),
            relationship_name: None,
            depth,
            priority: false,
        }
    }

    #[tokio::test]
    async fn test_relationship_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = RelationshipManifest::new(
            1,
            vec!["Account".to_string()],
            &[node("Contact", "Account", "AccountId", 1)],
        );
        manifest.write(dir.path()).await.unwrap();

        let raw =
            std::fs::read_to_string(dir.path().join(RELATIONSHIP_MANIFEST_FILE)).unwrap();
        let parsed: RelationshipManifest = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed.depth, 1);
        assert_eq!(parsed.parents, vec!["Account"]);
        assert_eq!(parsed.related_objects.len(), 1);
        assert_eq!(parsed.related_objects[0].object, "Contact");
        assert_eq!(parsed.related_objects[0].parent_field, "AccountId");
        assert!(!parsed.restore_instructions.is_empty());
    }

    #[tokio::test]
    async fn test_backup_manifest_captures_external_ids() {
        use crate::model::descriptor::FieldDescriptor;

        let descriptor = ObjectDescriptor {
            name: "Account".to_string(),
            label: "Account".to_string(),
            queryable: true,
            fields: vec![FieldDescriptor {
                name: "Legacy_Key__c".to_string(),
                field_type: "string".to_string(),
                external_id: true,
                reference_to: vec![],
                createable: true,
                updateable: true,
            }],
        };

        let entry = ObjectManifestEntry::from_descriptor(
            &descriptor,
            vec![RecordTypeEntry {
                id: "012000000000000AAA".to_string(),
                name: "Master".to_string(),
            }],
        );
        let manifest = BackupManifest::new(vec![entry]);

        let dir = tempfile::tempdir().unwrap();
        manifest.write(dir.path()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(BACKUP_MANIFEST_FILE)).unwrap();
        let parsed: BackupManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.objects[0].external_id_fields, vec!["Legacy_Key__c"]);
        assert_eq!(parsed.objects[0].record_types[0].name, "Master");
    }
}
