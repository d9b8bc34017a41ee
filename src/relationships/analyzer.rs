use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::api::{SObjectDescribe, TenantClient};
use crate::extract::blobs::read_id_column;
use crate::extract::soql;

/// Child objects most commonly worth pulling alongside a parent. Advisory
/// only: the flag ranks suggestions and never affects correctness.
pub const PRIORITY_OBJECTS: &[&str] = &[
    "Contact",
    "Opportunity",
    "Case",
    "Task",
    "Event",
    "Note",
    "Attachment",
    "ContentVersion",
    "Lead",
    "Campaign",
    "CampaignMember",
    "OpportunityLineItem",
    "CaseComment",
];

/// Ids per IN group; keeps each predicate chunk under the backend's
/// clause-size limit.
pub const MAX_IN_CLAUSE_IDS: usize = 500;

/// One discovered child relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipNode {
    pub object: String,
    pub parent_object: String,
    /// Lookup field on the child storing the parent id.
    pub parent_field: String,
    pub relationship_name: Option<String>,
    pub depth: u32,
    pub priority: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipTree {
    pub root: String,
    pub nodes: Vec<RelationshipNode>,
}

impl RelationshipTree {
    /// Nodes at an exact depth, in discovery order.
    pub fn at_depth(&self, depth: u32) -> impl Iterator<Item = &RelationshipNode> {
        self.nodes.iter().filter(move |n| n.depth == depth)
    }
}

/// Discovers child relationships, extracts parent id sets, and builds the
/// chunked predicate fragments that pull only related children.
pub struct RelationshipAnalyzer {
    client: Arc<TenantClient>,
    cache: RwLock<HashMap<String, Arc<SObjectDescribe>>>,
}

impl RelationshipAnalyzer {
    pub fn new(client: Arc<TenantClient>) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Describe with a per-session cache; repeated trees over an unchanged
    /// schema are identical.
    pub async fn describe_cached(&self, object: &str) -> Result<Arc<SObjectDescribe>> {
        if let Some(hit) = self.cache.read().await.get(object) {
            return Ok(hit.clone());
        }

        let describe = Arc::new(
            self.client
                .describe_sobject(object)
                .await
                .with_context(|| format!("Failed to describe {}", object))?,
        );
        self.cache
            .write()
            .await
            .insert(object.to_string(), describe.clone());
        Ok(describe)
    }

    /// Breadth-first discovery of child relationships down to `max_depth`.
    ///
    /// Nodes are deduplicated on (child object, parent field) and sorted
    /// within each level so trees are stable across runs.
    pub async fn build_tree(&self, parent: &str, max_depth: u32) -> Result<RelationshipTree> {
        let mut nodes: Vec<RelationshipNode> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut frontier = vec![parent.to_string()];

        for depth in 1..=max_depth {
            let mut next_frontier = Vec::new();

            for object in &frontier {
                let describe = self.describe_cached(object).await?;

                let mut children: Vec<&crate::api::ChildRelationship> = describe
                    .child_relationships
                    .iter()
                    .filter(|c| c.relationship_name.is_some())
                    .collect();
                children.sort_by(|a, b| {
                    (&a.child_sobject, &a.field).cmp(&(&b.child_sobject, &b.field))
                });

                for child in children {
                    let key = (child.child_sobject.clone(), child.field.clone());
                    if !seen.insert(key) {
                        continue;
                    }

                    nodes.push(RelationshipNode {
                        object: child.child_sobject.clone(),
                        parent_object: object.clone(),
                        parent_field: child.field.clone(),
                        relationship_name: child.relationship_name.clone(),
                        depth,
                        priority: PRIORITY_OBJECTS.contains(&child.child_sobject.as_str()),
                    });
                    next_frontier.push(child.child_sobject.clone());
                }
            }

            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        debug!(
            "{}: discovered {} related objects to depth {}",
            parent,
            nodes.len(),
            max_depth
        );
        Ok(RelationshipTree {
            root: parent.to_string(),
            nodes,
        })
    }

    /// Id set of an already-extracted parent CSV, order-preserving dedup.
    pub fn extract_ids(&self, parent: &str, dest_root: &Path) -> Result<Vec<String>> {
        let csv_path = dest_root.join(format!("{}.csv", parent));
        let raw = read_id_column(&csv_path)?;

        let mut seen = HashSet::new();
        Ok(raw.into_iter().filter(|id| seen.insert(id.clone())).collect())
    }

    /// COUNT-shaped preview of how many child rows carry a parent value.
    pub async fn count_related(&self, child: &str, parent_field: &str) -> Result<u64> {
        let soql = soql::build_count_query(child, Some(&format!("{} != null", parent_field)));
        Ok(self.client.query_count(&soql).await?)
    }
}

/// `(field IN (...)) OR (field IN (...))`, id list chunked to stay under the
/// clause-size limit.
pub fn in_clause(field: &str, ids: &[String]) -> String {
    let chunks: Vec<String> = ids
        .chunks(MAX_IN_CLAUSE_IDS)
        .map(|chunk| {
            let quoted: Vec<String> = chunk
                .iter()
                .map(|id| format!("'{}'", id.replace('\'', "\\'")))
                .collect();
            format!("({} IN ({}))", field, quoted.join(","))
        })
        .collect();
    chunks.join(" OR ")
}

/// Disjunction over several lookup fields sharing one parent id set:
/// `(f1 IN (...)) OR (f2 IN (...))`.
pub fn build_where_multi_field(fields: &[String], ids: &[String]) -> String {
    fields
        .iter()
        .map(|field| in_clause(field, ids))
        .filter(|clause| !clause.is_empty())
        .collect::<Vec<_>>()
        .join(" OR ")
}
