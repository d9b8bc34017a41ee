use anyhow::Result;
use std::collections::{HashMap, HashSet};

use crate::relationships::{in_clause, RelationshipAnalyzer, RelationshipNode};

/// One user-confirmed related entry (flat list, no discovery).
#[derive(Debug, Clone)]
pub struct RelatedEntry {
    pub child_object: String,
    pub parent_object: String,
    pub parent_field: String,
}

/// User-confirmed selection of related records; when absent the analyzer
/// auto-discovers instead.
#[derive(Debug, Clone, Default)]
pub struct RelatedSelection {
    pub entries: Vec<RelatedEntry>,
}

impl RelatedSelection {
    /// Selection entries as depth-1 relationship nodes.
    pub fn as_nodes(&self) -> Vec<RelationshipNode> {
        self.entries
            .iter()
            .map(|e| RelationshipNode {
                object: e.child_object.clone(),
                parent_object: e.parent_object.clone(),
                parent_field: e.parent_field.clone(),
                relationship_name: None,
                depth: 1,
                priority: false,
            })
            .collect()
    }
}

/// Grouped child extract derived from the discovery pass: one task per child
/// object, multiple lookup fields collapsed into a single OR predicate.
#[derive(Debug, Clone)]
pub struct RelatedBackupTask {
    pub child_object: String,
    pub parent_fields: Vec<String>,
    pub where_fragment: String,
    pub depth: u32,
}

/// Union of discovered relationship nodes across all parents, deduplicated
/// on (child, parent field).
pub async fn discover_nodes(
    analyzer: &RelationshipAnalyzer,
    parents: &[String],
    max_depth: u32,
    priority_only: bool,
) -> Result<Vec<RelationshipNode>> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut nodes = Vec::new();

    for parent in parents {
        let tree = analyzer.build_tree(parent, max_depth).await?;
        for node in tree.nodes {
            if priority_only && !node.priority {
                continue;
            }
            if seen.insert((node.object.clone(), node.parent_field.clone())) {
                nodes.push(node);
            }
        }
    }
    Ok(nodes)
}

/// Group one discovery level into executable tasks.
///
/// Children already backed up in this run are dropped (dedup set); children
/// whose parent produced no ids are dropped too, since their predicate would
/// match nothing.
pub fn group_level_tasks(
    nodes: &[RelationshipNode],
    level: u32,
    parent_ids: &HashMap<String, Vec<String>>,
    already_backed_up: &HashSet<String>,
) -> Vec<RelatedBackupTask> {
    let mut grouped: HashMap<String, RelatedBackupTask> = HashMap::new();

    for node in nodes.iter().filter(|n| n.depth == level) {
        if already_backed_up.contains(&node.object) {
            continue;
        }
        let Some(ids) = parent_ids.get(&node.parent_object).filter(|ids| !ids.is_empty())
        else {
            continue;
        };

        let fragment = in_clause(&node.parent_field, ids);
        let task = grouped
            .entry(node.object.clone())
            .or_insert_with(|| RelatedBackupTask {
                child_object: node.object.clone(),
                parent_fields: Vec::new(),
                where_fragment: String::new(),
                depth: level,
            });

        if task.parent_fields.contains(&node.parent_field) {
            continue;
        }
        task.parent_fields.push(node.parent_field.clone());
        if task.where_fragment.is_empty() {
            task.where_fragment = fragment;
        } else {
            task.where_fragment = format!("{} OR {}", task.where_fragment, fragment);
        }
    }

    let mut tasks: Vec<RelatedBackupTask> = grouped.into_values().collect();
    tasks.sort_by(|a, b| a.child_object.cmp(&b.child_object));
    tasks
}
