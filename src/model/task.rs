use serde::{Deserialize, Serialize};

use super::descriptor::ObjectDescriptor;

/// Lifecycle of one object's extract pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the work queue.
    Pending,

    /// Claimed by a worker.
    Running,

    /// Terminal: extract and sink write confirmed.
    Completed,

    /// Terminal: classified as unrecoverable for this object.
    Failed { error: String },

    /// Terminal: object cannot be handled and was skipped.
    Skipped { reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }
}

/// Pipeline metrics accumulated while a task runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub records: u64,
    pub bytes: u64,
    pub duration_ms: u64,
    pub warning: Option<String>,
}

/// One selected object moving through the backup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectTask {
    pub descriptor: ObjectDescriptor,
    pub status: TaskStatus,

    /// Field projection; `None` means all queryable fields.
    pub selected_fields: Option<Vec<String>>,

    /// Extra predicate applied on top of the incremental decision.
    pub where_clause: Option<String>,

    /// 0 = unlimited.
    pub record_limit: u64,

    pub metrics: TaskMetrics,
}

impl ObjectTask {
    pub fn new(descriptor: ObjectDescriptor) -> Self {
        Self {
            descriptor,
            status: TaskStatus::Pending,
            selected_fields: None,
            where_clause: None,
            record_limit: 0,
            metrics: TaskMetrics::default(),
        }
    }

    pub fn object_name(&self) -> &str {
        &self.descriptor.name
    }

    /// Field names this task will project: the explicit selection, or every
    /// field the descriptor carries.
    pub fn projected_fields(&self) -> Vec<String> {
        match &self.selected_fields {
            Some(fields) => fields.clone(),
            None => self.descriptor.field_names(),
        }
    }

    /// Move to a terminal status. The first terminal transition wins; later
    /// attempts are ignored so a task ends exactly once.
    pub fn finish(&mut self, status: TaskStatus) -> bool {
        debug_assert!(status.is_terminal(), "finish() takes terminal statuses only");
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    pub fn start(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Running;
        }
    }
}
