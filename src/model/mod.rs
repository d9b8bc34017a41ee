pub mod descriptor;
pub mod history;
pub mod run;
pub mod task;

pub use descriptor::{FieldDescriptor, ObjectDescriptor, NO_TIMESTAMP_SUFFIXES};
pub use history::{HistoryStore, RunHistory};
pub use run::{BackupRun, ObjectBackupResult, ObjectStatus, RunKind, RunStatus, TargetKind};
pub use task::{ObjectTask, TaskMetrics, TaskStatus};
