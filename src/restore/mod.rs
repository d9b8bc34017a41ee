pub mod engine;
pub mod mapping;
pub mod order;
pub mod transform;

pub use engine::{
    DryRunPreview, ObjectRestoreResult, RestoreDataset, RestoreEngine, RestoreOptions,
    RestoreReport,
};
pub use mapping::IdMapping;
pub use order::{DeferredLookup, LookupEdge, RestorePlan};
pub use transform::TransformConfig;
