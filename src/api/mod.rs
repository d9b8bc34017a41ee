pub mod bulk_ingest;
pub mod bulk_query;
pub mod client;
pub mod describe;
pub mod error;
pub mod limits;

pub use bulk_ingest::{IngestJobInfo, IngestOperation};
pub use bulk_query::{BulkJobState, QueryJobInfo, QueryResultPage};
pub use client::{ClientConfig, TenantClient};
pub use describe::{ChildRelationship, FieldDescribe, GlobalObject, SObjectDescribe};
pub use error::{ApiError, ExtractError, ExtractFault};
pub use limits::TenantLimits;
