pub mod blobs;
pub mod engine;
pub mod soql;

pub use blobs::{blob_field, BlobDownloader, BLOB_PATH_COLUMN};
pub use engine::{ExtractEngine, ExtractOutcome, ExtractRequest};
