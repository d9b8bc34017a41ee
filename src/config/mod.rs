pub mod models;

pub use models::{
    AppConfig, BackupJobConfig, BackupTarget, CredentialHandle, LogRotation, RestoreJobConfig,
    RestoreMode, SavedConnection, UnresolvedReferencePolicy, DEFAULT_BATCH_SIZE,
    DEFAULT_INGEST_FANOUT, MAX_PARALLELISM,
};
