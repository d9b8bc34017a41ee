use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ceiling on concurrent extract workers, motivated by the remote tenant's
/// concurrent-job limits.
pub const MAX_PARALLELISM: usize = 15;

/// Default rows per ingest batch on restore.
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Concurrent ingest batches within one object on restore.
pub const DEFAULT_INGEST_FANOUT: usize = 3;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_HISTORY_FILE: &str = ".orgvault_history.json";
const DEFAULT_RELATIONSHIP_DEPTH: u32 = 1;

#[inline]
fn default_parallelism() -> usize {
    MAX_PARALLELISM
}

#[inline]
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[inline]
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[inline]
fn default_history_path() -> PathBuf {
    PathBuf::from(DEFAULT_HISTORY_FILE)
}

#[inline]
fn default_relationship_depth() -> u32 {
    DEFAULT_RELATIONSHIP_DEPTH
}

#[inline]
fn default_api_version() -> String {
    crate::api::client::DEFAULT_API_VERSION.to_string()
}

/// Top-level configuration loaded from the `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connection to the source (backup) or target (restore) tenant
    pub connection: SavedConnection,

    /// Backup job parameters (required for the backup subcommand)
    #[serde(default)]
    pub backup: Option<BackupJobConfig>,

    /// Restore job parameters (required for the restore subcommand)
    #[serde(default)]
    pub restore: Option<RestoreJobConfig>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file directory (if None, only console logging)
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log file rotation strategy
    #[serde(default)]
    pub log_rotation: LogRotation,

    /// Run history file path
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

/// Log file rotation strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate daily
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}

impl Default for LogRotation {
    fn default() -> Self {
        LogRotation::Daily
    }
}

/// Persistent connection entry; the credential itself lives in an external
/// store and is referenced through an opaque handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedConnection {
    /// Display name of the connection
    pub name: String,

    /// Instance base URL, e.g. `https://example.my.tenant.com`
    pub instance_url: String,

    /// Authenticated username (keys the per-user backup history)
    pub username: String,

    /// Pinned API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Where to resolve the session token from
    #[serde(default)]
    pub credential: CredentialHandle,
}

/// Opaque pointer into the external credential store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CredentialHandle {
    /// Read the token from an environment variable
    Env { var: String },

    /// Read the token from a file (trailing whitespace trimmed)
    File { path: PathBuf },
}

impl Default for CredentialHandle {
    fn default() -> Self {
        CredentialHandle::Env {
            var: "ORGVAULT_ACCESS_TOKEN".to_string(),
        }
    }
}

impl CredentialHandle {
    /// Resolve the handle to the actual session token.
    pub fn resolve(&self) -> Result<String> {
        match self {
            CredentialHandle::Env { var } => match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
                _ => bail!("Environment variable {} is not set or empty", var),
            },
            CredentialHandle::File { path } => {
                let token = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("Cannot read credential file {}: {}", path.display(), e))?;
                if token.trim().is_empty() {
                    bail!("Credential file {} is empty", path.display());
                }
                Ok(token.trim().to_string())
            }
        }
    }
}

/// Backup output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackupTarget {
    /// CSV files under the output root
    File {
        /// Zip the CSVs at end of run
        #[serde(default)]
        compress: bool,
    },

    /// Relational warehouse reachable at `url`
    Database {
        url: String,

        /// Drop and recreate tables instead of appending deltas
        #[serde(default)]
        recreate_tables: bool,
    },
}

/// Individual backup job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJobConfig {
    /// Objects to back up; empty means every queryable object
    #[serde(default)]
    pub objects: Vec<String>,

    /// Root directory for CSV output and manifests
    pub output_root: PathBuf,

    #[serde(default = "BackupTarget::default_file")]
    pub target: BackupTarget,

    /// Concurrent object workers
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-object record cap; 0 = unlimited
    #[serde(default)]
    pub record_limit: u64,

    /// Prefer delta queries where the object and history allow it
    #[serde(default)]
    pub incremental: bool,

    /// Extra WHERE fragment applied to every object
    #[serde(default)]
    pub custom_where: Option<String>,

    /// Run the related-records post-pass
    #[serde(default)]
    pub include_related: bool,

    /// Relationship discovery depth (1..=3)
    #[serde(default = "default_relationship_depth")]
    pub relationship_depth: u32,

    /// Restrict auto-discovered children to the priority allow-list
    #[serde(default)]
    pub priority_only: bool,

    /// Emit the field/external-id/record-type manifest for restore
    #[serde(default)]
    pub preserve_relationships: bool,
}

impl BackupTarget {
    fn default_file() -> Self {
        BackupTarget::File { compress: false }
    }
}

/// Restore write mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RestoreMode {
    /// Create new records; source ids remapped
    Insert,

    /// Match rows on an external id field
    Upsert { external_id_field: String },

    /// Overwrite records matched by Id
    Update,
}

/// What to do with a lookup value that has no id mapping yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedReferencePolicy {
    /// Blank the field and load the row
    DropField,

    /// Hold the whole row back for the deferred pass
    DeferRow,
}

impl Default for UnresolvedReferencePolicy {
    fn default() -> Self {
        UnresolvedReferencePolicy::DropField
    }
}

/// Individual restore job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJobConfig {
    /// Backup directory holding `<Object>.csv` datasets
    pub source_root: PathBuf,

    /// Objects to restore; empty means every CSV present in the source root
    #[serde(default)]
    pub objects: Vec<String>,

    pub mode: RestoreMode,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Abort the run on the first failed batch
    #[serde(default)]
    pub stop_on_error: bool,

    /// Describe target objects and check field names before loading
    #[serde(default)]
    pub validate_before_restore: bool,

    /// Keep source ids in the upload instead of dropping them
    #[serde(default)]
    pub preserve_ids: bool,

    /// Preview only; nothing is written to the target tenant
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub unresolved_references: UnresolvedReferencePolicy,

    /// Optional cross-tenant transformation config file
    #[serde(default)]
    pub transform: Option<PathBuf>,
}

impl AppConfig {
    /// Environment overrides for headless runs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("ORGVAULT_OUTPUT_ROOT") {
            if let Some(backup) = &mut self.backup {
                backup.output_root = PathBuf::from(root);
            }
        }
        if let Ok(parallelism) = std::env::var("ORGVAULT_PARALLELISM") {
            if let (Some(backup), Ok(n)) = (&mut self.backup, parallelism.parse::<usize>()) {
                backup.parallelism = n;
            }
        }
        if let Ok(batch) = std::env::var("ORGVAULT_BATCH_SIZE") {
            if let (Some(restore), Ok(n)) = (&mut self.restore, batch.parse::<usize>()) {
                restore.batch_size = n;
            }
        }
    }
}
