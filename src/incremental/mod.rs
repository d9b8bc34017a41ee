use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::extract::soql;
use crate::model::{HistoryStore, ObjectDescriptor, TargetKind};
use crate::sink::Sink;

/// Query scope decided per object before the extract runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    Full,
    Delta { since: DateTime<Utc> },
}

impl QueryScope {
    pub fn is_delta(&self) -> bool {
        matches!(self, QueryScope::Delta { .. })
    }

    /// Predicate fragment for this scope; `None` for full queries.
    pub fn predicate(&self) -> Option<String> {
        match self {
            QueryScope::Full => None,
            QueryScope::Delta { since } => Some(format!(
                "LastModifiedDate > {}",
                format_watermark(*since)
            )),
        }
    }
}

/// ISO-8601 UTC rendering used in delta predicates and stored watermarks.
pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Decide full vs. delta for one object.
///
/// Rules, in order:
/// 1. recreate-tables sink: full.
/// 2. object outside the modification-timestamp catalog: full.
/// 3. table sink: delta from the sink's last confirmed write, else full.
///    file sink in incremental mode: delta from the last Completed run in
///    history for this user+object, else full.
pub async fn decide(
    descriptor: &ObjectDescriptor,
    sink: &dyn Sink,
    history: &HistoryStore,
    username: &str,
    incremental_requested: bool,
) -> Result<QueryScope> {
    if sink.target_kind() == TargetKind::Database && sink.recreate_tables() {
        return Ok(QueryScope::Full);
    }

    if !descriptor.supports_last_modified() {
        debug!("{}: no modification timestamp, forcing full", descriptor.name);
        return Ok(QueryScope::Full);
    }

    match sink.target_kind() {
        TargetKind::Database => {
            match sink.last_backup_timestamp(&descriptor.name).await? {
                Some(since) => Ok(QueryScope::Delta { since }),
                None => Ok(QueryScope::Full),
            }
        }
        TargetKind::File => {
            if !incremental_requested {
                return Ok(QueryScope::Full);
            }
            match history
                .last_completed_watermark(username, &descriptor.name)
                .await
            {
                Some(since) => Ok(QueryScope::Delta { since }),
                None => Ok(QueryScope::Full),
            }
        }
    }
}

/// Combine the scope predicate with a user-supplied WHERE fragment as
/// `(<incremental>) AND (<custom>)`; a typed `WHERE ` keyword is stripped.
pub fn effective_where(scope: &QueryScope, custom: Option<&str>) -> Option<String> {
    soql::merge_where(scope.predicate().as_deref(), custom)
}
