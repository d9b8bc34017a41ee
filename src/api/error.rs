use thiserror::Error;

/// Closed classification of remote failures observed during extraction.
///
/// The classifier owns every message-matching rule; callers branch on the
/// variant and never inspect remote error strings themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFault {
    /// Object cannot be queried through the Bulk API at all.
    UnsupportedByBulk,
    /// Tenant requires a filter predicate for this object.
    RequiresFilter,
    /// Object cannot be paginated past the first result set.
    PaginationUnsupported,
    /// Externally-mounted object; transient query restrictions apply.
    ExternalObject,
    /// Rows cannot be rendered as CSV by the remote.
    CsvSerialize,
    /// Metadata-backed object needs a reified-column filter.
    MetadataFilterRequired,
    /// Remote connection pool was shut down mid-flight.
    ConnectionPool,
    /// The download exhausted local memory.
    OutOfResources,
    /// Network or 5xx failure worth one retry.
    Transient,
    /// Everything else.
    Fatal,
}

impl ExtractFault {
    /// Faults that warrant one automatic reconnect + retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractFault::Transient | ExtractFault::ConnectionPool)
    }

    /// Faults that skip the object (result `Skipped`) instead of failing it.
    pub fn skips_object(&self) -> bool {
        matches!(
            self,
            ExtractFault::UnsupportedByBulk
                | ExtractFault::RequiresFilter
                | ExtractFault::PaginationUnsupported
                | ExtractFault::ExternalObject
                | ExtractFault::CsvSerialize
                | ExtractFault::MetadataFilterRequired
        )
    }

    /// Remediation hint surfaced with the object result, where one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ExtractFault::RequiresFilter | ExtractFault::MetadataFilterRequired => {
                Some("try a WHERE filter for this object")
            }
            ExtractFault::UnsupportedByBulk => Some("object not supported by Bulk API"),
            ExtractFault::OutOfResources => {
                Some("increase available memory or lower the record limit")
            }
            _ => None,
        }
    }
}

/// Error from the tenant API layer, before classification.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication rejected by tenant: {0}")]
    Auth(String),

    #[error("{message}")]
    Remote { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ApiError {
    /// HTTP status carried by the error, if the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Auth(_) => Some(401),
            ApiError::Remote { status, .. } => Some(*status),
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            ApiError::Protocol(_) => None,
        }
    }

    /// Classify this error into the closed extract fault taxonomy.
    pub fn classify(&self) -> ExtractFault {
        match self {
            ApiError::Network(_) => ExtractFault::Transient,
            ApiError::Auth(_) => ExtractFault::Fatal,
            ApiError::Protocol(_) => ExtractFault::Fatal,
            ApiError::Remote { status, message } => classify_remote(*status, message),
        }
    }
}

/// Map a remote status + message onto an [`ExtractFault`].
///
/// Matching is ordered; the first rule wins. Message fragments mirror what
/// the tenant actually sends, so they are matched case-sensitively except
/// where the remote is known to vary.
pub fn classify_remote(status: u16, message: &str) -> ExtractFault {
    if message.contains("not supported by the Bulk API") || message.contains("INVALIDENTITY") {
        return ExtractFault::UnsupportedByBulk;
    }
    if message.contains("Implementation restriction") || message.contains("requires a filter") {
        return ExtractFault::RequiresFilter;
    }
    if message.contains("EXCEEDED_ID_LIMIT") || message.contains("does not support queryMore") {
        return ExtractFault::PaginationUnsupported;
    }
    if message.contains("EXTERNAL_OBJECT_EXCEPTION") || message.contains("Transient queries") {
        return ExtractFault::ExternalObject;
    }
    if message.contains("Cannot serialize") || message.contains("CSV format") {
        return ExtractFault::CsvSerialize;
    }
    if message.contains("MALFORMED_QUERY") && message.contains("reified column") {
        return ExtractFault::MetadataFilterRequired;
    }
    if message.contains("Connection pool shut down") || message.contains("Pool closed") {
        return ExtractFault::ConnectionPool;
    }
    if message.contains("OutOfMemory") {
        return ExtractFault::OutOfResources;
    }
    if status >= 500 {
        return ExtractFault::Transient;
    }
    ExtractFault::Fatal
}

/// Terminal failure of one extract attempt.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Cooperative cancellation observed mid-extract.
    #[error("extract cancelled")]
    Cancelled,

    /// Classified remote failure.
    #[error("{message}")]
    Fault { fault: ExtractFault, message: String },
}

impl ExtractError {
    pub fn fault(fault: ExtractFault, message: impl Into<String>) -> Self {
        ExtractError::Fault {
            fault,
            message: clean_message(&message.into()),
        }
    }

    pub fn from_api(err: &ApiError) -> Self {
        ExtractError::fault(err.classify(), err.to_string())
    }
}

/// Strip internal stage prefixes so users see the remote message itself.
pub fn clean_message(message: &str) -> String {
    const PREFIXES: &[&str] = &[
        "Failed to create query job: ",
        "Failed to poll query job: ",
        "Failed to fetch query results: ",
        "Failed to create ingest job: ",
        "Failed to upload ingest data: ",
    ];

    let mut cleaned = message;
    for prefix in PREFIXES {
        if let Some(rest) = cleaned.strip_prefix(prefix) {
            cleaned = rest;
        }
    }
    cleaned.trim().to_string()
}
