//! Top-level error types for commsmap.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the process should exit non-zero without any retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Corrupt(_)))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Event store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("store is busy: {0}")]
    Busy(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Sync orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync already running for adapter {0}")]
    Busy(String),

    #[error("adapter {name} is not ready: {missing} ({remediation})")]
    NotReady {
        name: String,
        missing: String,
        remediation: String,
    },

    #[error("sync cancelled")]
    Cancelled,

    #[error("failed to launch background sync: {0}")]
    Background(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identity resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("proposal {0} not found")]
    ProposalNotFound(String),

    #[error("proposal {id} is {status}, expected pending")]
    ProposalNotPending { id: String, status: String },

    #[error("person {0} is tombstoned")]
    PersonTombstoned(String),

    #[error("cannot merge a person into itself: {0}")]
    SelfMerge(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Compute engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("rate limited by provider{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("transient API failure: {0}")]
    Transient(String),

    #[error("API request failed: {0}")]
    Api(String),

    #[error("model output failed schema validation: {0}")]
    Schema(String),

    #[error("unknown analysis type: {0}")]
    UnknownAnalysisType(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComputeError {
    /// Transient and rate-limit failures are retried; the rest are terminal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ComputeError::RateLimited { .. } | ComputeError::Transient(_)
        )
    }
}
