use chronolock_core::CoreError;
use chronolock_schedule::ScheduleError;
use thiserror::Error;

/// Errors surfaced by the job store.
///
/// A missing job or trigger is never an error: removals report `false` and
/// lookups return `None`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store call without `replace` hit an existing key.
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// A trigger references a job that is not stored.
    #[error("Trigger {trigger} references missing job {job}")]
    ReferentialViolation { trigger: String, job: String },

    /// Another live instance holds the lock. Retry on a later pass.
    #[error("Lock denied: {resource}")]
    LockDenied { resource: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// The database location could not be prepared.
    #[error("Store path unusable: {0}")]
    Io(#[from] std::io::Error),

    /// Acquire or fire called before [`crate::JobStore::startup`] succeeded.
    #[error("Job store not started")]
    NotStarted,

    /// Startup could not reconcile cluster state; the scheduler must not start.
    #[error("Cluster recovery failed: {reason}")]
    ClusterRecoveryFailure {
        reason: String,
        #[source]
        source: Option<Box<StoreError>>,
    },

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Calendar {name} is referenced by {triggers} trigger(s)")]
    CalendarInUse { name: String, triggers: usize },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unsupported payload version {0}")]
    UnsupportedPayloadVersion(u64),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] CoreError),
}

impl StoreError {
    /// Short, stable error code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StoreError::ReferentialViolation { .. } => "REFERENTIAL_VIOLATION",
            StoreError::LockDenied { .. } => "LOCK_DENIED",
            StoreError::StoreUnavailable(_) | StoreError::Io(_) => "STORE_UNAVAILABLE",
            StoreError::NotStarted => "NOT_STARTED",
            StoreError::ClusterRecoveryFailure { .. } => "CLUSTER_RECOVERY_FAILURE",
            StoreError::InvalidTrigger(_) => "INVALID_TRIGGER",
            StoreError::CalendarInUse { .. } => "CALENDAR_IN_USE",
            StoreError::Payload(_) => "PAYLOAD_ERROR",
            StoreError::UnsupportedPayloadVersion(_) => "UNSUPPORTED_PAYLOAD_VERSION",
            StoreError::Schedule(_) => "SCHEDULE_ERROR",
            StoreError::Config(e) => e.code(),
        }
    }

    /// Contention that a later attempt may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockDenied { .. } => true,
            StoreError::StoreUnavailable(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub(crate) fn recovery(reason: impl Into<String>, source: StoreError) -> Self {
        StoreError::ClusterRecoveryFailure {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// True when `e` is a UNIQUE / PRIMARY KEY violation.
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub type Result<T> = std::result::Result<T, StoreError>;
