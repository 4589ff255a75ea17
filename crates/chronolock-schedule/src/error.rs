use thiserror::Error;

/// Errors raised while building, restoring or evaluating a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// The stored type tag has no registered schedule kind.
    #[error("Unknown schedule kind: {0}")]
    UnknownKind(String),

    #[error("Invalid properties for {kind} schedule: {reason}")]
    InvalidProperties { kind: &'static str, reason: String },

    #[error("Invalid calendar: {0}")]
    Calendar(String),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
