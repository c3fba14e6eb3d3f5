use thiserror::Error;

/// Errors surfaced to callers of the scheduler's admin API.
///
/// Run failures are never surfaced here: they are recorded on the
/// affected job (`last_status`, `last_error`, `consecutive_failures`)
/// and observed via `get`/`list`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed create/rename input. No state was mutated.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The tenant already owns the maximum number of jobs.
    #[error("Job limit reached for chat {tenant}: max {limit} jobs")]
    QuotaExceeded { tenant: i64, limit: usize },

    /// The schedule definition is malformed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Persisting the job snapshot failed after the rename retry.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
