use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// `InvalidTrigger` and `InvalidPayload` are caller errors raised at creation
/// time. The delivery variants are produced at fire time and never reach the
/// original requester; they only show up in job state and logs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger definition is malformed (bad cron, unknown timezone, zero interval).
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// The target selector or message content is malformed.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Gateway timeout, rate limit or outage; retried with backoff.
    #[error("Transient delivery failure: {0}")]
    TransientDelivery(String),

    /// Invalid or unregistered target; never retried.
    #[error("Permanent delivery failure: {0}")]
    PermanentDelivery(String),

    /// A state transition raced or found the job in an unexpected state.
    #[error("Store consistency error: {0}")]
    StoreConsistency(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidTrigger(_) => "INVALID_TRIGGER",
            SchedulerError::InvalidPayload(_) => "INVALID_PAYLOAD",
            SchedulerError::TransientDelivery(_) => "TRANSIENT_DELIVERY",
            SchedulerError::PermanentDelivery(_) => "PERMANENT_DELIVERY",
            SchedulerError::StoreConsistency(_) => "STORE_CONSISTENCY",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Caller errors: rejected synchronously, never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTrigger(_) | SchedulerError::InvalidPayload(_)
        )
    }
}

impl From<herald_core::HeraldError> for SchedulerError {
    fn from(e: herald_core::HeraldError) -> Self {
        match e {
            herald_core::HeraldError::InvalidPayload(msg) => SchedulerError::InvalidPayload(msg),
            other => SchedulerError::InvalidPayload(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
