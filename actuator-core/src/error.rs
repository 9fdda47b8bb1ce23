use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lease mismatch: {0}")]
    LeaseMismatch(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Lease-holder and state violations are expected under contention and
    /// are reported by callers at a lower severity than infrastructure errors.
    pub fn is_lease_conflict(&self) -> bool {
        matches!(
            self,
            ExecutionError::LeaseMismatch(_)
                | ExecutionError::InvalidTransition(_)
                | ExecutionError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
