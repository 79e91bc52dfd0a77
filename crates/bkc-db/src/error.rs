use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of the durable store. Every variant leaves durable state unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity, pool exhaustion, serialization failure, deadlock. Retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: i64, need: i64 },

    #[error("insufficient reserve: available {available}, need {need}")]
    InsufficientReserve { available: i64, need: i64 },

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The operation would break a ledger invariant and was aborted.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let code = db.code().map(|c| c.into_owned());
            let message = db.message().to_string();
            match code.as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    return StoreError::Unavailable(message)
                }
                // check_violation
                Some("23514") => return StoreError::Invariant(message),
                _ => {}
            }
        }
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Database(other),
        }
    }
}
