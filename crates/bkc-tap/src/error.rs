use bkc_db::StoreError;
use bkc_econ::UserId;
use thiserror::Error;

pub type TapResult<T> = Result<T, TapError>;
pub type SharedResult<T> = Result<T, SharedError>;

/// Failures of the shared cache/stream substrate.
#[derive(Debug, Error)]
pub enum SharedError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    #[error("optimistic transaction lost a race")]
    Conflict,

    #[error("corrupt shared entry {key}: {detail}")]
    Corrupt { key: String, detail: String },
}

impl SharedError {
    pub fn corrupt(key: impl Into<String>, detail: impl Into<String>) -> Self {
        SharedError::Corrupt {
            key: key.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TapError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shared(#[from] SharedError),

    /// The consistency gate could not drain the buffer before its deadline.
    #[error("tap queue busy, retry")]
    BufferBusy,

    #[error("tap contended after {attempts} attempts, retry")]
    Contended { attempts: u32 },

    /// The store rejected this user's buffered taps; an operator must release them.
    #[error("user {user_id} is quarantined: {reason}")]
    Quarantined { user_id: UserId, reason: String },
}

impl TapError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TapError::Store(e) => e.is_retryable(),
            TapError::Shared(SharedError::Corrupt { .. }) => false,
            TapError::Shared(_) => true,
            TapError::BufferBusy | TapError::Contended { .. } => true,
            TapError::Quarantined { .. } => false,
        }
    }
}
