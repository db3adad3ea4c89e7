use thiserror::Error;

/// Failure taxonomy for lifecycle operations. Store faults carry detail for
/// the server log only; the HTTP layer flattens them to a generic message.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource not found")]
    NotFound,

    #[error("bot quota reached ({current}/{limit})")]
    QuotaExceeded { limit: u64, current: u64 },

    #[error("resource busy, retry later")]
    Busy,

    #[error("store error: {0}")]
    Store(String),
}

impl LifecycleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::Store(msg.to_string())
    }
}

impl From<diesel::result::Error> for LifecycleError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Store(err.to_string())
    }
}
