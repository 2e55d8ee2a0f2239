use crate::ObjectKey;

/// Errors returned by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict on {key}: {message}")]
    Conflict { key: ObjectKey, message: String },
    #[error("already exists: {0}")]
    AlreadyExists(ObjectKey),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out")]
    Timeout,
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn conflict(key: ObjectKey, message: impl Into<String>) -> Self {
        Self::Conflict { key, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    /// Conflicts, timeouts and unavailability clear up on their own and are
    /// retried through the work queue backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_) | Self::Unavailable(_) | Self::Timeout)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reading the shape of an object or the engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("object missing {0}")]
    MissingField(&'static str),
    #[error("invalid managementState {0:?} (expected Managed, Unmanaged or Removed)")]
    InvalidManagementState(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}
