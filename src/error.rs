// ⚠️ Error taxonomy
//
// Invalid transitions are NOT errors (apply returns the client unchanged).
// Errors are reserved for broken preconditions, missing facility setup and
// store failures.

use thiserror::Error;

/// Failures raised by the document store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store lock poisoned: {0}")]
    Lock(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by the lifecycle core.
#[derive(Debug, Error)]
pub enum FunnelError {
    /// The requested operation would break a record invariant.
    #[error("precondition failed for client {client_id}: {reason}")]
    Precondition { client_id: String, reason: String },

    /// Facility capacity or start date is missing or unusable.
    #[error("facility is not configured: {reason}")]
    Configuration { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type FunnelResult<T> = Result<T, FunnelError>;

impl FunnelError {
    pub fn precondition(client_id: &str, reason: impl Into<String>) -> Self {
        FunnelError::Precondition {
            client_id: client_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        FunnelError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, FunnelError::Precondition { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, FunnelError::Configuration { .. })
    }
}
