use thiserror::Error;

/// Error type for the data-access layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Record exists but is not in a usable shape
    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },

    /// Backend failure (connection, lock poisoning, ...)
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
