//! Error types for the volume layer

use crate::poll::Timeout;
use dbaas_common::StoreError;
use thiserror::Error;

/// Error type for raw volume-provider calls
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-2xx status
    #[error("{operation} failed with status {status}: {body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// Connection, TLS or timeout failure before a response arrived
    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The provider answered 2xx with a body we could not interpret
    #[error("unexpected response to {operation}: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    /// No credentials configured for the environment
    #[error("no volume provider credentials for environment '{0}'")]
    UnknownEnvironment(String),

    /// Credentials present but unusable (bad header name, ...)
    #[error("invalid provider configuration: {0}")]
    Config(String),
}

impl ProviderError {
    /// HTTP status of a rejected call, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Error type for volume and snapshot lifecycle operations
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Snapshot finished with a warning status
    #[error("Backup was warning ({0})")]
    SnapshotWarning(String),

    /// Snapshot finished with an error status
    #[error("{0}")]
    SnapshotFailed(String),

    /// No snapshot could be produced or resolved
    #[error("{0}")]
    SnapshotNotFound(String),

    /// A polling budget ran out
    #[error(transparent)]
    Timeout(#[from] Timeout),
}

/// Result type for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, VolumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::Http {
            operation: "create_volume",
            status: 500,
            body: "quota exceeded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "create_volume failed with status 500: quota exceeded"
        );
        assert_eq!(err.status(), Some(500));

        let err = ProviderError::UnknownEnvironment("qa".to_string());
        assert_eq!(
            err.to_string(),
            "no volume provider credentials for environment 'qa'"
        );
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_volume_error_from() {
        let err: VolumeError = StoreError::not_found("volume", 1).into();
        assert!(matches!(err, VolumeError::Store(_)));

        let err: VolumeError = Timeout::new("snapshot snap-1 READY", 60).into();
        assert_eq!(
            err.to_string(),
            "snapshot snap-1 READY not reached after 60 attempts"
        );
    }
}
