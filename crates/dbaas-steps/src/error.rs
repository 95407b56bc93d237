//! Error types for workflow steps
//!
//! Every failure a step can raise maps to one [`ErrorKind`], which is what
//! the executor reports alongside the message.

use dbaas_common::StoreError;
use dbaas_volume::{ProviderError, Timeout, VolumeError};
use thiserror::Error;

/// Failure of a script run on a host
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The script ran and exited non-zero
    #[error("script on {host} exited with {exit_code}: stdout={stdout:?} stderr={stderr:?}")]
    Failed {
        host: String,
        exit_code: i32,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },

    /// The connection to the host broke before a result arrived
    #[error("channel error on {host}: {reason}")]
    Channel { host: String, reason: String },
}

/// Failure reported by the engine driver
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query on {instance} failed: {reason}")]
    Query { instance: String, reason: String },

    #[error("no master instance found in infra {0}")]
    NoMaster(u64),

    #[error("engine driver error: {0}")]
    Driver(String),
}

/// Stable classification of step failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    SnapshotWarning,
    SnapshotError,
    NotFound,
    Timeout,
    Precondition,
    Remote,
    Engine,
    Store,
    Template,
    Irreversible,
    Failed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Provider => "provider",
            ErrorKind::SnapshotWarning => "snapshot_warning",
            ErrorKind::SnapshotError => "snapshot_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Remote => "remote",
            ErrorKind::Engine => "engine",
            ErrorKind::Store => "store",
            ErrorKind::Template => "template",
            ErrorKind::Irreversible => "irreversible",
            ErrorKind::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error type for step execution
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Plan script could not be rendered
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A record the step needs does not exist
    #[error("{0}")]
    NotFound(String),

    /// The context does not allow the step to run
    #[error("{0}")]
    Precondition(String),

    /// The step was asked to undo but has no compensation
    #[error("{0}")]
    Irreversible(String),

    /// A wait ran out of attempts
    #[error("{0}")]
    Timeout(String),

    /// Anything else, with a user-facing message
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Volume(e) => match e {
                VolumeError::Provider(_) => ErrorKind::Provider,
                VolumeError::Store(_) => ErrorKind::Store,
                VolumeError::SnapshotWarning(_) => ErrorKind::SnapshotWarning,
                VolumeError::SnapshotFailed(_) => ErrorKind::SnapshotError,
                VolumeError::SnapshotNotFound(_) => ErrorKind::NotFound,
                VolumeError::Timeout(_) => ErrorKind::Timeout,
            },
            StepError::Store(e) if e.is_not_found() => ErrorKind::NotFound,
            StepError::Store(_) => ErrorKind::Store,
            StepError::Remote(_) => ErrorKind::Remote,
            StepError::Engine(_) => ErrorKind::Engine,
            StepError::Template(_) => ErrorKind::Template,
            StepError::NotFound(_) => ErrorKind::NotFound,
            StepError::Precondition(_) => ErrorKind::Precondition,
            StepError::Irreversible(_) => ErrorKind::Irreversible,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Failed(_) => ErrorKind::Failed,
        }
    }
}

impl From<ProviderError> for StepError {
    fn from(e: ProviderError) -> Self {
        StepError::Volume(e.into())
    }
}

impl From<Timeout> for StepError {
    fn from(e: Timeout) -> Self {
        StepError::Volume(e.into())
    }
}

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err: StepError = ProviderError::Http {
            operation: "attach_disk",
            status: 500,
            body: "boom".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(err.to_string(), "attach_disk failed with status 500: boom");

        let err: StepError = StoreError::not_found("volume", 3).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: StepError = VolumeError::SnapshotWarning("snapshot 1".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::SnapshotWarning);

        let err = StepError::Irreversible("There is no rollback for this step.".to_string());
        assert_eq!(err.kind(), ErrorKind::Irreversible);
        assert_eq!(err.kind().to_string(), "irreversible");
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::Failed {
            host: "10.0.0.1".to_string(),
            exit_code: 2,
            stdout: vec![],
            stderr: vec!["no such file".to_string()],
        };
        assert!(err.to_string().contains("exited with 2"));
        assert!(err.to_string().contains("no such file"));
    }
}
