//! Error types for workflow execution

use dbaas_common::{Id, StoreError};
use dbaas_steps::{ErrorKind, StepError};
use thiserror::Error;

/// What compensation achieved after a step failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compensation {
    /// Steps whose undo ran, in the order they ran
    pub reverted: Vec<String>,
    /// Steps whose undo failed, with the failure message
    pub failed: Vec<(String, String)>,
    /// Irreversible step compensation stopped at
    pub halted_at: Option<String>,
}

impl Compensation {
    /// Every applied step was undone
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.halted_at.is_none()
    }
}

/// Error type for workflow execution
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step's forward effect failed; the source is the originating error
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        index: usize,
        #[source]
        source: StepError,
        compensation: Compensation,
    },

    /// Another pipeline holds the instance
    #[error("instance {0} already has a running pipeline")]
    InstanceBusy(Id),

    /// Operation rejected before anything ran, with a user-facing message
    #[error("{0}")]
    Precondition(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("cannot resume at step {index}: pipeline has {len} steps")]
    InvalidResume { index: usize, len: usize },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    /// Classification reported alongside the message
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::StepFailed { source, .. } => source.kind(),
            WorkflowError::Step(e) => e.kind(),
            WorkflowError::Store(e) if e.is_not_found() => ErrorKind::NotFound,
            WorkflowError::Store(_) => ErrorKind::Store,
            WorkflowError::InstanceBusy(_)
            | WorkflowError::Precondition(_)
            | WorkflowError::UnknownOperation(_)
            | WorkflowError::InvalidResume { .. } => ErrorKind::Precondition,
        }
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;
