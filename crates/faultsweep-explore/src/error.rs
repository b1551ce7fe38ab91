//! Errors surfaced to the test-integration layer.

use crate::execution::{ExecutionId, TestId};
use faultsweep_fault::{ConfigError, DeiError, DistributedExecutionIndex, TransformError};
use faultsweep_trace::ReportError;
use std::fmt;
use thiserror::Error;

/// Errors from the orchestrator.
///
/// Every error raised while an execution is running carries the
/// execution id, and the index of the failing call where there is one.
#[derive(Error, Debug)]
pub enum ExploreError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("execution {execution}: cannot index call")]
    IndexGeneration {
        execution: ExecutionId,
        #[source]
        source: DeiError,
    },

    #[error("malformed token {token:?}: {reason}")]
    MalformedToken { token: String, reason: String },

    #[error("unknown test {0}")]
    UnknownTest(TestId),

    #[error("test {0} already has an execution cycle")]
    TestAlreadyStarted(TestId),

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} is already finalized")]
    ExecutionFinalized(ExecutionId),

    #[error("execution {execution} failed: {reason}")]
    ExecutionFailed { execution: ExecutionId, reason: String },

    #[error("execution {execution} at {index}: protocol error")]
    Protocol {
        execution: ExecutionId,
        index: DistributedExecutionIndex,
        #[source]
        source: ReportError,
    },

    #[error("execution {execution} at {index}: no byzantine fault assigned")]
    NoTransformAssigned {
        execution: ExecutionId,
        index: DistributedExecutionIndex,
    },

    #[error("execution {execution} at {index}: transform failed")]
    Transform {
        execution: ExecutionId,
        index: DistributedExecutionIndex,
        #[source]
        source: TransformError,
    },
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Aborts the whole test run.
    Configuration,
    /// Fails one execution; exploration continues.
    Protocol,
    /// Fails one execution; exploration continues.
    Transform,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Transform => write!(f, "transform"),
        }
    }
}

impl ExploreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExploreError::Configuration(_)
            | ExploreError::IndexGeneration { .. }
            | ExploreError::TestAlreadyStarted(_)
            | ExploreError::UnknownTest(_) => ErrorKind::Configuration,
            ExploreError::Transform { .. } => ErrorKind::Transform,
            ExploreError::MalformedToken { .. }
            | ExploreError::UnknownExecution(_)
            | ExploreError::ExecutionFinalized(_)
            | ExploreError::ExecutionFailed { .. }
            | ExploreError::Protocol { .. }
            | ExploreError::NoTransformAssigned { .. } => ErrorKind::Protocol,
        }
    }

    /// Whether the whole test run must stop.
    pub fn aborts_test(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Execution the error belongs to, if any.
    pub fn execution(&self) -> Option<&ExecutionId> {
        match self {
            ExploreError::IndexGeneration { execution, .. }
            | ExploreError::ExecutionFailed { execution, .. }
            | ExploreError::Protocol { execution, .. }
            | ExploreError::NoTransformAssigned { execution, .. }
            | ExploreError::Transform { execution, .. } => Some(execution),
            ExploreError::UnknownExecution(execution)
            | ExploreError::ExecutionFinalized(execution) => Some(execution),
            _ => None,
        }
    }
}
