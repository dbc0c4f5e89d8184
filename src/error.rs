//! Error types for swe-harness operations.
//!
//! Defines error types for the major subsystems:
//! - Container engine access (image builds, container runs)
//! - Dataset and patch input loading
//! - Image graph construction
//! - Per-instance evaluation stages
//! - Batch-level failures
//!
//! Configuration errors live next to the configuration itself in
//! [`crate::harness::config`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker build failed: {0}")]
    BuildFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Container execution aborted")]
    Aborted,

    #[error("Failed to copy files to container: {0}")]
    CopyFailed(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading dataset or patch inputs.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in '{path}' at line {line}: {message}")]
    InvalidJson {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Invalid record in '{path}' at line {line}: {message}")]
    InvalidRecord {
        path: String,
        line: usize,
        message: String,
    },
}

/// Errors raised while assembling the image dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Image '{0}' is not part of the graph")]
    UnknownImage(String),

    #[error("Parent '{parent}' of image '{child}' is not part of the graph")]
    MissingParent { child: String, parent: String },

    #[error("Image '{0}' registered twice with different content")]
    ConflictingSpec(String),

    #[error("Dependency cycle detected through image '{0}'")]
    Cycle(String),

    #[error("No image template for ecosystem '{0}'")]
    UnknownEcosystem(String),
}

/// Classification of a stage failure, as recorded in an evaluation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BuildError,
    PatchApplyError,
    RunTimeoutError,
    RunExecutionError,
    EmptyResult,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildError => write!(f, "build_error"),
            Self::PatchApplyError => write!(f, "patch_apply_error"),
            Self::RunTimeoutError => write!(f, "run_timeout_error"),
            Self::RunExecutionError => write!(f, "run_execution_error"),
            Self::EmptyResult => write!(f, "empty_result"),
        }
    }
}

/// Failure of one stage of an instance pipeline.
///
/// Every variant except [`StageError::Aborted`] becomes an ERROR outcome in
/// the instance's evaluation record. An aborted instance produces no record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Image build failed for '{tag}': {message}")]
    Build { tag: String, message: String },

    #[error("Patch did not apply cleanly in stage '{stage}'")]
    PatchApply { stage: String },

    #[error("Stage '{stage}' timed out after {seconds} seconds")]
    RunTimeout { stage: String, seconds: u64 },

    #[error("Stage '{stage}' failed to execute: {message}")]
    RunExecution { stage: String, message: String },

    #[error("Stage '{stage}' produced no recognizable test results")]
    EmptyResult { stage: String },

    #[error("Evaluation aborted")]
    Aborted,
}

impl StageError {
    /// Returns the recorded error kind, or `None` for an abort.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Build { .. } => Some(ErrorKind::BuildError),
            Self::PatchApply { .. } => Some(ErrorKind::PatchApplyError),
            Self::RunTimeout { .. } => Some(ErrorKind::RunTimeoutError),
            Self::RunExecution { .. } => Some(ErrorKind::RunExecutionError),
            Self::EmptyResult { .. } => Some(ErrorKind::EmptyResult),
            Self::Aborted => None,
        }
    }
}

/// Batch-level failures: anything that stops a batch before or outside the
/// per-instance pipelines.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] crate::harness::ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("Report output failed: {0}")]
    Report(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_kinds() {
        let build = StageError::Build {
            tag: "x:base".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(build.kind(), Some(ErrorKind::BuildError));
        assert_eq!(
            StageError::PatchApply {
                stage: "fix_patch_run".to_string()
            }
            .kind(),
            Some(ErrorKind::PatchApplyError)
        );
        assert_eq!(StageError::Aborted.kind(), None);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::RunTimeoutError).unwrap();
        assert_eq!(json, "\"run_timeout_error\"");
        assert_eq!(format!("{}", ErrorKind::PatchApplyError), "patch_apply_error");
    }
}
