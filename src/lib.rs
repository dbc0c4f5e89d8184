//! swe-harness: containerized evaluation of repository fix patches.
//!
//! Builds a layered image chain per task instance, runs the repository's
//! tests in three configurations (unmodified, test patch, test + fix patch),
//! parses the logs and classifies each instance as RESOLVED, UNRESOLVED or
//! ERROR.

pub mod cli;
pub mod dataset;
pub mod ecosystem;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod harness;
pub mod image;
pub mod parser;

pub use ecosystem::Ecosystem;
pub use error::{DatasetError, DockerError, ErrorKind, GraphError, HarnessError, StageError};
pub use harness::{ConfigError, HarnessConfig, Mode, Orchestrator};
