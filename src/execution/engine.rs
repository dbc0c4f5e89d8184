//! Container engine abstraction.
//!
//! The harness only needs three things from a container runtime: the labels
//! of an existing image tag, building an image from an in-memory context, and
//! running one command in a fresh container. [`ContainerEngine`] captures
//! exactly that, so the orchestration code can be driven by Docker in
//! production and by a scripted engine in tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DockerError;
use crate::execution::signal::AbortSignal;

/// Host directory copied into an image build context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextDir {
    /// Directory on the host.
    pub host: PathBuf,
    /// Destination path inside the build context.
    pub dest: String,
}

/// Everything needed to build one image tag.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub tag: &'a str,
    pub dockerfile: &'a str,
    /// Extra context files, keyed by context-relative path.
    pub files: &'a BTreeMap<String, Vec<u8>>,
    pub context_dirs: &'a [ContextDir],
    pub labels: HashMap<String, String>,
}

/// Output of a successful build.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Concatenated build stream output.
    pub log: String,
}

/// One command to run in a fresh container.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Container name; must be unique among live containers.
    pub name: String,
    pub image: String,
    /// Shell command, run with `bash -c`.
    pub command: String,
    /// Files placed into the container before it starts, keyed by absolute
    /// container path.
    pub files: BTreeMap<String, Vec<u8>>,
    pub env: Vec<String>,
    /// Working directory of the command; the image default when `None`.
    pub working_dir: Option<String>,
    pub timeout: Duration,
    /// Time given to the container to stop on abort before it is killed.
    pub grace: Duration,
}

/// A finished container run.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub container_name: String,
    pub command: String,
    /// Combined stdout and stderr.
    pub log: String,
    pub exit_code: i64,
    pub duration: Duration,
}

/// Minimal container runtime used by the harness.
///
/// `run` must return [`DockerError::Timeout`] when the timeout elapses and
/// [`DockerError::Aborted`] when `abort` fires first; the container is
/// cleaned up in both cases.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Labels of a local image, or `None` when the tag does not exist.
    async fn image_labels(&self, tag: &str)
        -> Result<Option<HashMap<String, String>>, DockerError>;

    async fn build_image(&self, request: BuildRequest<'_>) -> Result<BuildOutput, DockerError>;

    async fn run(&self, request: RunRequest, abort: &AbortSignal)
        -> Result<ContainerRun, DockerError>;
}
