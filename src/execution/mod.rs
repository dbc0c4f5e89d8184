//! Container execution layer.
//!
//! [`ContainerEngine`] is the seam between the harness and a container
//! runtime. [`DockerClient`] implements it with bollard; every run gets a
//! fresh container that is removed once its logs are collected.
//!
//! ```text
//! CREATE → UPLOAD FILES → START → WAIT (timeout | abort) → LOGS → REMOVE
//! ```

pub mod archive;
pub mod docker_client;
pub mod engine;
pub mod signal;

pub use docker_client::{ContainerConfig, DockerClient};
pub use engine::{
    BuildOutput, BuildRequest, ContainerEngine, ContainerRun, ContextDir, RunRequest,
};
pub use signal::AbortSignal;
