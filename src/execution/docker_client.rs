//! Docker API wrapper using the bollard crate.
//!
//! [`DockerClient`] implements [`ContainerEngine`] on top of the local Docker
//! daemon: images are built from in-memory tar contexts and every stage runs
//! in a fresh, non-TTY container that is always removed afterwards.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::DockerError;
use crate::execution::archive;
use crate::execution::engine::{
    BuildOutput, BuildRequest, ContainerEngine, ContainerRun, RunRequest,
};
use crate::execution::signal::AbortSignal;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Environment variables.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: Option<String>,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            network_mode: Some("bridge".to_string()),
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

}

/// How a container wait ended.
enum WaitOutcome {
    Exited(i64),
    TimedOut,
    Aborted,
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pings the daemon so that a missing daemon fails the batch up front.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let host_config = HostConfig {
            network_mode: config.network_mode.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            working_dir: config.working_dir.clone(),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container, sending SIGKILL after `grace_secs`.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to stop container: {e}")))?;

        Ok(())
    }

    pub async fn kill_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to kill container: {e}")))?;

        Ok(())
    }

    /// Removes a container by ID.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => DockerError::ContainerNotFound { id: id.to_string() },
                other => DockerError::RunFailed(format!("Failed to remove container: {other}")),
            })?;

        Ok(())
    }

    /// Copies a tar archive into the container root.
    pub async fn upload_archive(&self, id: &str, tar: Vec<u8>) -> Result<(), DockerError> {
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), tar.into())
            .await
            .map_err(|e| DockerError::CopyFailed(e.to_string()))?;

        Ok(())
    }

    /// Gets combined stdout and stderr logs from a container.
    pub async fn get_logs(&self, id: &str) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("Error reading logs: {e}")));
                }
            }
        }

        Ok(output)
    }

    /// Waits for a container to finish executing and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DockerError::RunFailed(format!(
                "Error waiting for container: {e}"
            ))),
            None => Err(DockerError::RunFailed(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn cleanup(&self, id: &str) {
        if let Err(e) = self.remove_container(id, true).await {
            debug!(container = id, error = %e, "Container removal failed");
        }
    }

    async fn run_created(
        &self,
        id: &str,
        request: &RunRequest,
        abort: &AbortSignal,
    ) -> Result<ContainerRun, DockerError> {
        if !request.files.is_empty() {
            let tar = archive::upload_archive(&request.files)?;
            self.upload_archive(id, tar).await?;
        }

        let started = Instant::now();
        self.start_container(id).await?;

        let outcome = tokio::select! {
            waited = tokio::time::timeout(request.timeout, self.wait_container(id)) => {
                match waited {
                    Ok(code) => WaitOutcome::Exited(code?),
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
            _ = abort.triggered() => WaitOutcome::Aborted,
        };

        match outcome {
            WaitOutcome::Exited(exit_code) => {
                let log = self.get_logs(id).await?;
                Ok(ContainerRun {
                    container_name: request.name.clone(),
                    command: request.command.clone(),
                    log,
                    exit_code,
                    duration: started.elapsed(),
                })
            }
            WaitOutcome::TimedOut => {
                warn!(container = %request.name, timeout_secs = request.timeout.as_secs(), "Container timed out, killing");
                if let Err(e) = self.kill_container(id).await {
                    debug!(container = id, error = %e, "Kill after timeout failed");
                }
                Err(DockerError::Timeout {
                    seconds: request.timeout.as_secs(),
                })
            }
            WaitOutcome::Aborted => {
                debug!(container = %request.name, "Abort requested, stopping container");
                let grace = request.grace.as_secs().min(i64::MAX as u64) as i64;
                if let Err(e) = self.stop_container(id, grace).await {
                    debug!(container = id, error = %e, "Stop after abort failed");
                }
                Err(DockerError::Aborted)
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn image_labels(
        &self,
        tag: &str,
    ) -> Result<Option<HashMap<String, String>>, DockerError> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => Ok(Some(
                image
                    .config
                    .and_then(|config| config.labels)
                    .unwrap_or_default(),
            )),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(DockerError::DaemonUnavailable(format!(
                "Failed to inspect image '{tag}': {e}"
            ))),
        }
    }

    async fn build_image(&self, request: BuildRequest<'_>) -> Result<BuildOutput, DockerError> {
        let context = archive::build_context(request.dockerfile, request.files, request.context_dirs)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: request.tag.to_string(),
            rm: true,
            forcerm: true,
            labels: request.labels.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None::<HashMap<_, _>>, Some(context.into()));
        let mut log = String::new();

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| DockerError::BuildFailed(format!("{e}\n{log}")))?;
            if let Some(text) = info.stream.as_deref().or(info.status.as_deref()) {
                log.push_str(text);
                if !text.ends_with('\n') {
                    log.push('\n');
                }
            }
            if let Some(error) = info.error {
                log.push_str(&error);
                return Err(DockerError::BuildFailed(format!("{error}\n{log}")));
            }
        }

        Ok(BuildOutput { log })
    }

    async fn run(
        &self,
        request: RunRequest,
        abort: &AbortSignal,
    ) -> Result<ContainerRun, DockerError> {
        if abort.is_triggered() {
            return Err(DockerError::Aborted);
        }

        let config = ContainerConfig::new(&request.name, &request.image)
            .with_cmd(vec![
                "bash".to_string(),
                "-c".to_string(),
                request.command.clone(),
            ])
            .with_env(request.env.clone());
        let config = match &request.working_dir {
            Some(dir) => config.with_working_dir(dir),
            None => config,
        };
        let id = self.create_container(&config).await?;

        let result = self.run_created(&id, &request, abort).await;
        self.cleanup(&id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("swe-harness-gin-1-run", "swe-harness/gin-gonic_m_gin:pr-1")
            .with_cmd(vec![
                "bash".to_string(),
                "-c".to_string(),
                "bash /home/run.sh".to_string(),
            ])
            .with_env(vec!["GOPROXY=direct".to_string()])
            .with_working_dir("/home");

        assert_eq!(config.name, "swe-harness-gin-1-run");
        assert_eq!(config.cmd.unwrap().len(), 3);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.working_dir.unwrap(), "/home");
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
    }

    #[test]
    fn test_container_config_defaults_to_bridge() {
        let config = ContainerConfig::new("c", "ubuntu:22.04");
        assert_eq!(config.network_mode.as_deref(), Some("bridge"));
        assert!(config.cmd.is_none());
    }
}
