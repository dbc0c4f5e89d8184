//! Harness configuration.
//!
//! Loaded from a JSON or YAML file (chosen by extension), with a default for
//! every key, then overridden by CLI flags and validated before any instance
//! is processed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::validate_name_part;
use crate::image::{BuildPolicy, ResolverOptions};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration '{path}': {message}")]
    Parse { path: String, message: String },

    /// A key has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a batch does with its instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Validate dataset instances with their own fix patches.
    #[default]
    Dataset,
    /// Score candidate fix patches against dataset instances.
    Evaluation,
    /// Build images only.
    Image,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Evaluation => "evaluation",
            Self::Image => "image",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dataset" => Ok(Self::Dataset),
            "evaluation" => Ok(Self::Evaluation),
            "image" => Ok(Self::Image),
            other => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                message: format!("unknown mode '{other}'"),
            }),
        }
    }
}

/// Configuration for a harness batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub mode: Mode,

    // Inputs
    /// Dataset JSONL files or directories.
    pub dataset_files: Vec<PathBuf>,
    /// Raw dataset files used by `dataset` mode; falls back to `dataset_files`.
    pub raw_dataset_files: Vec<PathBuf>,
    /// Candidate patch JSONL files for `evaluation` mode.
    pub patch_files: Vec<PathBuf>,
    /// Only these instance ids, when non-empty.
    pub specifics: Vec<String>,
    /// Never these instance ids.
    pub skips: Vec<String>,

    // Paths
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Local checkouts, laid out as `<repo_dir>/<org>/<repo>`.
    pub repo_dir: Option<PathBuf>,

    // Images
    pub force_build: bool,
    pub need_clone: bool,
    /// `KEY=VALUE` lines set before every image layer's commands.
    pub global_env: Vec<String>,
    /// Reset `global_env` keys after each layer's commands.
    pub clear_env: bool,
    pub image_namespace: String,
    /// Extra attempts for transient build failures.
    pub build_retries: u32,

    // Execution
    pub stop_on_error: bool,
    pub max_workers: usize,
    pub max_workers_build_image: usize,
    pub max_workers_run_instance: usize,
    /// Per-command timeout in seconds.
    pub run_timeout_secs: u64,
    /// Grace period before a container is force-killed on abort.
    pub abort_grace_secs: u64,

    pub log_level: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Dataset,

            dataset_files: Vec::new(),
            raw_dataset_files: Vec::new(),
            patch_files: Vec::new(),
            specifics: Vec::new(),
            skips: Vec::new(),

            workdir: PathBuf::from("./data/workdir"),
            output_dir: PathBuf::from("./data/output"),
            log_dir: PathBuf::from("./data/logs"),
            repo_dir: None,

            force_build: false,
            need_clone: true,
            global_env: Vec::new(),
            clear_env: true,
            image_namespace: "swe-harness".to_string(),
            build_retries: 2,

            stop_on_error: true,
            max_workers: 8,
            max_workers_build_image: 8,
            max_workers_run_instance: 8,
            run_timeout_secs: 1800, // 30 minutes
            abort_grace_secs: 10,

            log_level: None,
        }
    }
}

fn is_env_line(line: &str) -> bool {
    let Some((key, _)) = line.split_once('=') else {
        return false;
    };
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !line.contains('\n')
}

impl HarnessConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration file; `.yaml`/`.yml` are YAML, anything else JSON.
    ///
    /// The result is not validated, so CLI overrides can still be applied.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let parsed = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    /// Dataset inputs for the current mode.
    pub fn instance_files(&self) -> &[PathBuf] {
        if self.mode == Mode::Dataset && !self.raw_dataset_files.is_empty() {
            &self.raw_dataset_files
        } else {
            &self.dataset_files
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn build_policy(&self) -> BuildPolicy {
        BuildPolicy {
            force_build: self.force_build,
            max_retries: self.build_retries,
            ..BuildPolicy::default()
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            namespace: self.image_namespace.clone(),
            need_clone: self.need_clone,
            repo_dir: self.repo_dir.clone().unwrap_or_else(|| PathBuf::from("repos")),
            global_env: self.global_env.clone(),
            clear_env: self.clear_env,
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Concurrency validation
        for (key, value) in [
            ("max_workers", self.max_workers),
            ("max_workers_build_image", self.max_workers_build_image),
            ("max_workers_run_instance", self.max_workers_run_instance),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{key} must be greater than 0"
                )));
            }
        }

        if self.run_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "run_timeout_secs must be greater than 0".to_string(),
            ));
        }

        // Path validation
        for (key, path) in [
            ("workdir", &self.workdir),
            ("output_dir", &self.output_dir),
            ("log_dir", &self.log_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{key} cannot be empty"
                )));
            }
        }

        if !self.need_clone && self.repo_dir.is_none() {
            return Err(ConfigError::ValidationFailed(
                "repo_dir is required when need_clone is false".to_string(),
            ));
        }

        // Input validation
        if self.instance_files().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "no dataset files configured for {} mode",
                self.mode
            )));
        }
        if self.mode == Mode::Evaluation && self.patch_files.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "patch_files are required in evaluation mode".to_string(),
            ));
        }
        let patch_inputs: &[PathBuf] = if self.mode == Mode::Evaluation {
            &self.patch_files
        } else {
            &[]
        };
        for path in self.instance_files().iter().chain(patch_inputs) {
            if !path.exists() {
                return Err(ConfigError::ValidationFailed(format!(
                    "input file '{}' does not exist",
                    path.display()
                )));
            }
        }

        // Image validation
        if let Some(bad) = self.global_env.iter().find(|line| !is_env_line(line)) {
            return Err(ConfigError::InvalidValue {
                key: "global_env".to_string(),
                message: format!("'{bad}' is not a KEY=VALUE line"),
            });
        }
        if self.image_namespace.is_empty()
            || self.image_namespace != self.image_namespace.to_ascii_lowercase()
            || validate_name_part("image_namespace", &self.image_namespace).is_err()
        {
            return Err(ConfigError::InvalidValue {
                key: "image_namespace".to_string(),
                message: format!(
                    "'{}' must be a lowercase image name component",
                    self.image_namespace
                ),
            });
        }

        // Selection validation
        let specifics: HashSet<&String> = self.specifics.iter().collect();
        if let Some(both) = self.skips.iter().find(|id| specifics.contains(id)) {
            return Err(ConfigError::ValidationFailed(format!(
                "instance '{both}' is listed in both specifics and skips"
            )));
        }

        if let Some(level) = &self.log_level {
            if tracing_subscriber::EnvFilter::try_new(level).is_err() {
                return Err(ConfigError::InvalidValue {
                    key: "log_level".to_string(),
                    message: format!("'{level}' is not a valid log filter"),
                });
            }
        }

        Ok(())
    }
}
