//! Runs the three evaluation stages of one instance.
//!
//! Each stage gets a fresh container from the instance image, so no stage
//! can observe another's side effects. Stages run strictly in order and the
//! first failing stage ends the instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::dataset::Instance;
use crate::error::{DockerError, StageError};
use crate::evaluation::decision::StageResults;
use crate::evaluation::record::{Stage, StageReport};
use crate::execution::{AbortSignal, ContainerEngine, ContainerRun, RunRequest};
use crate::image::{HOME_DIR, PATCH_APPLY_EXIT_CODE, PATCH_APPLY_MARKER};
use crate::parser::{LogParser, TestResult};

/// Container path of the fix patch read by `fix-run.sh`.
pub const FIX_PATCH_PATH: &str = "/home/fix.patch";

/// Knobs shared by every instance of a batch.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub run_timeout: Duration,
    pub abort_grace: Duration,
    /// Root of per-stage logs: `<log_dir>/<org>/<repo>/<instance_id>/<stage>.log`.
    pub log_dir: PathBuf,
    pub container_prefix: String,
}

/// What to run for one instance.
pub struct ExecutionPlan<'a> {
    pub instance: &'a Instance,
    /// Fully built instance image.
    pub image: &'a str,
    pub parser: &'a dyn LogParser,
    /// Fix patch injected at run time instead of the one baked into the image.
    pub fix_patch_override: Option<&'a str>,
}

/// Stage results plus the execution facts recorded for each stage.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub results: StageResults,
    pub reports: Vec<StageReport>,
}

impl Execution {
    pub fn aborted(&self) -> bool {
        matches!(self.results.error, Some(StageError::Aborted))
    }
}

/// Classifies a finished container run.
///
/// The reserved exit code together with the marker line means a patch did
/// not apply. Any other non-zero exit is ordinary test failure as long as the
/// log still yields test results.
pub fn classify_run(
    stage: Stage,
    run: &ContainerRun,
    parser: &dyn LogParser,
) -> Result<TestResult, StageError> {
    if run.exit_code == PATCH_APPLY_EXIT_CODE && run.log.contains(PATCH_APPLY_MARKER) {
        return Err(StageError::PatchApply {
            stage: stage.to_string(),
        });
    }

    let result = parser.parse(&run.log);
    if !result.is_empty() {
        return Ok(result);
    }
    if run.exit_code != 0 {
        return Err(StageError::RunExecution {
            stage: stage.to_string(),
            message: format!(
                "exited with status {} without recognizable test output",
                run.exit_code
            ),
        });
    }
    Err(StageError::EmptyResult {
        stage: stage.to_string(),
    })
}

/// Maps an instance id onto a single safe name component.
///
/// Loaded instances are already validated; this also covers instances
/// handed directly to the orchestrator.
fn safe_component(instance_id: &str) -> String {
    let safe: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    if safe.is_empty() || safe.starts_with('.') {
        format!("_{safe}")
    } else {
        safe
    }
}

fn container_name(prefix: &str, instance_id: &str, stage: Stage) -> String {
    let safe = safe_component(instance_id);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{safe}-{}-{}", stage.as_str().replace('_', "-"), &suffix[..8])
}

/// Executes instance stages against a container engine.
pub struct InstanceExecutor {
    engine: Arc<dyn ContainerEngine>,
    permits: Arc<Semaphore>,
    settings: ExecutorSettings,
    abort: AbortSignal,
}

impl InstanceExecutor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        max_concurrent_runs: usize,
        settings: ExecutorSettings,
        abort: AbortSignal,
    ) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            settings,
            abort,
        }
    }

    fn log_path(&self, instance: &Instance, stage: Stage) -> PathBuf {
        self.settings
            .log_dir
            .join(&instance.org)
            .join(&instance.repo)
            .join(safe_component(&instance.instance_id))
            .join(format!("{}.log", stage.as_str()))
    }

    async fn write_log(path: &Path, log: &str) -> Option<String> {
        let written = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, log).await
        }
        .await;
        match written {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write stage log");
                None
            }
        }
    }

    /// Runs run, test_patch_run and fix_patch_run in order.
    pub async fn execute(&self, plan: &ExecutionPlan<'_>) -> Execution {
        let mut execution = Execution::default();

        for stage in Stage::ALL {
            let (outcome, report) = self.run_stage(plan, stage).await;
            if let Some(report) = report {
                execution.reports.push(report);
            }
            match outcome {
                Ok(result) => {
                    debug!(
                        instance_id = %plan.instance.instance_id,
                        stage = %stage,
                        passed = result.passed_count(),
                        failed = result.failed_count(),
                        skipped = result.skipped_count(),
                        "Stage completed"
                    );
                    let slot = match stage {
                        Stage::Run => &mut execution.results.run,
                        Stage::TestPatchRun => &mut execution.results.test_patch_run,
                        Stage::FixPatchRun => &mut execution.results.fix_patch_run,
                    };
                    *slot = Some(result);
                }
                Err(err) => {
                    if err != StageError::Aborted {
                        info!(instance_id = %plan.instance.instance_id, stage = %stage, error = %err, "Stage failed");
                    }
                    execution.results.error = Some(err);
                    break;
                }
            }
        }

        execution
    }

    async fn run_stage(
        &self,
        plan: &ExecutionPlan<'_>,
        stage: Stage,
    ) -> (Result<TestResult, StageError>, Option<StageReport>) {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return (Err(StageError::Aborted), None),
            },
            _ = self.abort.triggered() => return (Err(StageError::Aborted), None),
        };

        let mut files = std::collections::BTreeMap::new();
        if stage == Stage::FixPatchRun {
            if let Some(patch) = plan.fix_patch_override {
                files.insert(FIX_PATCH_PATH.to_string(), patch.as_bytes().to_vec());
            }
        }

        let name = container_name(
            &self.settings.container_prefix,
            &plan.instance.instance_id,
            stage,
        );
        let request = RunRequest {
            name: name.clone(),
            image: plan.image.to_string(),
            command: stage.command().to_string(),
            files,
            env: Vec::new(),
            working_dir: Some(HOME_DIR.to_string()),
            timeout: self.settings.run_timeout,
            grace: self.settings.abort_grace,
        };

        debug!(instance_id = %plan.instance.instance_id, stage = %stage, container = %name, "Starting stage");
        match self.engine.run(request, &self.abort).await {
            Ok(run) => {
                let log_file = Self::write_log(&self.log_path(plan.instance, stage), &run.log).await;
                let report = StageReport {
                    stage,
                    container_name: run.container_name.clone(),
                    exit_code: Some(run.exit_code),
                    duration_ms: run.duration.as_millis() as u64,
                    log_file,
                };
                (classify_run(stage, &run, plan.parser), Some(report))
            }
            Err(e) => {
                let err = match e {
                    DockerError::Timeout { seconds } => StageError::RunTimeout {
                        stage: stage.to_string(),
                        seconds,
                    },
                    DockerError::Aborted => StageError::Aborted,
                    other => StageError::RunExecution {
                        stage: stage.to_string(),
                        message: other.to_string(),
                    },
                };
                let report = StageReport {
                    stage,
                    container_name: name,
                    exit_code: None,
                    duration_ms: 0,
                    log_file: None,
                };
                (Err(err), Some(report))
            }
        }
    }
}
