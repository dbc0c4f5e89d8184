//! Batch orchestration: selection, planning, bounded concurrent pipelines
//! and incremental reporting.
//!
//! ```text
//! load → select (specifics/skips) → resolve into ImageGraph
//!      → per instance: build chain → run 3 stages → parse → decide
//!      → mpsc → report writer (JSONL flushed per record)
//! ```
//!
//! Three independent bounds apply: `max_workers` pipelines,
//! `max_workers_build_image` concurrent builds and `max_workers_run_instance`
//! concurrent containers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::dataset::{load_instances, load_patches, CandidatePatch, Instance, PullRequestKey};
use crate::ecosystem::Ecosystem;
use crate::error::{ErrorKind, GraphError, HarnessError, StageError};
use crate::evaluation::{
    decide, Decision, EvaluationRecord, ExecutionPlan, ExecutorSettings, InstanceExecutor,
};
use crate::execution::{AbortSignal, ContainerEngine};
use crate::harness::config::{HarnessConfig, Mode};
use crate::harness::progress::{ProgressCounters, ProgressMonitor};
use crate::harness::report::{DatasetEntry, Report, ReportWriter};
use crate::image::{ImageBuilder, ImageGraph, ImageResolver, ImageSpecId};
use crate::parser::ParserRegistry;

/// Result of a finished (or stopped) batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub report: Report,
    /// Dispatch stopped after an ERROR under `stop_on_error`.
    pub halted_on_error: bool,
    /// The abort signal fired.
    pub aborted: bool,
}

/// One selected instance, planned against the image graph.
struct WorkItem {
    /// Instance as evaluated; carries the candidate patch in evaluation mode.
    instance: Instance,
    candidate: Option<String>,
    plan: Result<(ImageSpecId, Ecosystem), GraphError>,
}

enum ReportEvent {
    Record {
        record: Box<EvaluationRecord>,
        entry: Option<DatasetEntry>,
    },
    ImageBuilt,
}

impl ReportEvent {
    fn is_error(&self) -> bool {
        matches!(self, Self::Record { record, .. } if record.is_error())
    }
}

/// State shared by every pipeline of a batch.
struct Pipeline {
    mode: Mode,
    graph: ImageGraph,
    builder: ImageBuilder,
    executor: InstanceExecutor,
    parsers: Arc<ParserRegistry>,
    counters: ProgressCounters,
}

impl Pipeline {
    fn error_event(&self, instance: &Instance, kind: ErrorKind, message: String) -> ReportEvent {
        let record = EvaluationRecord::new(instance, self.mode, Decision::error(kind, message));
        ReportEvent::Record {
            record: Box::new(record),
            entry: None,
        }
    }

    /// Drives one instance through build → execute → decide.
    ///
    /// Returns `None` when the instance was aborted.
    async fn process(&self, item: WorkItem) -> Option<ReportEvent> {
        let instance = &item.instance;
        let (target, ecosystem) = match &item.plan {
            Ok(plan) => plan,
            Err(e) => {
                return Some(self.error_event(instance, ErrorKind::BuildError, e.to_string()));
            }
        };

        let image = {
            let _building = ProgressCounters::enter(&self.counters.building);
            let chain = match self.graph.chain_to(target) {
                Ok(chain) => chain,
                Err(e) => {
                    return Some(self.error_event(instance, ErrorKind::BuildError, e.to_string()))
                }
            };
            match self.builder.build_chain(&chain).await {
                Ok(image) => image,
                Err(StageError::Aborted) => return None,
                Err(e) => {
                    let kind = e.kind().unwrap_or(ErrorKind::BuildError);
                    return Some(self.error_event(instance, kind, e.to_string()));
                }
            }
        };

        if self.mode == Mode::Image {
            info!(instance_id = %instance.instance_id, image = %image, "Image ready");
            return Some(ReportEvent::ImageBuilt);
        }

        let Some(parser) = self.parsers.get(ecosystem.as_str()) else {
            return Some(self.error_event(
                instance,
                ErrorKind::EmptyResult,
                format!("no log parser registered for ecosystem '{ecosystem}'"),
            ));
        };

        let execution = {
            let _running = ProgressCounters::enter(&self.counters.running);
            let plan = ExecutionPlan {
                instance,
                image: &image,
                parser: parser.as_ref(),
                fix_patch_override: item.candidate.as_deref(),
            };
            self.executor.execute(&plan).await
        };
        if execution.aborted() {
            return None;
        }

        let decision = decide(&execution.results);
        let mut record = EvaluationRecord::new(instance, self.mode, decision);
        record.image = Some(image);
        record.run_result = execution.results.run;
        record.test_patch_result = execution.results.test_patch_run;
        record.fix_patch_result = execution.results.fix_patch_run;
        record.stages = execution.reports;

        info!(
            instance_id = %instance.instance_id,
            outcome = %record.outcome,
            fail_to_pass = record.fail_to_pass.len(),
            violations = record.pass_to_pass_violations.len(),
            "Instance evaluated"
        );

        let entry = if self.mode == Mode::Dataset {
            DatasetEntry::from_resolved(instance, &record)
        } else {
            None
        };
        Some(ReportEvent::Record {
            record: Box::new(record),
            entry,
        })
    }
}

/// Keeps instances listed in `specifics` (all when empty) and not in `skips`.
pub fn select_instances(config: &HarnessConfig, instances: Vec<Instance>) -> Vec<Instance> {
    let specifics: HashSet<&str> = config.specifics.iter().map(String::as_str).collect();
    let skips: HashSet<&str> = config.skips.iter().map(String::as_str).collect();
    instances
        .into_iter()
        .filter(|i| specifics.is_empty() || specifics.contains(i.instance_id.as_str()))
        .filter(|i| !skips.contains(i.instance_id.as_str()))
        .collect()
}

/// Runs batches of instances against a container engine.
pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    engine: Arc<dyn ContainerEngine>,
    parsers: Arc<ParserRegistry>,
    abort: AbortSignal,
    progress_interval: Duration,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            parsers: Arc::new(ParserRegistry::with_defaults()),
            abort: AbortSignal::new(),
            progress_interval: Duration::from_secs(30),
        }
    }

    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = Arc::new(parsers);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Signal that stops dispatch and aborts running containers.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Validates the configuration, loads its inputs and runs the batch.
    pub async fn run(&self) -> Result<BatchOutcome, HarnessError> {
        self.config.validate()?;
        let instances = load_instances(self.config.instance_files())?;
        let patches = if self.config.mode == Mode::Evaluation {
            load_patches(&self.config.patch_files)?
        } else {
            HashMap::new()
        };
        info!(
            mode = %self.config.mode,
            instances = instances.len(),
            patches = patches.len(),
            "Loaded inputs"
        );
        self.run_instances(instances, patches).await
    }

    /// Applies `specifics` and `skips`, preserving input order.
    pub fn select(&self, instances: Vec<Instance>) -> Vec<Instance> {
        select_instances(&self.config, instances)
    }

    /// Resolves every instance and registers its chain in one graph.
    fn plan(
        &self,
        instances: Vec<Instance>,
        patches: HashMap<PullRequestKey, CandidatePatch>,
    ) -> (ImageGraph, Vec<WorkItem>) {
        let resolver = ImageResolver::new(self.config.resolver_options());
        let mut graph = ImageGraph::new();
        let mut items = Vec::with_capacity(instances.len());

        for instance in instances {
            let candidate = if self.config.mode == Mode::Evaluation {
                match patches.get(&instance.pr_key()) {
                    Some(patch) => Some(patch.fix_patch.clone()),
                    None => {
                        warn!(instance_id = %instance.instance_id, "No candidate patch, skipping");
                        continue;
                    }
                }
            } else {
                None
            };

            let plan = resolver.resolve(&instance).and_then(|resolved| {
                graph.add_chain(&resolved.chain)?;
                Ok((resolved.target().clone(), resolved.ecosystem))
            });
            if let Err(e) = &plan {
                warn!(instance_id = %instance.instance_id, error = %e, "Cannot resolve image chain");
            }

            let instance = match &candidate {
                Some(patch) => instance.with_fix_patch(patch.clone()),
                None => instance,
            };
            items.push(WorkItem {
                instance,
                candidate,
                plan,
            });
        }

        (graph, items)
    }

    /// Runs already-loaded instances. `patches` is only read in evaluation mode.
    pub async fn run_instances(
        &self,
        instances: Vec<Instance>,
        patches: HashMap<PullRequestKey, CandidatePatch>,
    ) -> Result<BatchOutcome, HarnessError> {
        let config = &self.config;
        let selected = self.select(instances);
        let (graph, items) = self.plan(selected, patches);
        info!(instances = items.len(), images = graph.len(), "Planned batch");

        let counters = ProgressCounters::new();
        let pipeline = Arc::new(Pipeline {
            mode: config.mode,
            graph,
            builder: ImageBuilder::new(
                self.engine.clone(),
                config.build_policy(),
                config.max_workers_build_image,
                config.workdir.clone(),
                config.log_dir.clone(),
                self.abort.clone(),
            ),
            executor: InstanceExecutor::new(
                self.engine.clone(),
                config.max_workers_run_instance,
                ExecutorSettings {
                    run_timeout: config.run_timeout(),
                    abort_grace: config.abort_grace(),
                    log_dir: config.log_dir.clone(),
                    container_prefix: config.image_namespace.clone(),
                },
                self.abort.clone(),
            ),
            parsers: self.parsers.clone(),
            counters: counters.clone(),
        });

        let writer = ReportWriter::create(&config.output_dir, config.mode)?;
        let (tx, mut rx) = mpsc::channel::<ReportEvent>(config.max_workers.max(1) * 2);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            let mut failure: Option<std::io::Error> = None;
            while let Some(event) = rx.recv().await {
                match event {
                    ReportEvent::Record { record, entry } => {
                        if let Err(e) = writer.append(*record, entry.as_ref()) {
                            error!(error = %e, "Failed to append evaluation record");
                            failure.get_or_insert(e);
                        }
                    }
                    ReportEvent::ImageBuilt => writer.image_built(),
                }
            }
            (writer, failure)
        });

        let monitor = ProgressMonitor::start(counters.clone(), items.len(), self.progress_interval);
        let permits = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut undispatched = 0usize;

        let total = items.len();
        for (idx, item) in items.into_iter().enumerate() {
            if halted.load(Ordering::SeqCst) || self.abort.is_triggered() {
                undispatched = total - idx;
                break;
            }
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        undispatched = total - idx;
                        break;
                    }
                },
                _ = self.abort.triggered() => {
                    undispatched = total - idx;
                    break;
                }
            };
            // An ERROR may have arrived while waiting for the permit.
            if halted.load(Ordering::SeqCst) {
                undispatched = total - idx;
                break;
            }

            counters.dispatched.fetch_add(1, Ordering::Relaxed);
            let pipeline = pipeline.clone();
            let tx = tx.clone();
            let halted = halted.clone();
            let stop_on_error = config.stop_on_error;
            tasks.spawn(async move {
                let _permit = permit;
                let instance_id = item.instance.instance_id.clone();
                let Some(event) = pipeline.process(item).await else {
                    return;
                };
                if let ReportEvent::Record { record, .. } = &event {
                    pipeline.counters.record(record.outcome);
                }
                if event.is_error() && stop_on_error && !halted.swap(true, Ordering::SeqCst) {
                    warn!(instance_id = %instance_id, "ERROR outcome with stop_on_error set; no new instances will be dispatched");
                }
                if tx.send(event).await.is_err() {
                    error!(instance_id = %instance_id, "Report writer is gone, record lost");
                }
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Instance pipeline panicked");
            }
        }
        monitor.stop().await;

        let (writer, failure) = writer_task
            .await
            .map_err(|e| std::io::Error::other(format!("report writer task failed: {e}")))?;
        if let Some(e) = failure {
            return Err(HarnessError::Report(e));
        }

        let aborted = self.abort.is_triggered();
        let halted_on_error = halted.load(Ordering::SeqCst);
        if undispatched > 0 {
            warn!(undispatched, aborted, halted_on_error, "Batch stopped before all instances were dispatched");
        }
        let report = writer.finish(aborted || halted_on_error)?;

        Ok(BatchOutcome {
            report,
            halted_on_error,
            aborted,
        })
    }
}
