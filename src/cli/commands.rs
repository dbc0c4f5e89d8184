//! CLI command definitions for swe-harness.
//!
//! `run` executes a batch from a configuration file, `parse` applies one
//! ecosystem's log parser to a saved log, and `resolve` prints the image
//! chain of every selected instance without touching the container engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use crate::dataset::load_instances;
use crate::execution::DockerClient;
use crate::harness::{select_instances, BatchOutcome, HarnessConfig, Mode, Orchestrator};
use crate::image::{stacked_digests, ImageResolver};
use crate::parser::ParserRegistry;

/// Containerized evaluation harness for repository fix patches.
#[derive(Parser)]
#[command(name = "swe-harness")]
#[command(about = "Build task images, run tests in containers and classify fix patches")]
#[command(version)]
#[command(
    long_about = "swe-harness builds a base/env/instance image chain per task, runs the test suite three times \
(unmodified, with the test patch, with test and fix patches) and classifies each instance as \
RESOLVED, UNRESOLVED or ERROR.\n\nExample usage:\n  swe-harness run --config harness.yaml --max-workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Configuration file named by the subcommand, if any.
    pub fn config_path(&self) -> Option<&Path> {
        match &self.command {
            Commands::Run(args) => Some(args.config.as_path()),
            Commands::Resolve(args) => Some(args.config.as_path()),
            Commands::Parse(_) => None,
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a batch described by a configuration file.
    Run(RunArgs),

    /// Parse a saved test log and print the canonical result as JSON.
    Parse(ParseArgs),

    /// Print the image chain each selected instance resolves to.
    Resolve(ResolveArgs),
}

/// Arguments for `swe-harness run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Configuration file (YAML or JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override the batch mode (dataset, evaluation, image).
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Comma-separated instance ids to run exclusively.
    #[arg(long, value_delimiter = ',')]
    pub specifics: Vec<String>,

    /// Comma-separated instance ids to skip.
    #[arg(long, value_delimiter = ',')]
    pub skips: Vec<String>,

    /// Rebuild images even when the tag already exists.
    #[arg(long)]
    pub force_build: bool,

    /// Stop dispatching new instances after the first ERROR.
    #[arg(long)]
    pub stop_on_error: Option<bool>,

    /// Maximum concurrent instance pipelines.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Maximum concurrent image builds.
    #[arg(long)]
    pub max_workers_build_image: Option<usize>,

    /// Maximum concurrent containers.
    #[arg(long)]
    pub max_workers_run_instance: Option<usize>,

    /// Per-stage container timeout in seconds.
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,

    /// Directory for evaluation_records.jsonl and final_report.json.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for build and stage logs.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Print the final report summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if !self.specifics.is_empty() {
            config.specifics = self.specifics.clone();
        }
        if !self.skips.is_empty() {
            config.skips = self.skips.clone();
        }
        if self.force_build {
            config.force_build = true;
        }
        if let Some(stop) = self.stop_on_error {
            config.stop_on_error = stop;
        }
        if let Some(n) = self.max_workers {
            config.max_workers = n;
        }
        if let Some(n) = self.max_workers_build_image {
            config.max_workers_build_image = n;
        }
        if let Some(n) = self.max_workers_run_instance {
            config.max_workers_run_instance = n;
        }
        if let Some(secs) = self.run_timeout_secs {
            config.run_timeout_secs = secs;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
    }
}

/// Arguments for `swe-harness parse`.
#[derive(Parser, Debug)]
pub struct ParseArgs {
    /// Ecosystem whose parser to apply (go, java, python, rust).
    #[arg(short, long)]
    pub ecosystem: String,

    /// Log file to parse.
    pub log_file: PathBuf,
}

/// Arguments for `swe-harness resolve`.
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Configuration file (YAML or JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments and return the parsed CLI structure.
///
/// This allows the caller to access CLI options (like log_level) before
/// running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Parse(args) => run_parse_command(args),
        Commands::Resolve(args) => run_resolve_command(args),
    }
}

fn load_config(path: &Path) -> anyhow::Result<HarnessConfig> {
    HarnessConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

// ============================================================================
// Run
// ============================================================================

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    let stop_on_error = config.stop_on_error;

    let client = DockerClient::new().context("Failed to connect to the container engine")?;
    client.ping().await.context("Container engine is not responding")?;

    let orchestrator = Orchestrator::new(config, Arc::new(client));
    let abort = orchestrator.abort_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting batch");
            abort.trigger();
        }
    });

    info!(config = %args.config.display(), "Starting batch");
    let outcome = orchestrator.run().await?;
    print_outcome(&outcome, args.json)?;

    if outcome.aborted {
        anyhow::bail!("Batch aborted before completion");
    }
    if stop_on_error && outcome.report.summary.error > 0 {
        anyhow::bail!(
            "Batch stopped on error: {} instance(s) ended in ERROR",
            outcome.report.summary.error
        );
    }
    Ok(())
}

fn print_outcome(outcome: &BatchOutcome, as_json: bool) -> anyhow::Result<()> {
    let report = &outcome.report;
    let summary = &report.summary;

    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("\n=== Harness Results ({}) ===", report.mode);
    if report.mode == Mode::Image {
        println!("Images built:   {}", summary.images_built);
        println!("Build errors:   {}", summary.error);
    } else {
        println!("Total:          {}", summary.total);
        println!("Resolved:       {}", summary.resolved);
        println!("Unresolved:     {}", summary.unresolved);
        println!("Error:          {}", summary.error);
    }
    for (kind, count) in &summary.errors_by_kind {
        println!("  {kind}: {count}");
    }
    if outcome.aborted {
        println!("Batch was aborted.");
    } else if outcome.halted_on_error {
        println!("Batch halted after an ERROR (stop_on_error).");
    }
    println!();

    for record in &report.records {
        println!(
            "  {} [{}] f2p={} p2p_violations={}",
            record.instance_id,
            record.outcome,
            record.fail_to_pass.len(),
            record.pass_to_pass_violations.len(),
        );
        if let Some(err) = &record.error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

// ============================================================================
// Parse
// ============================================================================

fn run_parse_command(args: ParseArgs) -> anyhow::Result<()> {
    let log = std::fs::read_to_string(&args.log_file)
        .with_context(|| format!("Failed to read log file {}", args.log_file.display()))?;
    let registry = ParserRegistry::with_defaults();
    let result = registry
        .parse(&args.ecosystem, &log)
        .ok_or_else(|| anyhow::anyhow!("No log parser registered for '{}'", args.ecosystem))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ============================================================================
// Resolve
// ============================================================================

fn run_resolve_command(args: ResolveArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    config.validate()?;

    let instances = select_instances(&config, load_instances(config.instance_files())?);
    let resolver = ImageResolver::new(config.resolver_options());

    let mut entries = Vec::with_capacity(instances.len());
    for instance in &instances {
        match resolver.resolve(instance) {
            Ok(resolved) => {
                let digests = stacked_digests(&resolved.chain);
                let images: Vec<_> = resolved
                    .chain
                    .iter()
                    .zip(&digests)
                    .map(|(spec, digest)| {
                        json!({
                            "tag": spec.tag(),
                            "parent": spec.parent.reference(),
                            "digest": digest,
                        })
                    })
                    .collect();
                entries.push(json!({
                    "instance_id": instance.instance_id,
                    "ecosystem": resolved.ecosystem.as_str(),
                    "images": images,
                }));
            }
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "Cannot resolve image chain");
                entries.push(json!({
                    "instance_id": instance.instance_id,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!("{}", entry["instance_id"].as_str().unwrap_or_default());
        if let Some(error) = entry["error"].as_str() {
            println!("  error: {error}");
            continue;
        }
        for image in entry["images"].as_array().into_iter().flatten() {
            println!(
                "  {} <- {}  {}",
                image["tag"].as_str().unwrap_or_default(),
                image["parent"].as_str().unwrap_or_default(),
                image["digest"].as_str().unwrap_or_default(),
            );
        }
    }
    Ok(())
}
