//! Batch harness: configuration, orchestration, progress and reporting.

pub mod config;
pub mod orchestrator;
pub mod progress;
pub mod report;

pub use config::{ConfigError, HarnessConfig, Mode};
pub use orchestrator::{select_instances, BatchOutcome, Orchestrator};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use report::{
    load_records, load_report, DatasetEntry, Report, ReportWriter, Summary, DATASET_FILE,
    RECORDS_FILE, REPORT_FILE,
};
