//! Per-instance evaluation: stage execution, classification and records.

pub mod decision;
pub mod executor;
pub mod record;

pub use decision::{decide, transitions, Decision, StageResults};
pub use executor::{classify_run, Execution, ExecutionPlan, ExecutorSettings, InstanceExecutor};
pub use record::{EvaluationRecord, Outcome, Stage, StageReport, Transitions};
