//! Evaluation records: the persisted outcome of one instance.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::Instance;
use crate::error::ErrorKind;
use crate::evaluation::decision::Decision;
use crate::harness::Mode;
use crate::parser::TestResult;

/// Final classification of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Resolved,
    Unresolved,
    Error,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Unresolved => write!(f, "UNRESOLVED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// The three container runs of an instance, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Run,
    TestPatchRun,
    FixPatchRun,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Run, Stage::TestPatchRun, Stage::FixPatchRun];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::TestPatchRun => "test_patch_run",
            Self::FixPatchRun => "fix_patch_run",
        }
    }

    /// Command running this stage's script inside the instance image.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Run => "bash /home/run.sh",
            Self::TestPatchRun => "bash /home/test-run.sh",
            Self::FixPatchRun => "bash /home/fix-run.sh",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution facts about one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

/// Per-test transitions between the test-only run and the fixed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transitions {
    /// Passing before and after the fix.
    pub pass_to_pass: BTreeSet<String>,
    /// Failing before the fix, passing after.
    pub fail_to_pass: BTreeSet<String>,
    /// Skipped before the fix, passing after.
    pub skip_to_pass: BTreeSet<String>,
    /// Absent before the fix, passing after.
    pub none_to_pass: BTreeSet<String>,
}

/// Result of evaluating one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub instance_id: String,
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub mode: Mode,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_result: Option<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_patch_result: Option<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_patch_result: Option<TestResult>,
    #[serde(default)]
    pub fail_to_pass: BTreeSet<String>,
    #[serde(default)]
    pub pass_to_pass_violations: BTreeSet<String>,
    #[serde(default)]
    pub transitions: Transitions,
    #[serde(default)]
    pub stages: Vec<StageReport>,
    pub finished_at: DateTime<Utc>,
}

impl EvaluationRecord {
    /// Record for a decision, without stage details.
    pub fn new(instance: &Instance, mode: Mode, decision: Decision) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            org: instance.org.clone(),
            repo: instance.repo.clone(),
            number: instance.number,
            mode,
            outcome: decision.outcome,
            error_kind: decision.error_kind,
            error: decision.error,
            image: None,
            run_result: None,
            test_patch_result: None,
            fix_patch_result: None,
            fail_to_pass: decision.fail_to_pass,
            pass_to_pass_violations: decision.pass_to_pass_violations,
            transitions: decision.transitions,
            stages: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome == Outcome::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(serde_json::to_string(&Outcome::Resolved).unwrap(), "\"RESOLVED\"");
        assert_eq!(Outcome::Unresolved.to_string(), "UNRESOLVED");
    }

    #[test]
    fn test_error_record_round_trip() {
        let instance = Instance {
            org: "apache".to_string(),
            repo: "dubbo".to_string(),
            number: 3,
            instance_id: "apache__dubbo-3".to_string(),
            base_commit: "abc".to_string(),
            language: "java".to_string(),
            fix_patch: String::new(),
            test_patch: "T".to_string(),
        };
        let decision = Decision::error(ErrorKind::BuildError, "no space left on device");
        let record = EvaluationRecord::new(&instance, Mode::Evaluation, decision);
        assert!(record.is_error());

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"error_kind\":\"build_error\""));
        assert!(!json.contains("run_result"));
        let back: EvaluationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_stage_commands() {
        assert_eq!(Stage::ALL.map(|s| s.as_str()), ["run", "test_patch_run", "fix_patch_run"]);
        assert_eq!(Stage::FixPatchRun.command(), "bash /home/fix-run.sh");
        assert_eq!(serde_json::to_string(&Stage::TestPatchRun).unwrap(), "\"test_patch_run\"");
    }
}
