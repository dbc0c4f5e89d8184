//! Pure classification of an instance from its three stage results.
//!
//! With R0 = run, R1 = test_patch_run and R2 = fix_patch_run:
//!
//! - `FAIL_TO_PASS = R1.failed ∩ R2.passed`
//! - `violations   = (R0.passed ∪ R1.passed) ∩ R2.failed`
//!
//! An instance is RESOLVED iff every stage produced results, FAIL_TO_PASS is
//! non-empty and there are no violations. A violation makes it UNRESOLVED no
//! matter how many tests the fix repaired.

use std::collections::BTreeSet;

use crate::error::{ErrorKind, StageError};
use crate::evaluation::record::{Outcome, Transitions};
use crate::parser::TestResult;

/// What the executor produced for an instance.
///
/// Stages run strictly in order and stop at the first error, so a missing
/// result is always explained by `error` when the executor filled this in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageResults {
    pub run: Option<TestResult>,
    pub test_patch_run: Option<TestResult>,
    pub fix_patch_run: Option<TestResult>,
    pub error: Option<StageError>,
}

/// Classification plus the test sets backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub fail_to_pass: BTreeSet<String>,
    pub pass_to_pass_violations: BTreeSet<String>,
    pub transitions: Transitions,
}

impl Decision {
    /// An ERROR decision for a failure that happened before any stage ran.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Error,
            error_kind: Some(kind),
            error: Some(message.into()),
            fail_to_pass: BTreeSet::new(),
            pass_to_pass_violations: BTreeSet::new(),
            transitions: Transitions::default(),
        }
    }
}

/// Buckets tests passing after the fix by their status before it.
pub fn transitions(before: &TestResult, after: &TestResult) -> Transitions {
    let mut out = Transitions::default();
    for id in after.passed() {
        if before.passed().contains(id) {
            out.pass_to_pass.insert(id.clone());
        } else if before.failed().contains(id) {
            out.fail_to_pass.insert(id.clone());
        } else if before.skipped().contains(id) {
            out.skip_to_pass.insert(id.clone());
        } else {
            out.none_to_pass.insert(id.clone());
        }
    }
    out
}

fn empty_stage(results: &StageResults) -> Option<&'static str> {
    let stages = [
        ("run", &results.run),
        ("test_patch_run", &results.test_patch_run),
        ("fix_patch_run", &results.fix_patch_run),
    ];
    stages
        .into_iter()
        .find(|(_, result)| result.as_ref().map(TestResult::is_empty).unwrap_or(true))
        .map(|(name, _)| name)
}

/// Classifies an instance. Deterministic in its input.
pub fn decide(results: &StageResults) -> Decision {
    if let Some(err) = &results.error {
        let kind = err.kind().unwrap_or(ErrorKind::RunExecutionError);
        return Decision::error(kind, err.to_string());
    }

    let (Some(r0), Some(r1), Some(r2)) = (
        results.run.as_ref(),
        results.test_patch_run.as_ref(),
        results.fix_patch_run.as_ref(),
    ) else {
        let stage = empty_stage(results).unwrap_or("run");
        return Decision::error(
            ErrorKind::EmptyResult,
            StageError::EmptyResult {
                stage: stage.to_string(),
            }
            .to_string(),
        );
    };

    if let Some(stage) = empty_stage(results) {
        return Decision::error(
            ErrorKind::EmptyResult,
            StageError::EmptyResult {
                stage: stage.to_string(),
            }
            .to_string(),
        );
    }

    let fail_to_pass: BTreeSet<String> = r1.failed().intersection(r2.passed()).cloned().collect();
    let pass_to_pass_violations: BTreeSet<String> = r0
        .passed()
        .union(r1.passed())
        .filter(|id| r2.failed().contains(*id))
        .cloned()
        .collect();

    let outcome = if !fail_to_pass.is_empty() && pass_to_pass_violations.is_empty() {
        Outcome::Resolved
    } else {
        Outcome::Unresolved
    };

    Decision {
        outcome,
        error_kind: None,
        error: None,
        fail_to_pass,
        pass_to_pass_violations,
        transitions: transitions(r1, r2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    fn result(passed: &[&str], failed: &[&str]) -> TestResult {
        TestResult::from_sets(passed.iter().copied(), failed.iter().copied(), NONE)
    }

    fn completed(r0: TestResult, r1: TestResult, r2: TestResult) -> StageResults {
        StageResults {
            run: Some(r0),
            test_patch_run: Some(r1),
            fix_patch_run: Some(r2),
            error: None,
        }
    }

    #[test]
    fn test_resolved() {
        let d = decide(&completed(
            result(&["bar"], &[]),
            result(&["bar"], &["foo"]),
            result(&["foo", "bar"], &[]),
        ));
        assert_eq!(d.outcome, Outcome::Resolved);
        assert_eq!(d.fail_to_pass.iter().collect::<Vec<_>>(), vec!["foo"]);
        assert!(d.pass_to_pass_violations.is_empty());
        assert!(d.transitions.pass_to_pass.contains("bar"));
    }

    #[test]
    fn test_unresolved_when_fix_does_not_help() {
        let d = decide(&completed(
            result(&["bar"], &[]),
            result(&["bar"], &["foo"]),
            result(&["bar"], &["foo"]),
        ));
        assert_eq!(d.outcome, Outcome::Unresolved);
        assert!(d.fail_to_pass.is_empty());
    }

    #[test]
    fn test_violation_overrides_fail_to_pass() {
        let d = decide(&completed(
            result(&["bar", "baz"], &[]),
            result(&["bar"], &["foo"]),
            result(&["foo"], &["bar", "baz"]),
        ));
        assert_eq!(d.outcome, Outcome::Unresolved);
        assert!(d.fail_to_pass.contains("foo"));
        // baz only passed in the plain run and still counts.
        assert_eq!(
            d.pass_to_pass_violations.iter().collect::<Vec<_>>(),
            vec!["bar", "baz"]
        );
    }

    #[test]
    fn test_stage_error_wins() {
        let d = decide(&StageResults {
            run: Some(result(&["bar"], &[])),
            test_patch_run: Some(result(&["bar"], &["foo"])),
            fix_patch_run: None,
            error: Some(StageError::PatchApply {
                stage: "fix_patch_run".into(),
            }),
        });
        assert_eq!(d.outcome, Outcome::Error);
        assert_eq!(d.error_kind, Some(ErrorKind::PatchApplyError));
    }

    #[test]
    fn test_empty_result_is_error() {
        let d = decide(&completed(
            TestResult::default(),
            result(&["bar"], &["foo"]),
            result(&["foo", "bar"], &[]),
        ));
        assert_eq!(d.outcome, Outcome::Error);
        assert_eq!(d.error_kind, Some(ErrorKind::EmptyResult));
        assert!(d.error.unwrap().contains("'run'"));

        let d = decide(&StageResults::default());
        assert_eq!(d.error_kind, Some(ErrorKind::EmptyResult));
    }

    #[test]
    fn test_transition_buckets() {
        let before = TestResult::from_sets(["p"], ["f"], ["s"]);
        let after = TestResult::from_sets(["p", "f", "s", "n"], NONE, NONE);
        let t = transitions(&before, &after);
        assert!(t.pass_to_pass.contains("p"));
        assert!(t.fail_to_pass.contains("f"));
        assert!(t.skip_to_pass.contains("s"));
        assert!(t.none_to_pass.contains("n"));
    }

    #[test]
    fn test_decision_is_deterministic() {
        let input = completed(
            result(&["a", "b"], &[]),
            result(&["a"], &["c", "d"]),
            result(&["a", "c"], &["d"]),
        );
        assert_eq!(decide(&input), decide(&input));
    }
}
