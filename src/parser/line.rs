//! Per-line status matchers for line-oriented test runners.

use regex::Regex;

use super::{LogParser, StatusTally, TestResult, TestStatus};

/// One regex mapping a matching line to a test status.
///
/// The first capture group is the test id; `prefix` is prepended to it so that
/// different granularities (e.g. Go packages vs. Go test functions) never
/// collide.
#[derive(Debug, Clone)]
pub struct LineRule {
    status: TestStatus,
    regex: Regex,
    prefix: &'static str,
}

impl LineRule {
    pub fn new(status: TestStatus, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            status,
            regex: Regex::new(pattern)?,
            prefix: "",
        })
    }

    pub fn passed(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(TestStatus::Passed, pattern)
    }

    pub fn failed(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(TestStatus::Failed, pattern)
    }

    pub fn skipped(pattern: &str) -> Result<Self, regex::Error> {
        Self::new(TestStatus::Skipped, pattern)
    }

    /// Prepends `prefix` to every id this rule extracts.
    pub fn with_prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = prefix;
        self
    }

    fn apply(&self, line: &str) -> Option<String> {
        let caps = self.regex.captures(line)?;
        let id = caps.get(1)?.as_str().trim();
        if id.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.prefix, id))
    }
}

/// Parser matching every trimmed log line against a list of status rules.
///
/// All rules are tried on every line. Every match is an explicit per-test
/// marker; a test reported with several statuses resolves to failed over
/// passed over skipped.
#[derive(Debug, Clone)]
pub struct LineParser {
    id: String,
    rules: Vec<LineRule>,
}

impl LineParser {
    pub fn new(id: impl Into<String>, rules: Vec<LineRule>) -> Self {
        Self {
            id: id.into(),
            rules,
        }
    }

    /// `go test -v` output: `--- PASS: TestX` lines plus failing packages.
    ///
    /// A package `ok` line is not a test id: a package that only starts
    /// compiling after the fix must not count as a test that flipped.
    pub fn go_test() -> Self {
        Self::new(
            "go_test",
            builtin(&[
                (TestStatus::Passed, r"^--- PASS: (\S+)", ""),
                (TestStatus::Failed, r"^--- FAIL: (\S+)", ""),
                (TestStatus::Skipped, r"^--- SKIP: (\S+)", ""),
                (TestStatus::Failed, r"^FAIL\s+(\S+)", "pkg::"),
            ]),
        )
    }

    /// pytest output, both verbose (`path::test PASSED`) and `-rA` summary
    /// (`PASSED path::test`) forms.
    pub fn pytest() -> Self {
        Self::new(
            "pytest",
            builtin(&[
                (TestStatus::Passed, r"^PASSED (\S+::\S+)", ""),
                (TestStatus::Passed, r"^(\S+::\S+) PASSED", ""),
                (TestStatus::Passed, r"^XPASS (\S+::\S+)", ""),
                (TestStatus::Failed, r"^FAILED (\S+::\S+)", ""),
                (TestStatus::Failed, r"^(\S+::\S+) FAILED", ""),
                (TestStatus::Failed, r"^ERROR (\S+::\S+)", ""),
                (TestStatus::Failed, r"^(\S+::\S+) ERROR", ""),
                (TestStatus::Skipped, r"^SKIPPED (\S+::\S+)", ""),
                (TestStatus::Skipped, r"^(\S+::\S+) SKIPPED", ""),
                (TestStatus::Skipped, r"^XFAIL (\S+::\S+)", ""),
                (TestStatus::Skipped, r"^(\S+::\S+) XFAIL", ""),
            ]),
        )
    }

    /// libtest output from `cargo test`: `test path ... ok`.
    pub fn cargo_test() -> Self {
        Self::new(
            "cargo_test",
            builtin(&[
                (TestStatus::Passed, r"^test (\S+) \.\.\. ok$", ""),
                (TestStatus::Failed, r"^test (\S+) \.\.\. FAILED$", ""),
                (TestStatus::Skipped, r"^test (\S+) \.\.\. ignored", ""),
            ]),
        )
    }
}

fn builtin(patterns: &[(TestStatus, &str, &'static str)]) -> Vec<LineRule> {
    patterns
        .iter()
        .map(|&(status, pattern, prefix)| {
            LineRule::new(status, pattern)
                .expect("Invalid built-in log regex")
                .with_prefix(prefix)
        })
        .collect()
}

impl LogParser for LineParser {
    fn id(&self) -> &str {
        &self.id
    }

    fn parse(&self, log: &str) -> TestResult {
        let mut tally = StatusTally::default();
        for line in log.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            for rule in &self.rules {
                if let Some(id) = rule.apply(line) {
                    tally.explicit(id, rule.status);
                }
            }
        }
        tally.finish()
    }
}
