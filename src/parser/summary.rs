//! Block/summary matcher for Maven Surefire output.
//!
//! Surefire reports one aggregate line per test class:
//!
//! ```text
//! Running com.example.FooTest
//! Tests run: 3, Failures: 1, Errors: 0, Skipped: 0, Time elapsed: 0.05 sec <<< FAILURE!
//! ```
//!
//! or, in Surefire 3, a single line ending in `- in com.example.FooTest`.
//! Classes are classified from those counts; per-method failure markers
//! (`testBar(com.example.FooTest)  Time elapsed: ... <<< FAILURE!`) are
//! explicit and override whatever the counts implied for the same id.

use regex::Regex;

use super::{LogParser, StatusTally, TestResult, TestStatus};

/// Parser for Maven Surefire class summaries and method markers.
#[derive(Debug, Clone)]
pub struct SurefireParser {
    log_prefix: Regex,
    running: Regex,
    counts: Regex,
    class_suffix: Regex,
    method_legacy: Regex,
    method_qualified: Regex,
}

impl Default for SurefireParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate counts of one class summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClassCounts {
    run: u64,
    failures: u64,
    errors: u64,
    skipped: u64,
}

impl ClassCounts {
    fn status(&self) -> TestStatus {
        if self.failures > 0 || self.errors > 0 {
            TestStatus::Failed
        } else if self.skipped == self.run {
            TestStatus::Skipped
        } else {
            TestStatus::Passed
        }
    }
}

fn marker_status(line: &str) -> Option<TestStatus> {
    if line.contains("<<< FAILURE!") || line.contains("<<< ERROR!") {
        Some(TestStatus::Failed)
    } else if line.contains("<<<") {
        None
    } else {
        Some(TestStatus::Passed)
    }
}

impl SurefireParser {
    pub fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("Invalid Surefire regex");
        Self {
            log_prefix: compile(r"^\[(?:INFO|ERROR|WARNING|WARN)\]\s*"),
            running: compile(r"^Running\s+([\w.$]+)\s*$"),
            counts: compile(
                r"^Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+),\s*Skipped:\s*(\d+)",
            ),
            class_suffix: compile(r"-{1,2}\s*in\s+([\w.$]+)\s*$"),
            method_legacy: compile(r"^(\w+)\(([\w.$]+)\)\s+Time elapsed:"),
            method_qualified: compile(r"^([\w.$]+)\.(\w+)\s+Time elapsed:"),
        }
    }

    fn parse_counts(&self, line: &str) -> Option<ClassCounts> {
        let caps = self.counts.captures(line)?;
        let num = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u64>().ok());
        Some(ClassCounts {
            run: num(1)?,
            failures: num(2)?,
            errors: num(3)?,
            skipped: num(4)?,
        })
    }

    /// Extracts `(class, method)` from a per-method timing line.
    fn method_marker(&self, line: &str) -> Option<(String, String)> {
        if let Some(caps) = self.method_legacy.captures(line) {
            return Some((caps[2].to_string(), caps[1].to_string()));
        }
        self.method_qualified
            .captures(line)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
    }
}

impl LogParser for SurefireParser {
    fn id(&self) -> &str {
        "maven_surefire"
    }

    fn parse(&self, log: &str) -> TestResult {
        let mut tally = StatusTally::default();
        let mut current_class: Option<String> = None;

        for raw in log.lines() {
            let trimmed = raw.trim();
            let stripped = self.log_prefix.replace(trimmed, "");
            let line: &str = &stripped;
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = self.running.captures(line) {
                current_class = Some(caps[1].to_string());
                continue;
            }

            if let Some(counts) = self.parse_counts(line) {
                // Only per-class lines carry a timing; the final module
                // aggregate does not and names no class.
                if !line.contains("Time elapsed") {
                    continue;
                }
                let running = current_class.take();
                let class = self
                    .class_suffix
                    .captures(line)
                    .map(|caps| caps[1].to_string())
                    .or(running);
                if let Some(class) = class {
                    tally.inferred(class.clone(), counts.status());
                    if marker_status(line) == Some(TestStatus::Failed) {
                        tally.explicit(class, TestStatus::Failed);
                    }
                }
                continue;
            }

            if let Some((class, method)) = self.method_marker(line) {
                match marker_status(line) {
                    Some(TestStatus::Failed) => {
                        tally.explicit(format!("{class}.{method}"), TestStatus::Failed);
                        tally.explicit(class, TestStatus::Failed);
                    }
                    Some(status) => tally.explicit(format!("{class}.{method}"), status),
                    None => {}
                }
            }
        }

        tally.finish()
    }
}
