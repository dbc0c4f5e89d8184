//! Log parser registry.
//!
//! Maps raw test-runner output to a canonical [`TestResult`]. Parsers are
//! pure: the same log always yields the same result, and a log with no
//! recognizable signal yields an empty result rather than an error.
//!
//! Two parser shapes are provided:
//! - [`LineParser`]: one or more regexes per status, matched line by line
//!   (`go test -v`, pytest, `cargo test`).
//! - [`SurefireParser`]: aggregate per-class summaries
//!   (`Tests run: N, Failures: F, Errors: E, Skipped: S`) refined by explicit
//!   per-test failure markers.
//!
//! Both resolve conflicting statuses for one test id through [`StatusTally`]:
//! explicit per-test markers override anything inferred from aggregate
//! counts, and within one layer failed beats passed beats skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ecosystem::Ecosystem;

pub mod line;
pub mod summary;

pub use line::{LineParser, LineRule};
pub use summary::SurefireParser;

/// Status of a single test within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Failed => 2,
            Self::Passed => 1,
            Self::Skipped => 0,
        }
    }
}

/// Canonical passed/failed/skipped sets derived from one run's log.
///
/// The three sets are pairwise disjoint; construction through
/// [`TestResult::from_sets`] or [`StatusTally`] enforces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TestResultRepr", into = "TestResultRepr")]
pub struct TestResult {
    passed: BTreeSet<String>,
    failed: BTreeSet<String>,
    skipped: BTreeSet<String>,
}

impl TestResult {
    /// Builds a result from possibly overlapping sets.
    ///
    /// An id present in several sets keeps the strongest status:
    /// failed over passed over skipped.
    pub fn from_sets<P, F, S>(passed: P, failed: F, skipped: S) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        let mut tally = StatusTally::default();
        for id in skipped {
            tally.explicit(id, TestStatus::Skipped);
        }
        for id in passed {
            tally.explicit(id, TestStatus::Passed);
        }
        for id in failed {
            tally.explicit(id, TestStatus::Failed);
        }
        tally.finish()
    }

    pub fn passed(&self) -> &BTreeSet<String> {
        &self.passed
    }

    pub fn failed(&self) -> &BTreeSet<String> {
        &self.failed
    }

    pub fn skipped(&self) -> &BTreeSet<String> {
        &self.skipped
    }

    pub fn passed_count(&self) -> usize {
        self.passed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Total number of distinct test ids.
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.skipped.len()
    }

    /// True when no test id was recognized at all.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Status of one test id, if it appears in this result.
    pub fn status_of(&self, id: &str) -> Option<TestStatus> {
        if self.failed.contains(id) {
            Some(TestStatus::Failed)
        } else if self.passed.contains(id) {
            Some(TestStatus::Passed)
        } else if self.skipped.contains(id) {
            Some(TestStatus::Skipped)
        } else {
            None
        }
    }
}

/// Serialized shape of a [`TestResult`], counts included for report readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestResultRepr {
    #[serde(default)]
    passed_count: usize,
    #[serde(default)]
    failed_count: usize,
    #[serde(default)]
    skipped_count: usize,
    #[serde(default)]
    passed_tests: BTreeSet<String>,
    #[serde(default)]
    failed_tests: BTreeSet<String>,
    #[serde(default)]
    skipped_tests: BTreeSet<String>,
}

impl From<TestResultRepr> for TestResult {
    fn from(repr: TestResultRepr) -> Self {
        TestResult::from_sets(repr.passed_tests, repr.failed_tests, repr.skipped_tests)
    }
}

impl From<TestResult> for TestResultRepr {
    fn from(result: TestResult) -> Self {
        Self {
            passed_count: result.passed.len(),
            failed_count: result.failed.len(),
            skipped_count: result.skipped.len(),
            passed_tests: result.passed,
            failed_tests: result.failed,
            skipped_tests: result.skipped,
        }
    }
}

/// Accumulates per-test statuses in two precedence layers.
#[derive(Debug, Default)]
pub struct StatusTally {
    explicit: BTreeMap<String, TestStatus>,
    inferred: BTreeMap<String, TestStatus>,
}

fn merge(map: &mut BTreeMap<String, TestStatus>, id: String, status: TestStatus) {
    map.entry(id)
        .and_modify(|current| {
            if status.rank() > current.rank() {
                *current = status;
            }
        })
        .or_insert(status);
}

impl StatusTally {
    /// Records a status reported for this exact test id.
    pub fn explicit(&mut self, id: impl Into<String>, status: TestStatus) {
        merge(&mut self.explicit, id.into(), status);
    }

    /// Records a status inferred from aggregate counts.
    pub fn inferred(&mut self, id: impl Into<String>, status: TestStatus) {
        merge(&mut self.inferred, id.into(), status);
    }

    /// Resolves both layers into a disjoint result.
    pub fn finish(self) -> TestResult {
        let Self {
            mut explicit,
            inferred,
        } = self;
        for (id, status) in inferred {
            explicit.entry(id).or_insert(status);
        }

        let mut result = TestResult::default();
        for (id, status) in explicit {
            match status {
                TestStatus::Passed => result.passed.insert(id),
                TestStatus::Failed => result.failed.insert(id),
                TestStatus::Skipped => result.skipped.insert(id),
            };
        }
        result
    }
}

/// A pure mapping from raw test output to a [`TestResult`].
pub trait LogParser: Send + Sync {
    /// Stable parser identifier, for logs and reports.
    fn id(&self) -> &str;

    /// Parses one run's combined stdout/stderr.
    fn parse(&self, log: &str) -> TestResult;
}

/// Lookup table from ecosystem id to parser.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn LogParser>>,
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.parsers.keys().collect();
        ids.sort();
        f.debug_struct("ParserRegistry").field("ecosystems", &ids).finish()
    }
}

fn registry_key(ecosystem: &str) -> String {
    Ecosystem::parse(ecosystem)
        .map(|eco| eco.as_str().to_string())
        .unwrap_or_else(|| ecosystem.trim().to_ascii_lowercase())
}

impl ParserRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with a parser for every built-in ecosystem.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Ecosystem::Go.as_str(), Arc::new(LineParser::go_test()));
        registry.register(Ecosystem::Java.as_str(), Arc::new(SurefireParser::new()));
        registry.register(Ecosystem::Python.as_str(), Arc::new(LineParser::pytest()));
        registry.register(Ecosystem::Rust.as_str(), Arc::new(LineParser::cargo_test()));
        registry
    }

    /// Registers (or replaces) the parser for an ecosystem id.
    pub fn register(&mut self, ecosystem: &str, parser: Arc<dyn LogParser>) {
        self.parsers.insert(registry_key(ecosystem), parser);
    }

    /// Looks up the parser for an ecosystem id, accepting aliases.
    pub fn get(&self, ecosystem: &str) -> Option<Arc<dyn LogParser>> {
        self.parsers.get(&registry_key(ecosystem)).cloned()
    }

    /// Parses a log with the ecosystem's parser.
    ///
    /// Returns `None` only when no parser is registered for the ecosystem.
    pub fn parse(&self, ecosystem: &str, log: &str) -> Option<TestResult> {
        self.get(ecosystem).map(|parser| parser.parse(log))
    }
}
