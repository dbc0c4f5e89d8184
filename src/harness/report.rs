//! Incremental report output.
//!
//! Files under `output_dir`:
//! - `evaluation_records.jsonl`: one record per line, flushed as each
//!   instance finishes, so an interrupted batch keeps completed results;
//! - `final_report.json`: every record plus summary counts, written when the
//!   batch ends (including after an abort);
//! - `final_dataset.jsonl`: `dataset` mode only, one entry per RESOLVED
//!   instance.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::Instance;
use crate::error::ErrorKind;
use crate::evaluation::{EvaluationRecord, Outcome};
use crate::harness::config::Mode;

pub const RECORDS_FILE: &str = "evaluation_records.jsonl";
pub const REPORT_FILE: &str = "final_report.json";
pub const DATASET_FILE: &str = "final_dataset.jsonl";

/// Aggregate counts over a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub error: usize,
    pub errors_by_kind: BTreeMap<ErrorKind, usize>,
    /// Instances whose image chain was built in `image` mode.
    pub images_built: usize,
}

impl Summary {
    pub fn add(&mut self, record: &EvaluationRecord) {
        self.total += 1;
        match record.outcome {
            Outcome::Resolved => self.resolved += 1,
            Outcome::Unresolved => self.unresolved += 1,
            Outcome::Error => {
                self.error += 1;
                if let Some(kind) = record.error_kind {
                    *self.errors_by_kind.entry(kind).or_default() += 1;
                }
            }
        }
    }
}

/// The aggregate report of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// True when the batch stopped early (abort or `stop_on_error`).
    pub halted: bool,
    pub summary: Summary,
    pub records: Vec<EvaluationRecord>,
}

/// Validated dataset entry emitted for a RESOLVED instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub instance_id: String,
    pub base_commit: String,
    pub language: String,
    pub fix_patch: String,
    pub test_patch: String,
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: BTreeSet<String>,
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: BTreeSet<String>,
}

impl DatasetEntry {
    /// Entry for a RESOLVED record; `None` for any other outcome.
    pub fn from_resolved(instance: &Instance, record: &EvaluationRecord) -> Option<Self> {
        if record.outcome != Outcome::Resolved {
            return None;
        }
        Some(Self {
            org: instance.org.clone(),
            repo: instance.repo.clone(),
            number: instance.number,
            instance_id: instance.instance_id.clone(),
            base_commit: instance.base_commit.clone(),
            language: instance.language.clone(),
            fix_patch: instance.fix_patch.clone(),
            test_patch: instance.test_patch.clone(),
            fail_to_pass: record.fail_to_pass.clone(),
            pass_to_pass: record.transitions.pass_to_pass.clone(),
        })
    }
}

fn append_json_line<T: Serialize>(file: &mut File, value: &T) -> io::Result<()> {
    let mut line = serde_json::to_string(value).map_err(io::Error::other)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.flush()
}

/// Owns the output files of one batch.
pub struct ReportWriter {
    output_dir: PathBuf,
    records: File,
    dataset: Option<File>,
    report: Report,
}

impl ReportWriter {
    /// Creates `output_dir` and truncates the per-batch files.
    pub fn create(output_dir: &Path, mode: Mode) -> io::Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(output_dir.join(name))
        };
        let records = open(RECORDS_FILE)?;
        let dataset = if mode == Mode::Dataset {
            Some(open(DATASET_FILE)?)
        } else {
            None
        };

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            records,
            dataset,
            report: Report {
                mode,
                started_at: Utc::now(),
                finished_at: None,
                halted: false,
                summary: Summary::default(),
                records: Vec::new(),
            },
        })
    }

    pub fn summary(&self) -> &Summary {
        &self.report.summary
    }

    /// Appends one record, and its dataset entry if any, flushing both.
    pub fn append(
        &mut self,
        record: EvaluationRecord,
        entry: Option<&DatasetEntry>,
    ) -> io::Result<()> {
        append_json_line(&mut self.records, &record)?;
        if let (Some(file), Some(entry)) = (self.dataset.as_mut(), entry) {
            append_json_line(file, entry)?;
        }
        debug!(instance_id = %record.instance_id, outcome = %record.outcome, "Record written");
        self.report.summary.add(&record);
        self.report.records.push(record);
        Ok(())
    }

    pub fn image_built(&mut self) {
        self.report.summary.images_built += 1;
    }

    /// Writes `final_report.json` and returns the report.
    ///
    /// Records are sorted by instance id so the file does not depend on
    /// completion order.
    pub fn finish(mut self, halted: bool) -> io::Result<Report> {
        self.report.halted = halted;
        self.report.finished_at = Some(Utc::now());
        self.report
            .records
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let path = self.output_dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(&self.report).map_err(io::Error::other)?;
        std::fs::write(&path, json)?;

        let s = &self.report.summary;
        info!(
            path = %path.display(),
            total = s.total,
            resolved = s.resolved,
            unresolved = s.unresolved,
            error = s.error,
            halted,
            "Report written"
        );
        Ok(self.report)
    }
}

/// Reads back an `evaluation_records.jsonl` file.
pub fn load_records(path: &Path) -> io::Result<Vec<EvaluationRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).map_err(io::Error::other)?);
    }
    Ok(records)
}

/// Reads back a `final_report.json` file.
pub fn load_report(path: &Path) -> io::Result<Report> {
    let content = std::fs::read(path)?;
    serde_json::from_slice(&content).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Decision;
    use tempfile::TempDir;

    fn instance(number: u64) -> Instance {
        Instance {
            org: "gin-gonic".to_string(),
            repo: "gin".to_string(),
            number,
            instance_id: Instance::default_id("gin-gonic", "gin", number),
            base_commit: "abc".to_string(),
            language: "go".to_string(),
            fix_patch: "F".to_string(),
            test_patch: "T".to_string(),
        }
    }

    fn resolved(number: u64) -> EvaluationRecord {
        let mut record = EvaluationRecord::new(
            &instance(number),
            Mode::Dataset,
            Decision::error(ErrorKind::EmptyResult, "placeholder"),
        );
        record.outcome = Outcome::Resolved;
        record.error_kind = None;
        record.error = None;
        record.fail_to_pass.insert("TestFoo".to_string());
        record.transitions.pass_to_pass.insert("TestBar".to_string());
        record
    }

    #[test]
    fn test_records_are_flushed_incrementally() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ReportWriter::create(tmp.path(), Mode::Evaluation).unwrap();
        writer.append(resolved(2), None).unwrap();

        // Readable before finish.
        let lines = load_records(&tmp.path().join(RECORDS_FILE)).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(!tmp.path().join(DATASET_FILE).exists());
    }

    #[test]
    fn test_finish_writes_sorted_report_with_summary() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ReportWriter::create(tmp.path(), Mode::Dataset).unwrap();
        writer.append(resolved(2), None).unwrap();
        let error = EvaluationRecord::new(
            &instance(1),
            Mode::Dataset,
            Decision::error(ErrorKind::PatchApplyError, "does not apply"),
        );
        writer.append(error, None).unwrap();

        let report = writer.finish(false).unwrap();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.resolved, 1);
        assert_eq!(report.summary.error, 1);
        assert_eq!(report.summary.errors_by_kind[&ErrorKind::PatchApplyError], 1);
        assert_eq!(report.records[0].instance_id, "gin-gonic__gin-1");

        let loaded = load_report(&tmp.path().join(REPORT_FILE)).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn test_dataset_entry_for_resolved_only() {
        let tmp = TempDir::new().unwrap();
        let mut writer = ReportWriter::create(tmp.path(), Mode::Dataset).unwrap();
        let record = resolved(5);
        let entry = DatasetEntry::from_resolved(&instance(5), &record).unwrap();
        writer.append(record, Some(&entry)).unwrap();
        writer.finish(false).unwrap();

        let content = std::fs::read_to_string(tmp.path().join(DATASET_FILE)).unwrap();
        assert!(content.contains("\"FAIL_TO_PASS\":[\"TestFoo\"]"));
        assert!(content.contains("\"PASS_TO_PASS\":[\"TestBar\"]"));

        let unresolved = EvaluationRecord {
            outcome: Outcome::Unresolved,
            ..resolved(6)
        };
        assert!(DatasetEntry::from_resolved(&instance(6), &unresolved).is_none());
    }
}
