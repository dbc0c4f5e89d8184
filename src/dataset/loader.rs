//! JSON Lines loaders for dataset and candidate patch files.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{CandidatePatch, Instance, PullRequestKey};
use crate::error::DatasetError;

/// Dataset record as produced by the upstream dataset builder.
///
/// The base commit is accepted either flat (`base_commit`) or nested
/// (`base.sha`), since both shapes exist in the wild.
#[derive(Debug, Deserialize)]
struct DatasetRecord {
    org: String,
    repo: String,
    number: u64,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    base_commit: Option<String>,
    #[serde(default)]
    base: Option<BaseRef>,
    #[serde(default, alias = "ecosystem")]
    language: Option<String>,
    #[serde(default)]
    fix_patch: String,
    #[serde(default)]
    test_patch: String,
}

#[derive(Debug, Deserialize)]
struct BaseRef {
    #[serde(default)]
    sha: String,
}

impl DatasetRecord {
    fn into_instance(self) -> Result<Instance, String> {
        let base_commit = self
            .base_commit
            .filter(|c| !c.is_empty())
            .or_else(|| self.base.map(|b| b.sha).filter(|c| !c.is_empty()))
            .ok_or_else(|| "missing base_commit (or base.sha)".to_string())?;

        if self.test_patch.trim().is_empty() {
            return Err("missing test_patch".to_string());
        }

        let instance_id = self
            .instance_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Instance::default_id(&self.org, &self.repo, self.number));

        let instance = Instance {
            org: self.org,
            repo: self.repo,
            number: self.number,
            instance_id,
            base_commit,
            language: self.language.unwrap_or_default(),
            fix_patch: self.fix_patch,
            test_patch: self.test_patch,
        };
        instance.validate()?;
        Ok(instance)
    }
}

/// Expand configured input paths into concrete files.
///
/// Plain files are kept as given; directories are walked recursively for
/// `*.jsonl` files, sorted for a stable load order.
pub fn expand_input_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| p.extension().map(|ext| ext == "jsonl").unwrap_or(false))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    files
}

fn read_lines(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Load every instance from the given dataset files.
///
/// Blank lines are ignored. When two records share an instance id the first
/// one wins and the later one is dropped with a warning.
pub fn load_instances(paths: &[PathBuf]) -> Result<Vec<Instance>, DatasetError> {
    let mut instances = Vec::new();
    let mut seen = HashSet::new();

    for path in expand_input_paths(paths) {
        let content = read_lines(&path)?;
        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: DatasetRecord =
                serde_json::from_str(line).map_err(|e| DatasetError::InvalidJson {
                    path: path.display().to_string(),
                    line: line_no,
                    message: e.to_string(),
                })?;
            let instance = record
                .into_instance()
                .map_err(|message| DatasetError::InvalidRecord {
                    path: path.display().to_string(),
                    line: line_no,
                    message,
                })?;
            if !seen.insert(instance.instance_id.clone()) {
                warn!(
                    instance_id = %instance.instance_id,
                    path = %path.display(),
                    line = line_no,
                    "Duplicate instance id, keeping the first occurrence"
                );
                continue;
            }
            instances.push(instance);
        }
        debug!(path = %path.display(), total = instances.len(), "Loaded dataset file");
    }

    Ok(instances)
}

/// Load candidate fix patches keyed by pull request.
///
/// Candidates carry no instance id, so they match instances on
/// `(org, repo, number)` whatever id the dataset declares.
pub fn load_patches(
    paths: &[PathBuf],
) -> Result<HashMap<PullRequestKey, CandidatePatch>, DatasetError> {
    let mut patches = HashMap::new();

    for path in expand_input_paths(paths) {
        let content = read_lines(&path)?;
        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let candidate: CandidatePatch =
                serde_json::from_str(line).map_err(|e| DatasetError::InvalidJson {
                    path: path.display().to_string(),
                    line: line_no,
                    message: e.to_string(),
                })?;
            let key = candidate.pr_key();
            if patches.contains_key(&key) {
                warn!(
                    repo = %format!("{}/{}", candidate.org, candidate.repo),
                    number = candidate.number,
                    line = line_no,
                    "Duplicate candidate patch, keeping the first one"
                );
                continue;
            }
            patches.insert(key, candidate);
        }
    }

    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FLAT: &str = r#"{"org":"gin-gonic","repo":"gin","number":1,"base_commit":"abc123","language":"go","fix_patch":"F","test_patch":"T"}"#;
    const NESTED: &str = r#"{"org":"apache","repo":"dubbo","number":2,"base":{"label":"apache:3.2","ref":"3.2","sha":"def456"},"fix_patch":"F","test_patch":"T"}"#;

    #[test]
    fn test_load_flat_and_nested_base() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.jsonl");
        std::fs::write(&file, format!("{FLAT}\n\n{NESTED}\n")).unwrap();

        let instances = load_instances(&[file]).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance_id, "gin-gonic__gin-1");
        assert_eq!(instances[0].base_commit, "abc123");
        assert_eq!(instances[1].base_commit, "def456");
        assert_eq!(instances[1].language, "");
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.jsonl");
        let second = FLAT.replace("\"F\"", "\"other\"");
        std::fs::write(&file, format!("{FLAT}\n{second}\n")).unwrap();

        let instances = load_instances(&[file]).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].fix_patch, "F");
    }

    #[test]
    fn test_invalid_json_reports_line() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.jsonl");
        std::fs::write(&file, format!("{FLAT}\nnot json\n")).unwrap();

        match load_instances(&[file]) {
            Err(DatasetError::InvalidJson { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_base_commit_rejected() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.jsonl");
        std::fs::write(
            &file,
            r#"{"org":"a","repo":"b","number":1,"fix_patch":"F","test_patch":"T"}"#,
        )
        .unwrap();

        assert!(matches!(
            load_instances(&[file]),
            Err(DatasetError::InvalidRecord { line: 1, .. })
        ));
    }

    #[test]
    fn test_path_like_instance_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.jsonl");
        let escaping = FLAT.replace(
            "\"number\":1,",
            "\"number\":1,\"instance_id\":\"../../../escaped\",",
        );
        std::fs::write(&file, escaping).unwrap();

        assert!(matches!(
            load_instances(&[file]),
            Err(DatasetError::InvalidRecord { line: 1, .. })
        ));
    }

    #[test]
    fn test_directory_inputs_are_expanded() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("b.jsonl"), NESTED).unwrap();
        std::fs::write(tmp.path().join("a.jsonl"), FLAT).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let instances = load_instances(&[tmp.path().to_path_buf()]).unwrap();
        assert_eq!(instances.len(), 2);
    }

    #[test]
    fn test_load_patches() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("patches.jsonl");
        std::fs::write(
            &file,
            r#"{"org":"gin-gonic","repo":"gin","number":1,"fix_patch":"candidate"}"#,
        )
        .unwrap();

        let patches = load_patches(&[file]).unwrap();
        let key = ("gin-gonic".to_string(), "gin".to_string(), 1);
        assert_eq!(patches[&key].fix_patch, "candidate");
    }
}
