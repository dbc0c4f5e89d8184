//! Instance model and dataset inputs.
//!
//! An [`Instance`] is one repository + pull request pairing to evaluate. It is
//! loaded once from JSON Lines dataset files at batch start and never mutated
//! afterwards. Candidate fix patches for `evaluation` mode are loaded from
//! separate patch files as [`CandidatePatch`] records.

use serde::{Deserialize, Serialize};

pub mod loader;

pub use loader::{expand_input_paths, load_instances, load_patches};

/// `(org, repo, number)` triple naming one pull request.
pub type PullRequestKey = (String, String, u64);

/// One repository + pull request pairing to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// GitHub organization (or user) owning the repository.
    pub org: String,
    /// Repository name without the organization.
    pub repo: String,
    /// Pull request number.
    pub number: u64,
    /// Stable identifier, `<org>__<repo>-<number>` unless given explicitly.
    pub instance_id: String,
    /// Commit the patches are applied against.
    pub base_commit: String,
    /// Declared language / ecosystem. May be empty for registered repositories.
    pub language: String,
    /// Candidate fix, as a `git apply` compatible unified diff.
    pub fix_patch: String,
    /// Test-only diff exposing the regression.
    pub test_patch: String,
}

impl Instance {
    /// Default identifier for an `(org, repo, number)` triple.
    pub fn default_id(org: &str, repo: &str, number: u64) -> String {
        format!("{org}__{repo}-{number}")
    }

    /// Pull request this instance was built from, independent of its id.
    pub fn pr_key(&self) -> PullRequestKey {
        (self.org.clone(), self.repo.clone(), self.number)
    }

    /// `org/repo` form, as used by source control URLs.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// Returns a copy of this instance carrying a different fix patch.
    pub fn with_fix_patch(&self, fix_patch: impl Into<String>) -> Self {
        Self {
            fix_patch: fix_patch.into(),
            ..self.clone()
        }
    }

    /// Checks that every field rendered into Dockerfiles and scripts is shell-safe.
    pub fn validate(&self) -> Result<(), String> {
        validate_name_part("org", &self.org)?;
        validate_name_part("repo", &self.repo)?;
        validate_git_ref(&self.base_commit)?;
        if self.number == 0 {
            return Err("pull request number must be positive".to_string());
        }
        validate_instance_id(&self.instance_id)
    }
}

/// Candidate fix patch produced by an upstream patch generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePatch {
    pub org: String,
    pub repo: String,
    pub number: u64,
    pub fix_patch: String,
}

impl CandidatePatch {
    pub fn pr_key(&self) -> PullRequestKey {
        (self.org.clone(), self.repo.clone(), self.number)
    }
}

/// Validate an instance id, which names a log directory.
///
/// Same character set as [`validate_name_part`], with room for the default
/// `<org>__<repo>-<number>` form.
pub fn validate_instance_id(s: &str) -> Result<(), String> {
    validate_path_component("instance_id", s, 300)
}

/// Validate a git ref (commit SHA, branch name) to prevent shell injection.
///
/// Accepts hex SHAs and standard ref names (alphanumeric, `/`, `.`, `-`, `_`).
/// Rejects shell metacharacters, `..` sequences, and refs starting with `-`.
pub fn validate_git_ref(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("git ref is empty".to_string());
    }
    if s.len() > 256 {
        return Err(format!("git ref too long ({} chars, max 256)", s.len()));
    }
    if s.starts_with('-') {
        return Err(format!("git ref '{s}' must not start with '-'"));
    }
    if s.contains("..") {
        return Err(format!("git ref '{s}' must not contain '..'"));
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_'))
    {
        return Err(format!("invalid character '{ch}' in git ref '{s}'"));
    }
    Ok(())
}

/// Validate one half of an `org/repo` pair.
///
/// Only alphanumerics, `-`, `_` and `.` are allowed, and the name must not
/// start with `.` or `-`.
pub fn validate_name_part(field: &str, s: &str) -> Result<(), String> {
    validate_path_component(field, s, 128)
}

fn validate_path_component(field: &str, s: &str, max_len: usize) -> Result<(), String> {
    if s.is_empty() {
        return Err(format!("{field} is empty"));
    }
    if s.len() > max_len {
        return Err(format!("{field} '{s}' too long ({} chars, max {max_len})", s.len()));
    }
    if s.starts_with('.') || s.starts_with('-') {
        return Err(format!("{field} '{s}' must not start with '.' or '-'"));
    }
    if let Some(ch) = s
        .chars()
        .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(format!("invalid character '{ch}' in {field} '{s}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        Instance {
            org: "gin-gonic".to_string(),
            repo: "gin".to_string(),
            number: 3741,
            instance_id: Instance::default_id("gin-gonic", "gin", 3741),
            base_commit: "a1b2c3d4".to_string(),
            language: "go".to_string(),
            fix_patch: "diff --git a/x b/x".to_string(),
            test_patch: "diff --git a/y b/y".to_string(),
        }
    }

    #[test]
    fn test_default_id() {
        assert_eq!(Instance::default_id("apache", "dubbo", 12), "apache__dubbo-12");
        assert_eq!(instance().full_name(), "gin-gonic/gin");
    }

    #[test]
    fn test_validate_accepts_well_formed_instance() {
        assert!(instance().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shell_injection() {
        let mut bad = instance();
        bad.repo = "gin; rm -rf /".to_string();
        assert!(bad.validate().is_err());

        let mut bad = instance();
        bad.base_commit = "$(whoami)".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_git_ref() {
        assert!(validate_git_ref("a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2").is_ok());
        assert!(validate_git_ref("feature/my-branch").is_ok());
        assert!(validate_git_ref("").is_err());
        assert!(validate_git_ref("--exec=id").is_err());
        assert!(validate_git_ref("main..HEAD").is_err());
        assert!(validate_git_ref(&"a".repeat(257)).is_err());
    }

    #[test]
    fn test_validate_name_part() {
        assert!(validate_name_part("org", "apache").is_ok());
        assert!(validate_name_part("repo", "project.js").is_ok());
        assert!(validate_name_part("repo", ".hidden").is_err());
        assert!(validate_name_part("repo", "a/b").is_err());
        assert!(validate_name_part("org", "").is_err());
    }

    #[test]
    fn test_with_fix_patch_keeps_other_fields() {
        let replaced = instance().with_fix_patch("candidate");
        assert_eq!(replaced.fix_patch, "candidate");
        assert_eq!(replaced.test_patch, instance().test_patch);
        assert_eq!(replaced.instance_id, instance().instance_id);
    }

    #[test]
    fn test_candidate_matches_instance_by_pull_request() {
        let candidate = CandidatePatch {
            org: "gin-gonic".to_string(),
            repo: "gin".to_string(),
            number: 3741,
            fix_patch: String::new(),
        };
        let mut renamed = instance();
        renamed.instance_id = "gin-gonic__gin-3741-v2".to_string();
        assert_eq!(candidate.pr_key(), renamed.pr_key());
    }

    #[test]
    fn test_validate_rejects_path_like_instance_id() {
        for id in ["../../../escaped", "a/b", "..", ".hidden", ""] {
            let mut bad = instance();
            bad.instance_id = id.to_string();
            assert!(bad.validate().is_err(), "{id:?} accepted");
        }

        let mut long = instance();
        long.instance_id = format!("{}__{}-1", "o".repeat(128), "r".repeat(128));
        assert!(long.validate().is_ok());
    }
}
