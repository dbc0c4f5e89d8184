//! Per-ecosystem image templates and script rendering.
//!
//! A template is plain data: the registry image to start from, the system
//! setup run on top of it, the dependency install steps and the test
//! command. Toolchain hooks are pure functions from a manifest's contents to
//! a toolchain version; they never touch the network or the filesystem.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::ecosystem::Ecosystem;

/// Exit code reserved by the stage scripts for a patch that does not apply.
pub const PATCH_APPLY_EXIT_CODE: i64 = 97;

/// Line printed by the stage scripts right before exiting with
/// [`PATCH_APPLY_EXIT_CODE`].
pub const PATCH_APPLY_MARKER: &str = ">>>>> swe-harness: patch apply failed";

/// Container directory holding the injected files.
pub const HOME_DIR: &str = "/home";

/// Injected file names, in the order they are copied into the image.
pub const INJECTED_FILES: [&str; 7] = [
    "fix.patch",
    "test.patch",
    "check_git_changes.sh",
    "prepare.sh",
    "run.sh",
    "test-run.sh",
    "fix-run.sh",
];

/// Reads a toolchain version from one manifest file of a checkout.
#[derive(Clone, Copy)]
pub struct ToolchainHook {
    /// Manifest path relative to the repository root.
    pub file: &'static str,
    pub detect: fn(&str) -> Option<String>,
}

impl std::fmt::Debug for ToolchainHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolchainHook").field("file", &self.file).finish_non_exhaustive()
    }
}

/// Declarative description of how to build and test one ecosystem.
#[derive(Debug)]
pub struct EcosystemTemplate {
    pub ecosystem: Ecosystem,
    /// Registry repository of the base image, e.g. `golang`.
    pub base_image: &'static str,
    pub default_version: &'static str,
    /// Tag of the base image; `{version}` is replaced by the toolchain version.
    pub tag_format: &'static str,
    pub system_setup: &'static [&'static str],
    pub env: &'static [&'static str],
    /// Dependency installation, run once in the PR image after checkout.
    pub install: &'static [&'static str],
    pub test_command: &'static str,
    pub toolchain: Option<ToolchainHook>,
}

const APT_GIT: &str = "apt-get update && apt-get install -y --no-install-recommends git ca-certificates && rm -rf /var/lib/apt/lists/*";

static TEMPLATES: [EcosystemTemplate; 4] = [
    EcosystemTemplate {
        ecosystem: Ecosystem::Go,
        base_image: "golang",
        default_version: "latest",
        tag_format: "{version}",
        system_setup: &[],
        env: &["GOFLAGS=-buildvcs=false"],
        install: &["go mod download || true"],
        test_command: "go test -v -count=1 ./...",
        toolchain: Some(ToolchainHook {
            file: "go.mod",
            detect: go_mod_version,
        }),
    },
    EcosystemTemplate {
        ecosystem: Ecosystem::Java,
        base_image: "maven",
        default_version: "17",
        tag_format: "3-eclipse-temurin-{version}",
        system_setup: &[APT_GIT],
        env: &["MAVEN_OPTS=-Xmx2g"],
        install: &[],
        test_command: "mvn clean test -B -Dmaven.test.skip=false -DfailIfNoTests=false",
        toolchain: Some(ToolchainHook {
            file: "pom.xml",
            detect: maven_java_version,
        }),
    },
    EcosystemTemplate {
        ecosystem: Ecosystem::Python,
        base_image: "python",
        default_version: "3.11",
        tag_format: "{version}-slim",
        system_setup: &[APT_GIT],
        env: &["PIP_NO_CACHE_DIR=1", "PYTHONDONTWRITEBYTECODE=1"],
        install: &[
            "pip install -e . || pip install -r requirements.txt || true",
            "pip install pytest",
        ],
        test_command: "pytest -rA --no-header -p no:cacheprovider",
        toolchain: Some(ToolchainHook {
            file: ".python-version",
            detect: python_version_file,
        }),
    },
    EcosystemTemplate {
        ecosystem: Ecosystem::Rust,
        base_image: "rust",
        default_version: "latest",
        tag_format: "{version}",
        system_setup: &[],
        env: &["CARGO_TERM_COLOR=never"],
        install: &["cargo fetch"],
        test_command: "cargo test --no-fail-fast",
        toolchain: Some(ToolchainHook {
            file: "rust-toolchain.toml",
            detect: rust_toolchain_channel,
        }),
    },
];

impl EcosystemTemplate {
    pub fn for_ecosystem(ecosystem: Ecosystem) -> &'static EcosystemTemplate {
        TEMPLATES
            .iter()
            .find(|t| t.ecosystem == ecosystem)
            .unwrap_or(&TEMPLATES[0])
    }

    /// Registry reference for a toolchain version, e.g. `golang:1.22`.
    pub fn base_reference(&self, version: &str) -> String {
        format!(
            "{}:{}",
            self.base_image,
            self.tag_format.replace("{version}", version)
        )
    }

    /// Toolchain version for a checkout, falling back to the default when
    /// there is no checkout or the manifest names no version.
    pub fn toolchain_version(&self, checkout: Option<&Path>) -> String {
        let detected = match (self.toolchain, checkout) {
            (Some(hook), Some(dir)) => std::fs::read_to_string(dir.join(hook.file))
                .ok()
                .and_then(|content| (hook.detect)(&content)),
            _ => None,
        };
        match detected {
            Some(version) => {
                debug!(ecosystem = %self.ecosystem, version = %version, "Detected toolchain version");
                version
            }
            None => self.default_version.to_string(),
        }
    }
}

/// `go 1.22.3` in go.mod → `1.22`.
pub fn go_mod_version(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let version = line.trim().strip_prefix("go ")?.trim();
        let mut parts = version.split('.');
        let major = parts.next().filter(|p| p.chars().all(|c| c.is_ascii_digit()))?;
        let minor = parts.next().filter(|p| p.chars().all(|c| c.is_ascii_digit()))?;
        if major.is_empty() || minor.is_empty() {
            return None;
        }
        Some(format!("{major}.{minor}"))
    })
}

/// Java release from the usual Maven properties; `1.8` → `8`.
pub fn maven_java_version(content: &str) -> Option<String> {
    const TAGS: [&str; 4] = [
        "maven.compiler.release",
        "maven.compiler.source",
        "java.version",
        "maven.compiler.target",
    ];
    TAGS.iter().find_map(|tag| {
        let open = format!("<{tag}>");
        let start = content.find(&open)? + open.len();
        let end = content[start..].find('<')? + start;
        let raw = content[start..end].trim();
        let version = raw.strip_prefix("1.").unwrap_or(raw);
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(version.to_string())
    })
}

/// `3.10.4` in .python-version → `3.10`.
pub fn python_version_file(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty() && !l.starts_with('#'))?;
    let mut parts = line.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    if major != "3" || minor.is_empty() || !minor.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{major}.{minor}"))
}

/// Pinned numeric `channel` in rust-toolchain.toml; named channels are ignored.
pub fn rust_toolchain_channel(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("channel")?.trim_start().strip_prefix('=')?;
        let value = rest.trim().trim_matches('"');
        if value.starts_with(|c: char| c.is_ascii_digit()) {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// `ENV` lines for `KEY=VALUE` pairs. Values are double-quoted so spaces
/// survive Dockerfile parsing.
pub fn env_lines<S: AsRef<str>>(vars: &[S]) -> String {
    vars.iter()
        .map(|v| match v.as_ref().split_once('=') {
            Some((key, value)) => {
                let quoted = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("ENV {key}=\"{quoted}\"\n")
            }
            None => format!("ENV {}\n", v.as_ref()),
        })
        .collect()
}

/// Lines resetting every global variable once a layer's commands have run.
pub fn clear_env_lines<S: AsRef<str>>(vars: &[S], clear_env: bool) -> String {
    if !clear_env {
        return String::new();
    }
    vars.iter()
        .filter_map(|v| v.as_ref().split_once('=').map(|(key, _)| key))
        .map(|key| format!("ENV {key}=\n"))
        .collect()
}

const CHECK_GIT_CHANGES: &str = r#"#!/bin/bash
set -e

if ! git rev-parse --is-inside-work-tree > /dev/null 2>&1; then
  echo "check_git_changes: not a git work tree"
  exit 1
fi

if [[ -n $(git status --porcelain) ]]; then
  echo "check_git_changes: work tree has uncommitted changes"
  git status --short
  exit 1
fi

echo "check_git_changes: clean"
"#;

fn apply_block(patches: &[&str]) -> String {
    let paths: Vec<String> = patches.iter().map(|p| format!("{HOME_DIR}/{p}")).collect();
    format!(
        "if ! git apply --whitespace=nowarn {paths}; then\n  echo \"{PATCH_APPLY_MARKER}\"\n  exit {PATCH_APPLY_EXIT_CODE}\nfi\n",
        paths = paths.join(" ")
    )
}

fn stage_script(repo: &str, patches: &[&str], test_command: &str) -> String {
    let mut script = format!("#!/bin/bash\nset -e\n\ncd {HOME_DIR}/{repo}\n");
    if !patches.is_empty() {
        script.push_str(&apply_block(patches));
    }
    script.push_str(test_command);
    script.push('\n');
    script
}

/// Inputs of the per-instance scripts.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub repo: &'a str,
    pub base_commit: &'a str,
    pub install: &'a [&'a str],
    pub test_command: &'a str,
    pub fix_patch: &'a str,
    pub test_patch: &'a str,
}

/// Renders every injected file of a PR image.
pub fn render_files(ctx: &ScriptContext<'_>) -> BTreeMap<String, Vec<u8>> {
    let mut prepare = format!(
        "#!/bin/bash\nset -e\n\ncd {HOME_DIR}/{repo}\ngit reset --hard\nbash {HOME_DIR}/check_git_changes.sh\ngit checkout {commit}\nbash {HOME_DIR}/check_git_changes.sh\n",
        repo = ctx.repo,
        commit = ctx.base_commit,
    );
    for step in ctx.install {
        prepare.push_str(step);
        prepare.push('\n');
    }
    // Warm dependency caches; failures here are expected on broken bases.
    prepare.push_str(&format!("{} || true\n", ctx.test_command));

    let mut files = BTreeMap::new();
    files.insert("fix.patch".to_string(), ctx.fix_patch.as_bytes().to_vec());
    files.insert("test.patch".to_string(), ctx.test_patch.as_bytes().to_vec());
    files.insert(
        "check_git_changes.sh".to_string(),
        CHECK_GIT_CHANGES.as_bytes().to_vec(),
    );
    files.insert("prepare.sh".to_string(), prepare.into_bytes());
    files.insert(
        "run.sh".to_string(),
        stage_script(ctx.repo, &[], ctx.test_command).into_bytes(),
    );
    files.insert(
        "test-run.sh".to_string(),
        stage_script(ctx.repo, &["test.patch"], ctx.test_command).into_bytes(),
    );
    files.insert(
        "fix-run.sh".to_string(),
        stage_script(ctx.repo, &["test.patch", "fix.patch"], ctx.test_command).into_bytes(),
    );
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_go_mod_version() {
        let gomod = "module github.com/gin-gonic/gin\n\ngo 1.21.5\n\nrequire (\n)\n";
        assert_eq!(go_mod_version(gomod).as_deref(), Some("1.21"));
        assert_eq!(go_mod_version("module x\n"), None);
        assert_eq!(go_mod_version("go latest\n"), None);
    }

    #[test]
    fn test_maven_java_version() {
        let pom = "<properties>\n  <maven.compiler.source>1.8</maven.compiler.source>\n</properties>";
        assert_eq!(maven_java_version(pom).as_deref(), Some("8"));
        let pom = "<properties><java.version>17</java.version></properties>";
        assert_eq!(maven_java_version(pom).as_deref(), Some("17"));
        let pom = "<properties><java.version>${jdk}</java.version></properties>";
        assert_eq!(maven_java_version(pom), None);
    }

    #[test]
    fn test_python_and_rust_hooks() {
        assert_eq!(python_version_file("3.10.4\n").as_deref(), Some("3.10"));
        assert_eq!(python_version_file("pypy3.9\n"), None);
        assert_eq!(
            rust_toolchain_channel("[toolchain]\nchannel = \"1.75.0\"\n").as_deref(),
            Some("1.75.0")
        );
        assert_eq!(rust_toolchain_channel("[toolchain]\nchannel = \"stable\"\n"), None);
    }

    #[test]
    fn test_toolchain_version_reads_checkout() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("go.mod"), "module x\n\ngo 1.22\n").unwrap();
        let go = EcosystemTemplate::for_ecosystem(Ecosystem::Go);
        assert_eq!(go.toolchain_version(Some(tmp.path())), "1.22");
        assert_eq!(go.toolchain_version(None), "latest");
        assert_eq!(go.base_reference("1.22"), "golang:1.22");

        let java = EcosystemTemplate::for_ecosystem(Ecosystem::Java);
        assert_eq!(java.toolchain_version(Some(tmp.path())), "17");
        assert_eq!(java.base_reference("11"), "maven:3-eclipse-temurin-11");
    }

    #[test]
    fn test_every_ecosystem_has_a_template() {
        for eco in Ecosystem::ALL {
            assert_eq!(EcosystemTemplate::for_ecosystem(eco).ecosystem, eco);
        }
    }

    #[test]
    fn test_env_rendering() {
        let vars = vec!["HTTP_PROXY=http://proxy:3128".to_string(), "NOVALUE".to_string()];
        assert_eq!(
            env_lines(&vars),
            "ENV HTTP_PROXY=\"http://proxy:3128\"\nENV NOVALUE\n"
        );
        assert_eq!(clear_env_lines(&vars, true), "ENV HTTP_PROXY=\n");
        assert_eq!(clear_env_lines(&vars, false), "");
    }

    #[test]
    fn test_env_values_with_spaces_are_quoted() {
        let vars = vec!["MAVEN_OPTS=-Xmx2g -Dfile.encoding=UTF-8", r#"GREETING=say "hi""#];
        assert_eq!(
            env_lines(&vars),
            "ENV MAVEN_OPTS=\"-Xmx2g -Dfile.encoding=UTF-8\"\nENV GREETING=\"say \\\"hi\\\"\"\n"
        );
    }

    #[test]
    fn test_rendered_scripts() {
        let files = render_files(&ScriptContext {
            repo: "gin",
            base_commit: "abc123",
            install: &["go mod download || true"],
            test_command: "go test -v ./...",
            fix_patch: "FIX",
            test_patch: "TEST",
        });
        assert_eq!(files.len(), INJECTED_FILES.len());
        for name in INJECTED_FILES {
            assert!(files.contains_key(name), "missing {name}");
        }

        let prepare = String::from_utf8(files["prepare.sh"].clone()).unwrap();
        assert!(prepare.contains("git checkout abc123"));
        assert!(prepare.contains("go test -v ./... || true"));

        let run = String::from_utf8(files["run.sh"].clone()).unwrap();
        assert!(!run.contains("git apply"));

        let fix_run = String::from_utf8(files["fix-run.sh"].clone()).unwrap();
        assert!(fix_run.contains("git apply --whitespace=nowarn /home/test.patch /home/fix.patch"));
        assert!(fix_run.contains(PATCH_APPLY_MARKER));
        assert!(fix_run.contains("exit 97"));
        assert!(fix_run.trim_end().ends_with("go test -v ./..."));
    }
}
