//! Language ecosystems known to the harness.
//!
//! An ecosystem selects both the image template used to build a repository's
//! test environment and the log parser used to read its test output.

use serde::{Deserialize, Serialize};

/// Supported language ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    /// Go modules, tested with `go test`.
    Go,
    /// Java projects built with Maven Surefire.
    Java,
    /// Python projects tested with pytest.
    Python,
    /// Rust crates tested with `cargo test`.
    Rust,
}

impl Ecosystem {
    /// All supported ecosystems.
    pub const ALL: [Ecosystem; 4] = [
        Ecosystem::Go,
        Ecosystem::Java,
        Ecosystem::Python,
        Ecosystem::Rust,
    ];

    /// Parses an ecosystem identifier, accepting common aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "go" | "golang" => Some(Self::Go),
            "java" | "java-maven" | "maven" | "kotlin" => Some(Self::Java),
            "python" | "py" | "pytest" => Some(Self::Python),
            "rust" | "rs" | "cargo" => Some(Self::Rust),
            _ => None,
        }
    }

    /// Canonical identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Java => "java",
            Self::Python => "python",
            Self::Rust => "rust",
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(Ecosystem::parse("golang"), Some(Ecosystem::Go));
        assert_eq!(Ecosystem::parse(" Java "), Some(Ecosystem::Java));
        assert_eq!(Ecosystem::parse("py"), Some(Ecosystem::Python));
        assert_eq!(Ecosystem::parse("cargo"), Some(Ecosystem::Rust));
        assert_eq!(Ecosystem::parse("cobol"), None);
    }

    #[test]
    fn test_round_trip_through_str() {
        for eco in Ecosystem::ALL {
            assert_eq!(Ecosystem::parse(eco.as_str()), Some(eco));
        }
    }
}
