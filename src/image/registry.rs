//! Repository registrations.
//!
//! Most repositories build fine from their ecosystem template. The ones that
//! do not are registered here with the overrides they need; everything not
//! overridden falls back to the template.

use crate::ecosystem::Ecosystem;
use crate::image::templates::EcosystemTemplate;

/// Overrides for one `(org, repo)` pair.
#[derive(Debug)]
pub struct RepoRegistration {
    pub org: &'static str,
    pub repo: &'static str,
    pub ecosystem: Ecosystem,
    /// Registry image used instead of the template's toolchain image.
    pub base_image: Option<&'static str>,
    /// Replaces the template's system setup when set.
    pub system_setup: Option<&'static [&'static str]>,
    /// Added after the template's environment.
    pub env: &'static [&'static str],
    pub test_command: Option<&'static str>,
}

static REGISTRATIONS: &[RepoRegistration] = &[
    RepoRegistration {
        org: "gin-gonic",
        repo: "gin",
        ecosystem: Ecosystem::Go,
        base_image: None,
        system_setup: None,
        env: &[],
        test_command: None,
    },
    RepoRegistration {
        org: "apache",
        repo: "dubbo",
        ecosystem: Ecosystem::Java,
        base_image: Some("ubuntu:22.04"),
        system_setup: Some(&[
            "apt-get update && apt-get install -y --no-install-recommends git ca-certificates openjdk-11-jdk maven && rm -rf /var/lib/apt/lists/*",
        ]),
        env: &["DEBIAN_FRONTEND=noninteractive", "LANG=C.UTF-8"],
        test_command: Some(
            "mvn clean test -B -Dmaven.test.skip=false -DfailIfNoTests=false -Dsurefire.useFile=false",
        ),
    },
];

/// All registered repositories.
pub fn registrations() -> &'static [RepoRegistration] {
    REGISTRATIONS
}

/// Case-insensitive lookup by `(org, repo)`.
pub fn lookup(org: &str, repo: &str) -> Option<&'static RepoRegistration> {
    REGISTRATIONS
        .iter()
        .find(|r| r.org.eq_ignore_ascii_case(org) && r.repo.eq_ignore_ascii_case(repo))
}

/// Template with a registration's overrides applied.
#[derive(Debug, Clone)]
pub struct EffectiveTemplate {
    pub template: &'static EcosystemTemplate,
    pub base_image: Option<&'static str>,
    pub system_setup: &'static [&'static str],
    pub env: Vec<&'static str>,
    pub test_command: &'static str,
}

impl EffectiveTemplate {
    pub fn new(ecosystem: Ecosystem, registration: Option<&'static RepoRegistration>) -> Self {
        let template = EcosystemTemplate::for_ecosystem(ecosystem);
        let mut env: Vec<&'static str> = template.env.to_vec();
        if let Some(reg) = registration {
            env.extend_from_slice(reg.env);
        }
        Self {
            template,
            base_image: registration.and_then(|r| r.base_image),
            system_setup: registration
                .and_then(|r| r.system_setup)
                .unwrap_or(template.system_setup),
            env,
            test_command: registration
                .and_then(|r| r.test_command)
                .unwrap_or(template.test_command),
        }
    }
}
