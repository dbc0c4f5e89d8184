//! Resolves an instance into its chain of image specs.
//!
//! Every instance needs three layers:
//!
//! ```text
//! <registry image>                      external, never built here
//!   └─ {ns}/base-{eco}:{tag}            toolchain and system setup
//!        └─ {ns}/{org}_m_{repo}:base    repository checkout
//!             └─ {ns}/{org}_m_{repo}:pr-{n}   patches, scripts, base commit
//! ```
//!
//! The toolchain layer's tag embeds a short content digest, so repositories
//! with identical toolchain needs share it and differing setups never
//! collide.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dataset::Instance;
use crate::ecosystem::Ecosystem;
use crate::error::GraphError;
use crate::execution::ContextDir;
use crate::image::registry::{self, EffectiveTemplate};
use crate::image::spec::{ImageParent, ImageSpec, ImageSpecId};
use crate::image::templates::{self, ScriptContext, HOME_DIR, INJECTED_FILES};

/// Options shared by every resolution in a batch.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Image name prefix, e.g. `swe-harness`.
    pub namespace: String,
    /// Clone from GitHub inside the image instead of copying a checkout.
    pub need_clone: bool,
    /// Root of local checkouts, laid out as `<repo_dir>/<org>/<repo>`.
    pub repo_dir: PathBuf,
    pub global_env: Vec<String>,
    pub clear_env: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            namespace: "swe-harness".to_string(),
            need_clone: true,
            repo_dir: PathBuf::from("repos"),
            global_env: Vec::new(),
            clear_env: true,
        }
    }
}

/// Resolution of one instance.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub ecosystem: Ecosystem,
    /// Specs in build order; the last one is the instance image.
    pub chain: Vec<ImageSpec>,
}

impl ResolvedImage {
    pub fn target(&self) -> &ImageSpecId {
        // A resolved chain always holds the three layers.
        &self.chain[self.chain.len() - 1].id
    }
}

/// Turns instances into image spec chains.
#[derive(Debug, Clone, Default)]
pub struct ImageResolver {
    options: ResolverOptions,
}

fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl ImageResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Registration first, then the instance's declared language.
    pub fn ecosystem_for(&self, instance: &Instance) -> Result<Ecosystem, GraphError> {
        if let Some(reg) = registry::lookup(&instance.org, &instance.repo) {
            return Ok(reg.ecosystem);
        }
        Ecosystem::parse(&instance.language).ok_or_else(|| {
            GraphError::UnknownEcosystem(if instance.language.is_empty() {
                format!("<none> for {}", instance.full_name())
            } else {
                instance.language.clone()
            })
        })
    }

    fn checkout_dir(&self, instance: &Instance) -> PathBuf {
        self.options
            .repo_dir
            .join(&instance.org)
            .join(&instance.repo)
    }

    fn repo_image(&self, instance: &Instance) -> String {
        format!(
            "{}/{}_m_{}",
            self.options.namespace,
            instance.org.to_ascii_lowercase(),
            instance.repo.to_ascii_lowercase()
        )
    }

    pub fn resolve(&self, instance: &Instance) -> Result<ResolvedImage, GraphError> {
        let ecosystem = self.ecosystem_for(instance)?;
        let effective =
            EffectiveTemplate::new(ecosystem, registry::lookup(&instance.org, &instance.repo));

        let checkout = self.checkout_dir(instance);
        let local = (!self.options.need_clone && checkout.is_dir()).then_some(checkout.as_path());

        let base = self.base_spec(ecosystem, &effective, local);
        let env = self.env_spec(instance, &base.id, &checkout);
        let pr = self.pr_spec(instance, &env.id, &effective);

        debug!(
            instance_id = %instance.instance_id,
            ecosystem = %ecosystem,
            base = %base.id,
            target = %pr.id,
            "Resolved image chain"
        );

        Ok(ResolvedImage {
            ecosystem,
            chain: vec![base, env, pr],
        })
    }

    fn base_spec(
        &self,
        ecosystem: Ecosystem,
        effective: &EffectiveTemplate,
        checkout: Option<&Path>,
    ) -> ImageSpec {
        let external = match effective.base_image {
            Some(image) => image.to_string(),
            None => {
                let version = effective.template.toolchain_version(checkout);
                effective.template.base_reference(&version)
            }
        };

        let global = &self.options.global_env;
        let mut dockerfile = format!("FROM {external}\n\n");
        dockerfile.push_str(&templates::env_lines(global));
        dockerfile.push_str(&templates::env_lines(&effective.env));
        for step in effective.system_setup {
            dockerfile.push_str(&format!("RUN {step}\n"));
        }
        dockerfile.push_str(&format!("WORKDIR {HOME_DIR}/\n"));
        dockerfile.push_str(&templates::clear_env_lines(global, self.options.clear_env));

        let mut spec = ImageSpec {
            id: ImageSpecId::new(String::new()),
            parent: ImageParent::External(external.clone()),
            dockerfile,
            files: Default::default(),
            context_dirs: Vec::new(),
            workdir: PathBuf::new(),
        };
        let digest = spec.digest();
        let tag = format!("{}-{}", sanitize_tag(&external), &digest[..8]);
        spec.id = ImageSpecId::new(format!(
            "{}/base-{}:{}",
            self.options.namespace, ecosystem, tag
        ));
        spec.workdir = PathBuf::from("_base").join(ecosystem.as_str()).join(tag);
        spec
    }

    fn env_spec(&self, instance: &Instance, base: &ImageSpecId, checkout: &Path) -> ImageSpec {
        let global = &self.options.global_env;
        let repo = &instance.repo;

        let mut dockerfile = format!("FROM {base}\n\n");
        dockerfile.push_str(&templates::env_lines(global));
        dockerfile.push_str(&format!("WORKDIR {HOME_DIR}/\n"));
        let mut context_dirs = Vec::new();
        if self.options.need_clone {
            dockerfile.push_str(&format!(
                "RUN git clone https://github.com/{org}/{repo}.git {HOME_DIR}/{repo}\n",
                org = instance.org
            ));
        } else {
            dockerfile.push_str(&format!("COPY {repo} {HOME_DIR}/{repo}\n"));
            context_dirs.push(ContextDir {
                host: checkout.to_path_buf(),
                dest: repo.clone(),
            });
        }
        dockerfile.push_str(&templates::clear_env_lines(global, self.options.clear_env));

        ImageSpec {
            id: ImageSpecId::new(format!("{}:base", self.repo_image(instance))),
            parent: ImageParent::Node(base.clone()),
            dockerfile,
            files: Default::default(),
            context_dirs,
            workdir: PathBuf::from(&instance.org)
                .join(&instance.repo)
                .join("images")
                .join("base"),
        }
    }

    fn pr_spec(
        &self,
        instance: &Instance,
        env: &ImageSpecId,
        effective: &EffectiveTemplate,
    ) -> ImageSpec {
        let global = &self.options.global_env;
        let files = templates::render_files(&ScriptContext {
            repo: &instance.repo,
            base_commit: &instance.base_commit,
            install: effective.template.install,
            test_command: effective.test_command,
            fix_patch: &instance.fix_patch,
            test_patch: &instance.test_patch,
        });

        let mut dockerfile = format!("FROM {env}\n\n");
        dockerfile.push_str(&templates::env_lines(global));
        dockerfile.push_str(&format!("COPY {} {HOME_DIR}/\n", INJECTED_FILES.join(" ")));
        dockerfile.push_str(&format!("RUN bash {HOME_DIR}/prepare.sh\n"));
        dockerfile.push_str(&templates::clear_env_lines(global, self.options.clear_env));

        ImageSpec {
            id: ImageSpecId::new(format!("{}:pr-{}", self.repo_image(instance), instance.number)),
            parent: ImageParent::Node(env.clone()),
            dockerfile,
            files,
            context_dirs: Vec::new(),
            workdir: PathBuf::from(&instance.org)
                .join(&instance.repo)
                .join("images")
                .join(format!("pr-{}", instance.number)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::spec::ImageGraph;
    use tempfile::TempDir;

    fn instance(org: &str, repo: &str, number: u64, language: &str) -> Instance {
        Instance {
            org: org.to_string(),
            repo: repo.to_string(),
            number,
            instance_id: Instance::default_id(org, repo, number),
            base_commit: "abc123".to_string(),
            language: language.to_string(),
            fix_patch: "FIX".to_string(),
            test_patch: "TEST".to_string(),
        }
    }

    #[test]
    fn test_chain_shape_and_names() {
        let resolver = ImageResolver::default();
        let resolved = resolver.resolve(&instance("Gin-Gonic", "gin", 42, "")).unwrap();
        assert_eq!(resolved.ecosystem, Ecosystem::Go);

        let tags: Vec<&str> = resolved.chain.iter().map(|s| s.tag()).collect();
        assert!(tags[0].starts_with("swe-harness/base-go:golang-latest-"));
        assert_eq!(tags[1], "swe-harness/gin-gonic_m_gin:base");
        assert_eq!(tags[2], "swe-harness/gin-gonic_m_gin:pr-42");
        assert_eq!(resolved.target().as_str(), "swe-harness/gin-gonic_m_gin:pr-42");
        assert_eq!(
            resolved.chain[0].parent,
            ImageParent::External("golang:latest".to_string())
        );

        let env = &resolved.chain[1];
        assert!(env.dockerfile.contains("git clone https://github.com/Gin-Gonic/gin.git /home/gin"));
        let pr = &resolved.chain[2];
        assert!(pr.dockerfile.starts_with(&format!("FROM {}", env.id)));
        assert!(pr.dockerfile.contains("RUN bash /home/prepare.sh"));
        assert_eq!(pr.files["fix.patch"], b"FIX");
    }

    #[test]
    fn test_registration_overrides_language() {
        let resolver = ImageResolver::default();
        let resolved = resolver.resolve(&instance("apache", "dubbo", 7, "python")).unwrap();
        assert_eq!(resolved.ecosystem, Ecosystem::Java);
        assert_eq!(
            resolved.chain[0].parent,
            ImageParent::External("ubuntu:22.04".to_string())
        );
        assert!(resolved.chain[0].dockerfile.contains("openjdk-11-jdk"));
    }

    #[test]
    fn test_unknown_ecosystem() {
        let resolver = ImageResolver::default();
        assert!(matches!(
            resolver.resolve(&instance("acme", "widget", 1, "cobol")),
            Err(GraphError::UnknownEcosystem(_))
        ));
    }

    #[test]
    fn test_sibling_prs_share_layers_in_graph() {
        let resolver = ImageResolver::default();
        let mut graph = ImageGraph::new();
        for number in [1, 2] {
            let resolved = resolver.resolve(&instance("gin-gonic", "gin", number, "go")).unwrap();
            graph.add_chain(&resolved.chain).unwrap();
        }
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_global_env_and_clear_env() {
        let resolver = ImageResolver::new(ResolverOptions {
            global_env: vec!["HTTPS_PROXY=http://proxy:3128".to_string()],
            ..Default::default()
        });
        let resolved = resolver.resolve(&instance("gin-gonic", "gin", 1, "go")).unwrap();
        for spec in &resolved.chain {
            assert!(spec.dockerfile.contains("ENV HTTPS_PROXY=\"http://proxy:3128\"\n"));
            assert!(spec.dockerfile.trim_end().ends_with("ENV HTTPS_PROXY="));
        }
    }

    #[test]
    fn test_local_checkout_is_copied_and_drives_toolchain() {
        let tmp = TempDir::new().unwrap();
        let checkout = tmp.path().join("gin-gonic").join("gin");
        std::fs::create_dir_all(&checkout).unwrap();
        std::fs::write(checkout.join("go.mod"), "module github.com/gin-gonic/gin\n\ngo 1.21\n").unwrap();

        let resolver = ImageResolver::new(ResolverOptions {
            need_clone: false,
            repo_dir: tmp.path().to_path_buf(),
            ..Default::default()
        });
        let resolved = resolver.resolve(&instance("gin-gonic", "gin", 1, "go")).unwrap();
        assert_eq!(
            resolved.chain[0].parent,
            ImageParent::External("golang:1.21".to_string())
        );
        let env = &resolved.chain[1];
        assert!(env.dockerfile.contains("COPY gin /home/gin"));
        assert_eq!(env.context_dirs[0].host, checkout);
    }
}
