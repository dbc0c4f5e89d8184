//! Image specifications and the dependency graph between them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::GraphError;
use crate::execution::ContextDir;

/// Full image reference (`name:tag`) identifying a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageSpecId(String);

impl ImageSpecId {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageSpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an image is built `FROM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageParent {
    /// A registry image the harness never builds itself.
    External(String),
    /// Another spec in the graph.
    Node(ImageSpecId),
}

impl ImageParent {
    pub fn reference(&self) -> &str {
        match self {
            Self::External(image) => image,
            Self::Node(id) => id.as_str(),
        }
    }
}

/// Declarative description of one image layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub id: ImageSpecId,
    pub parent: ImageParent,
    pub dockerfile: String,
    /// Files injected into the build context, keyed by relative path.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Host directories copied into the build context.
    pub context_dirs: Vec<ContextDir>,
    /// Where the rendered Dockerfile and files are written, relative to the
    /// configured workdir.
    pub workdir: PathBuf,
}

impl ImageSpec {
    pub fn tag(&self) -> &str {
        self.id.as_str()
    }

    /// Content digest over everything that affects the built image.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.parent.reference().as_bytes());
        hasher.update([0]);
        hasher.update(self.dockerfile.as_bytes());
        for (path, data) in &self.files {
            hasher.update([0]);
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(data);
        }
        for dir in &self.context_dirs {
            hasher.update([0]);
            hasher.update(dir.host.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(dir.dest.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Digest of this layer on top of a parent layer's stacked digest.
    ///
    /// A child's tag and Dockerfile stay the same when its parent is rebuilt
    /// with new content, so the parent digest is folded in.
    pub fn digest_on(&self, parent_digest: Option<&str>) -> String {
        let own = self.digest();
        let Some(parent) = parent_digest else {
            return own;
        };
        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        hasher.update([0]);
        hasher.update(own.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Stacked digests of a chain given in build order.
pub fn stacked_digests<'a>(chain: impl IntoIterator<Item = &'a ImageSpec>) -> Vec<String> {
    let mut digests: Vec<String> = Vec::new();
    for spec in chain {
        let digest = spec.digest_on(digests.last().map(String::as_str));
        digests.push(digest);
    }
    digests
}

/// Directed acyclic graph of image specs, deduplicated by tag.
///
/// Adding a spec whose tag already exists is a no-op when the content digest
/// matches and a [`GraphError::ConflictingSpec`] otherwise.
#[derive(Debug, Default, Clone)]
pub struct ImageGraph {
    nodes: BTreeMap<ImageSpecId, (ImageSpec, String)>,
}

impl ImageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &ImageSpecId) -> Option<&ImageSpec> {
        self.nodes.get(id).map(|(spec, _)| spec)
    }

    /// Adds a spec. Returns `true` when it was new.
    pub fn add(&mut self, spec: ImageSpec) -> Result<bool, GraphError> {
        if let ImageParent::Node(parent) = &spec.parent {
            if parent == &spec.id {
                return Err(GraphError::Cycle(spec.id.to_string()));
            }
        }
        let digest = spec.digest();
        match self.nodes.get(&spec.id) {
            Some((_, existing)) if *existing == digest => Ok(false),
            Some(_) => Err(GraphError::ConflictingSpec(spec.id.to_string())),
            None => {
                self.nodes.insert(spec.id.clone(), (spec, digest));
                Ok(true)
            }
        }
    }

    /// Adds every spec of a resolved chain, stopping at the first conflict.
    pub fn add_chain(&mut self, chain: &[ImageSpec]) -> Result<(), GraphError> {
        for spec in chain {
            self.add(spec.clone())?;
        }
        Ok(())
    }

    /// Specs from the external-rooted leaf down to `target`, in build order.
    pub fn chain_to(&self, target: &ImageSpecId) -> Result<Vec<&ImageSpec>, GraphError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self
            .get(target)
            .ok_or_else(|| GraphError::UnknownImage(target.to_string()))?;

        loop {
            if !seen.insert(&current.id) {
                return Err(GraphError::Cycle(current.id.to_string()));
            }
            chain.push(current);
            match &current.parent {
                ImageParent::External(_) => break,
                ImageParent::Node(parent) => {
                    current = self.get(parent).ok_or_else(|| GraphError::MissingParent {
                        child: current.id.to_string(),
                        parent: parent.to_string(),
                    })?;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Every spec ordered so that parents precede children.
    ///
    /// Ties are broken by tag, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<&ImageSpec>, GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&ImageSpecId, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());

        for start in self.nodes.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // Walk up to the first visited ancestor, then emit top-down.
            let mut path: Vec<&ImageSpecId> = Vec::new();
            let mut cursor = Some(start);
            while let Some(id) = cursor {
                match marks.get(id) {
                    Some(Mark::Done) => break,
                    Some(Mark::Visiting) => return Err(GraphError::Cycle(id.to_string())),
                    None => {}
                }
                let (spec, _) = self.nodes.get(id).ok_or_else(|| GraphError::MissingParent {
                    child: path.last().map(|c| c.to_string()).unwrap_or_default(),
                    parent: id.to_string(),
                })?;
                marks.insert(id, Mark::Visiting);
                path.push(id);
                cursor = match &spec.parent {
                    ImageParent::Node(parent) => Some(parent),
                    ImageParent::External(_) => None,
                };
            }
            for id in path.into_iter().rev() {
                marks.insert(id, Mark::Done);
                if let Some((spec, _)) = self.nodes.get(id) {
                    order.push(spec);
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, parent: ImageParent, dockerfile: &str) -> ImageSpec {
        ImageSpec {
            id: ImageSpecId::new(id),
            parent,
            dockerfile: dockerfile.to_string(),
            files: BTreeMap::new(),
            context_dirs: Vec::new(),
            workdir: PathBuf::from(id.replace([':', '/'], "_")),
        }
    }

    fn node(id: &str) -> ImageParent {
        ImageParent::Node(ImageSpecId::new(id))
    }

    #[test]
    fn test_identical_specs_are_deduplicated() {
        let mut graph = ImageGraph::new();
        let base = spec("h/base:1", ImageParent::External("golang:1.22".into()), "FROM golang:1.22");
        assert!(graph.add(base.clone()).unwrap());
        assert!(!graph.add(base).unwrap());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_conflicting_content_is_rejected() {
        let mut graph = ImageGraph::new();
        graph
            .add(spec("h/base:1", ImageParent::External("golang:1.22".into()), "FROM golang:1.22"))
            .unwrap();
        let err = graph
            .add(spec("h/base:1", ImageParent::External("golang:1.21".into()), "FROM golang:1.21"))
            .unwrap_err();
        assert_eq!(err, GraphError::ConflictingSpec("h/base:1".into()));
    }

    #[test]
    fn test_injected_files_change_digest() {
        let a = spec("h/x:pr-1", node("h/x:base"), "FROM h/x:base");
        let mut b = a.clone();
        b.files.insert("fix.patch".into(), b"diff".to_vec());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_parent_content_changes_child_digest() {
        let base = spec("h/base:go", ImageParent::External("golang:1.22".into()), "base");
        let env = spec("h/x:base", node("h/base:go"), "env");
        let mut newer_base = base.clone();
        newer_base.dockerfile.push_str("\nRUN apt-get update");

        let old = stacked_digests([&base, &env]);
        let new = stacked_digests([&newer_base, &env]);
        assert_eq!(old[0], base.digest());
        assert_ne!(old[1], new[1]);
        assert_eq!(old, stacked_digests([&base, &env]));
    }

    #[test]
    fn test_chain_and_topological_order() {
        let mut graph = ImageGraph::new();
        // Inserted out of order on purpose.
        graph.add(spec("h/x:pr-2", node("h/x:base"), "pr2")).unwrap();
        graph.add(spec("h/x:pr-1", node("h/x:base"), "pr1")).unwrap();
        graph.add(spec("h/x:base", node("h/base:go"), "env")).unwrap();
        graph
            .add(spec("h/base:go", ImageParent::External("golang:latest".into()), "base"))
            .unwrap();

        let chain: Vec<&str> = graph
            .chain_to(&ImageSpecId::new("h/x:pr-1"))
            .unwrap()
            .iter()
            .map(|s| s.tag())
            .collect();
        assert_eq!(chain, vec!["h/base:go", "h/x:base", "h/x:pr-1"]);

        let order: Vec<&str> = graph.topological_order().unwrap().iter().map(|s| s.tag()).collect();
        assert_eq!(order, vec!["h/base:go", "h/x:base", "h/x:pr-1", "h/x:pr-2"]);
    }

    #[test]
    fn test_missing_parent_is_reported() {
        let mut graph = ImageGraph::new();
        graph.add(spec("h/x:pr-1", node("h/x:base"), "pr1")).unwrap();
        assert!(matches!(
            graph.chain_to(&ImageSpecId::new("h/x:pr-1")),
            Err(GraphError::MissingParent { .. })
        ));
        assert!(matches!(
            graph.topological_order(),
            Err(GraphError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_cycles_are_detected() {
        let mut graph = ImageGraph::new();
        assert!(matches!(
            graph.add(spec("h/a:1", node("h/a:1"), "self")),
            Err(GraphError::Cycle(_))
        ));

        graph.add(spec("h/a:1", node("h/b:1"), "a")).unwrap();
        graph.add(spec("h/b:1", node("h/a:1"), "b")).unwrap();
        assert!(matches!(
            graph.chain_to(&ImageSpecId::new("h/a:1")),
            Err(GraphError::Cycle(_))
        ));
        assert!(matches!(graph.topological_order(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_unknown_target() {
        let graph = ImageGraph::new();
        assert_eq!(
            graph.chain_to(&ImageSpecId::new("h/none:1")).unwrap_err(),
            GraphError::UnknownImage("h/none:1".into())
        );
    }
}
