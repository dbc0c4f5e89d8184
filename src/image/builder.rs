//! Builds image chains against a [`ContainerEngine`].
//!
//! Guarantees, per batch:
//! - a tag is built at most once, even when many instances need it at the
//!   same time (per-tag lock);
//! - an existing tag is reused only when its digest label matches the
//!   spec's stacked digest, and never when `force_build` is set;
//! - a failed tag is never retried by later instances, and every layer
//!   above a failed one fails without being attempted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{DockerError, StageError};
use crate::execution::{AbortSignal, BuildRequest, ContainerEngine};
use crate::image::spec::{stacked_digests, ImageParent, ImageSpec};

/// Image label carrying the stacked content digest of a built layer.
pub const DIGEST_LABEL: &str = "swe-harness.digest";

/// Retry and caching policy for image builds.
#[derive(Debug, Clone)]
pub struct BuildPolicy {
    pub force_build: bool,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for BuildPolicy {
    fn default() -> Self {
        Self {
            force_build: false,
            max_retries: 2,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Whether a build failure looks like a registry or network hiccup.
pub fn is_transient_failure(message: &str) -> bool {
    const PATTERNS: [&str; 11] = [
        "tls handshake timeout",
        "connection reset by peer",
        "i/o timeout",
        "toomanyrequests",
        "temporary failure in name resolution",
        "unexpected eof",
        "502 bad gateway",
        "503 service unavailable",
        "connection refused",
        "net/http: request canceled",
        "error trying to connect",
    ];
    let lower = message.to_ascii_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

/// How a tag became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    Cached,
}

/// Shared image builder for one batch.
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    policy: BuildPolicy,
    permits: Arc<Semaphore>,
    workdir: PathBuf,
    log_dir: PathBuf,
    abort: AbortSignal,
    tag_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Tags available in this batch, with their stacked digests.
    ready: Mutex<HashMap<String, String>>,
    failed: Mutex<HashMap<String, String>>,
}

impl ImageBuilder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        policy: BuildPolicy,
        max_concurrent_builds: usize,
        workdir: PathBuf,
        log_dir: PathBuf,
        abort: AbortSignal,
    ) -> Self {
        Self {
            engine,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent_builds.max(1))),
            workdir,
            log_dir,
            abort,
            tag_locks: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    fn tag_lock(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.tag_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(tag.to_string()).or_default().clone()
    }

    fn failure(&self, tag: &str) -> Option<String> {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
    }

    fn mark_failed(&self, tag: &str, message: String) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tag.to_string())
            .or_insert(message);
    }

    fn ready_digest(&self, tag: &str) -> Option<String> {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
    }

    fn mark_ready(&self, tag: &str, digest: String) {
        self.ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag.to_string(), digest);
    }

    /// Tags that failed in this batch, with their messages.
    pub fn failed_tags(&self) -> HashMap<String, String> {
        self.failed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Builds a chain in order and returns the last tag.
    ///
    /// On failure every remaining layer is recorded as failed too.
    pub async fn build_chain(&self, chain: &[&ImageSpec]) -> Result<String, StageError> {
        let mut last = String::new();
        let digests = stacked_digests(chain.iter().copied());
        for (idx, (spec, digest)) in chain.iter().zip(&digests).enumerate() {
            if let Err(err) = self.build_layer(spec, digest).await {
                if let StageError::Build { tag, .. } = &err {
                    for descendant in &chain[idx + 1..] {
                        self.mark_failed(descendant.tag(), format!("parent image '{tag}' failed"));
                    }
                }
                return Err(err);
            }
            last = spec.tag().to_string();
        }
        Ok(last)
    }

    /// Makes one tag available, building it if needed.
    ///
    /// The parent, when it is a graph node, is expected to be ready already;
    /// [`ImageBuilder::build_chain`] takes care of that ordering.
    pub async fn build(&self, spec: &ImageSpec) -> Result<BuildStatus, StageError> {
        let parent_digest = match &spec.parent {
            ImageParent::Node(parent) => self.ready_digest(parent.as_str()),
            ImageParent::External(_) => None,
        };
        let digest = spec.digest_on(parent_digest.as_deref());
        self.build_layer(spec, &digest).await
    }

    async fn build_layer(&self, spec: &ImageSpec, digest: &str) -> Result<BuildStatus, StageError> {
        let tag = spec.tag();
        let build_error = |message: String| StageError::Build {
            tag: tag.to_string(),
            message,
        };

        if let Some(message) = self.failure(tag) {
            return Err(build_error(message));
        }

        let lock = self.tag_lock(tag);
        let _guard = lock.lock().await;

        if let Some(message) = self.failure(tag) {
            return Err(build_error(message));
        }
        if self.ready_digest(tag).is_some() {
            return Ok(BuildStatus::Cached);
        }
        if self.abort.is_triggered() {
            return Err(StageError::Aborted);
        }

        if !self.policy.force_build {
            match self.inspect_labels(tag).await? {
                Some(labels) if labels.get(DIGEST_LABEL).map(String::as_str) == Some(digest) => {
                    debug!(tag, "Image already present, reusing");
                    self.mark_ready(tag, digest.to_string());
                    return Ok(BuildStatus::Cached);
                }
                Some(_) => info!(tag, "Image content changed since it was built, rebuilding"),
                None => {}
            }
        }

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| StageError::Aborted)?,
            _ = self.abort.triggered() => return Err(StageError::Aborted),
        };

        if let Err(e) = self.materialize(spec).await {
            warn!(tag, error = %e, "Failed to write image files to workdir");
        }

        let mut attempt = 0u32;
        loop {
            info!(tag, attempt = attempt + 1, "Building image");
            let request = BuildRequest {
                tag,
                dockerfile: &spec.dockerfile,
                files: &spec.files,
                context_dirs: &spec.context_dirs,
                labels: HashMap::from([
                    (DIGEST_LABEL.to_string(), digest.to_string()),
                    ("swe-harness.parent".to_string(), spec.parent.reference().to_string()),
                ]),
            };

            let result = tokio::select! {
                res = self.engine.build_image(request) => res,
                _ = self.abort.triggered() => Err(DockerError::Aborted),
            };

            match result {
                Ok(output) => {
                    self.write_build_log(tag, &output.log).await;
                    self.mark_ready(tag, digest.to_string());
                    info!(tag, "Image built");
                    return Ok(BuildStatus::Built);
                }
                Err(DockerError::Aborted) => return Err(StageError::Aborted),
                Err(e) => {
                    let message = e.to_string();
                    if attempt < self.policy.max_retries && is_transient_failure(&message) {
                        self.backoff(tag, attempt, &message).await?;
                        attempt += 1;
                        continue;
                    }
                    warn!(tag, error = %message, "Image build failed");
                    self.write_build_log(tag, &message).await;
                    self.mark_failed(tag, message.clone());
                    return Err(build_error(message));
                }
            }
        }
    }

    /// Labels of an existing tag. Transient daemon errors are retried like
    /// transient build failures; anything else fails the tag.
    async fn inspect_labels(
        &self,
        tag: &str,
    ) -> Result<Option<HashMap<String, String>>, StageError> {
        let mut attempt = 0u32;
        loop {
            match self.engine.image_labels(tag).await {
                Ok(labels) => return Ok(labels),
                Err(e) => {
                    let message = e.to_string();
                    if attempt < self.policy.max_retries && is_transient_failure(&message) {
                        self.backoff(tag, attempt, &message).await?;
                        attempt += 1;
                        continue;
                    }
                    warn!(tag, error = %message, "Image inspection failed");
                    self.mark_failed(tag, message.clone());
                    return Err(StageError::Build {
                        tag: tag.to_string(),
                        message,
                    });
                }
            }
        }
    }

    /// Waits before retry `attempt + 1`, giving up early on abort.
    async fn backoff(&self, tag: &str, attempt: u32, message: &str) -> Result<(), StageError> {
        let delay = self.policy.retry_backoff * 2u32.saturating_pow(attempt);
        warn!(tag, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %message, "Transient failure, retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.abort.triggered() => Err(StageError::Aborted),
        }
    }

    /// Writes the Dockerfile and injected files under the workdir.
    async fn materialize(&self, spec: &ImageSpec) -> std::io::Result<()> {
        let dir = self.workdir.join(&spec.workdir);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("Dockerfile"), &spec.dockerfile).await?;
        for (name, data) in &spec.files {
            tokio::fs::write(dir.join(name), data).await?;
        }
        Ok(())
    }

    async fn write_build_log(&self, tag: &str, log: &str) {
        let dir = self.log_dir.join("images");
        let path = dir.join(format!("{}.log", tag.replace(['/', ':'], "_")));
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, log).await
        }
        .await;
        if let Err(e) = written {
            debug!(tag, error = %e, "Failed to write build log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::execution::{BuildOutput, ContainerRun, RunRequest};
    use crate::image::spec::ImageSpecId;

    /// Engine whose inspect and build calls fail with queued messages first.
    #[derive(Default)]
    struct FlakyEngine {
        images: Mutex<HashMap<String, HashMap<String, String>>>,
        inspect_errors: Mutex<VecDeque<String>>,
        build_errors: Mutex<VecDeque<String>>,
        inspects: AtomicUsize,
        builds: AtomicUsize,
    }

    impl FlakyEngine {
        fn failing_builds(messages: &[&str]) -> Self {
            let engine = Self::default();
            engine
                .build_errors
                .lock()
                .unwrap()
                .extend(messages.iter().map(|m| m.to_string()));
            engine
        }
    }

    #[async_trait]
    impl ContainerEngine for FlakyEngine {
        async fn image_labels(
            &self,
            tag: &str,
        ) -> Result<Option<HashMap<String, String>>, DockerError> {
            self.inspects.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.inspect_errors.lock().unwrap().pop_front() {
                return Err(DockerError::DaemonUnavailable(message));
            }
            Ok(self.images.lock().unwrap().get(tag).cloned())
        }

        async fn build_image(&self, request: BuildRequest<'_>) -> Result<BuildOutput, DockerError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.build_errors.lock().unwrap().pop_front() {
                return Err(DockerError::BuildFailed(message));
            }
            self.images
                .lock()
                .unwrap()
                .insert(request.tag.to_string(), request.labels.clone());
            Ok(BuildOutput::default())
        }

        async fn run(
            &self,
            _request: RunRequest,
            _abort: &AbortSignal,
        ) -> Result<ContainerRun, DockerError> {
            Err(DockerError::RunFailed("no containers in build tests".to_string()))
        }
    }

    fn spec(test_patch: &str) -> ImageSpec {
        ImageSpec {
            id: ImageSpecId::new("h/octo_m_widget:pr-1"),
            parent: ImageParent::External("golang:1.22".to_string()),
            dockerfile: "FROM golang:1.22\nCOPY test.patch /home/\n".to_string(),
            files: BTreeMap::from([("test.patch".to_string(), test_patch.as_bytes().to_vec())]),
            context_dirs: Vec::new(),
            workdir: PathBuf::from("h_octo_m_widget_pr-1"),
        }
    }

    fn builder(engine: Arc<FlakyEngine>, tmp: &TempDir, abort: AbortSignal) -> ImageBuilder {
        let policy = BuildPolicy {
            retry_backoff: Duration::from_millis(1),
            ..BuildPolicy::default()
        };
        ImageBuilder::new(
            engine,
            policy,
            1,
            tmp.path().join("work"),
            tmp.path().join("logs"),
            abort,
        )
    }

    #[tokio::test]
    async fn test_unchanged_image_is_reused_and_changed_one_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::default());

        let first = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(first.build(&spec("v1")).await.unwrap(), BuildStatus::Built);

        // A later batch with identical content hits the cache.
        let second = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(second.build(&spec("v1")).await.unwrap(), BuildStatus::Cached);
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);

        // Same tag, different injected patch.
        let third = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(third.build(&spec("v2")).await.unwrap(), BuildStatus::Built);
        assert_eq!(engine.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_image_without_digest_label_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::default());
        engine
            .images
            .lock()
            .unwrap()
            .insert(spec("v1").tag().to_string(), HashMap::new());

        let builder = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(builder.build(&spec("v1")).await.unwrap(), BuildStatus::Built);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::failing_builds(&[
            "Get https://registry-1.docker.io/v2/: net/http: TLS handshake timeout",
        ]));

        let builder = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(builder.build(&spec("v1")).await.unwrap(), BuildStatus::Built);
        assert_eq!(engine.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_failure_builds_once() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::failing_builds(&[
            "The command '/bin/sh -c go mod download' returned a non-zero code: 1",
        ]));

        let builder = builder(engine.clone(), &tmp, AbortSignal::new());
        assert!(matches!(
            builder.build(&spec("v1")).await,
            Err(StageError::Build { .. })
        ));
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        // The failure sticks for the rest of the batch.
        assert!(builder.build(&spec("v1")).await.is_err());
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        assert!(builder.failed_tags().contains_key(spec("v1").tag()));
    }

    #[tokio::test]
    async fn test_transient_inspect_error_is_retried() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::default());
        engine
            .inspect_errors
            .lock()
            .unwrap()
            .push_back("error trying to connect: Connection refused (os error 111)".to_string());

        let builder = builder(engine.clone(), &tmp, AbortSignal::new());
        assert_eq!(builder.build(&spec("v1")).await.unwrap(), BuildStatus::Built);
        assert_eq!(engine.inspects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_interrupts_retry_backoff() {
        let tmp = TempDir::new().unwrap();
        let engine = Arc::new(FlakyEngine::failing_builds(&["toomanyrequests: rate limited"]));
        let abort = AbortSignal::new();
        let policy = BuildPolicy {
            retry_backoff: Duration::from_secs(3600),
            ..BuildPolicy::default()
        };
        let builder = ImageBuilder::new(
            engine.clone(),
            policy,
            1,
            tmp.path().join("work"),
            tmp.path().join("logs"),
            abort.clone(),
        );

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.trigger();
        });
        let result = tokio::time::timeout(Duration::from_secs(10), builder.build(&spec("v1")))
            .await
            .expect("backoff was not interrupted");
        trigger.await.unwrap();

        assert_eq!(result, Err(StageError::Aborted));
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_failure_detection() {
        assert!(is_transient_failure("Get https://registry-1.docker.io/v2/: net/http: TLS handshake timeout"));
        assert!(is_transient_failure("toomanyrequests: You have reached your pull rate limit"));
        assert!(!is_transient_failure("The command '/bin/sh -c go mod download' returned a non-zero code: 1"));
    }

    #[test]
    fn test_default_policy() {
        let policy = BuildPolicy::default();
        assert!(!policy.force_build);
        assert_eq!(policy.max_retries, 2);
    }
}
