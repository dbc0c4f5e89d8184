//! Image graph: declarative specs, per-ecosystem templates, repository
//! registrations and the concurrent builder.

pub mod builder;
pub mod registry;
pub mod resolver;
pub mod spec;
pub mod templates;

pub use builder::{is_transient_failure, BuildPolicy, BuildStatus, ImageBuilder, DIGEST_LABEL};
pub use resolver::{ImageResolver, ResolvedImage, ResolverOptions};
pub use spec::{stacked_digests, ImageGraph, ImageParent, ImageSpec, ImageSpecId};
pub use templates::{EcosystemTemplate, HOME_DIR, PATCH_APPLY_EXIT_CODE, PATCH_APPLY_MARKER};
