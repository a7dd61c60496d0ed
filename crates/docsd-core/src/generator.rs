//! The site generator contract (§1, out of scope): clones repositories and
//! renders a unified static site. The core only calls `generate` and reads
//! back a handful of [`BuildReport`] fields — it never touches markdown,
//! HTML, or git objects itself.

use std::path::Path;

use async_trait::async_trait;
use docsd_types::{BuildReport, RepositoryDescriptor};

use crate::shutdown::ShutdownSignal;

/// Immutable per-build context handed to the generator: the pipeline
/// builds this once per job and never mutates it afterward.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub output_dir: std::path::PathBuf,
    pub namespace_forges: bool,
    pub live_reload: bool,
}

#[async_trait]
pub trait SiteGenerator: Send + Sync {
    async fn generate(
        &self,
        context: &GenerationContext,
        selected_repositories: &[RepositoryDescriptor],
        workspace_dir: &Path,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<BuildReport>;
}
