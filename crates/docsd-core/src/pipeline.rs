//! Staged build execution (§4.8): early skip, delta analysis, workspace
//! preparation, generation, and post-persistence. `Pipeline` is the
//! production [`Builder`] the build queue drives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use docsd_types::{hash_bytes, hash_doc_paths, BuildOutcome, BuildReport, RepositoryDescriptor};

use crate::config::{CloneStrategy, DocsdConfig};
use crate::delta::{self, DeltaDecision};
use crate::generator::{GenerationContext, SiteGenerator};
use crate::livereload::LiveReloadHub;
use crate::persist;
use crate::queue::{BuildJob, Builder};
use crate::shutdown::ShutdownSignal;
use crate::skip;
use crate::state_store::{
    ConfigurationStateStore, RepositoryBuildCounter, RepositoryCommitTracker, RepositoryMetadataWriter,
};

const EXCLUDED_DOC_FILES: [&str; 4] = ["readme.md", "license.md", "contributing.md", "changelog.md"];

/// Path the last completed build's report is written to, so the skip
/// evaluator's `ReportChecksum` rule has an independently-recomputable
/// artifact to check `last_report_checksum` against rather than re-hashing
/// the in-memory report that produced it.
fn report_artifact_path(output_dir: &Path) -> PathBuf {
    output_dir.join("build-report.json")
}

/// In-process counters a future metrics exporter reads; not itself a
/// transport (out of scope for this core).
#[derive(Default)]
pub struct PipelineMetrics {
    pub doc_deletions_detected: AtomicU64,
    pub builds_completed: AtomicU64,
    pub builds_failed: AtomicU64,
}

pub struct Pipeline {
    config: DocsdConfig,
    generator: Arc<dyn SiteGenerator>,
    commit_tracker: Arc<dyn RepositoryCommitTracker>,
    build_counter: Arc<dyn RepositoryBuildCounter>,
    metadata: Arc<dyn RepositoryMetadataWriter>,
    config_state: Arc<dyn ConfigurationStateStore>,
    livereload: Arc<dyn LiveReloadHub>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DocsdConfig,
        generator: Arc<dyn SiteGenerator>,
        commit_tracker: Arc<dyn RepositoryCommitTracker>,
        build_counter: Arc<dyn RepositoryBuildCounter>,
        metadata: Arc<dyn RepositoryMetadataWriter>,
        config_state: Arc<dyn ConfigurationStateStore>,
        livereload: Arc<dyn LiveReloadHub>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            config,
            generator,
            commit_tracker,
            build_counter,
            metadata,
            config_state,
            livereload,
            metrics,
        }
    }

    fn resolve_workspace_dir(&self, output_dir: &Path, workspace_override: Option<&Path>) -> PathBuf {
        if let Some(dir) = workspace_override.or(self.config.build.workspace_dir.as_deref()) {
            return dir.to_path_buf();
        }
        match self.config.build.clone_strategy {
            CloneStrategy::Fresh => output_dir.join("_workspace"),
            CloneStrategy::Cached => match &self.config.daemon.storage.repo_cache_dir {
                Some(cache_dir) => cache_dir.join("working"),
                None => {
                    let mut os_string = output_dir.as_os_str().to_os_string();
                    os_string.push("-workspace");
                    PathBuf::from(os_string)
                }
            },
        }
    }

    async fn run_stages(&self, job: BuildJob, shutdown: ShutdownSignal) -> anyhow::Result<BuildReport> {
        let mut report = BuildReport::default();
        let output_dir = self.config.output.directory.clone();
        let context = GenerationContext {
            output_dir: output_dir.clone(),
            namespace_forges: self.config.build.namespace_forges,
            live_reload: self.config.build.live_reload,
        };

        // 2. Early skip.
        if self.config.build.skip_if_unchanged {
            let t0 = Instant::now();
            let metadata = Arc::clone(&self.metadata);
            let recompute_union = move || recompute_global_hash(metadata.as_ref());
            let report_path = report_artifact_path(&output_dir);
            let decision = skip::evaluate(
                &self.config,
                &job.selected_repositories,
                &self.config_state,
                &report_path,
                recompute_union,
            );
            report.record_stage("early_skip", t0.elapsed().as_millis() as u64);
            if decision.is_ok() {
                tracing::info!(job_id = %job.id, "build skipped: output already current");
                let mut report = BuildReport::skipped("public/ already current with persisted state");
                report.record_stage("early_skip", t0.elapsed().as_millis() as u64);
                if let Some(hash) = self.config_state.last_global_doc_files_hash() {
                    self.livereload.broadcast(&hash).await;
                }
                return Ok(report);
            }
            if let Err(reason) = decision {
                tracing::debug!(job_id = %job.id, reason = %reason, "early skip not taken");
            }
        }

        // 3. Delta analysis.
        let workspace_probe = self.resolve_workspace_dir(&output_dir, None);
        let workspace_exists = workspace_probe.is_dir();
        let t0 = Instant::now();
        let plan = delta::analyze(
            &job.selected_repositories,
            self.metadata.as_ref(),
            |url| self.commit_tracker.last_commit(url),
            workspace_exists.then_some(workspace_probe.as_path()),
        );
        report.record_stage("delta_analysis", t0.elapsed().as_millis() as u64);

        let (decision, mut selected) = match plan.decision {
            DeltaDecision::Full => (DeltaDecision::Full, job.selected_repositories.clone()),
            DeltaDecision::Partial => {
                let filtered: Vec<RepositoryDescriptor> = job
                    .selected_repositories
                    .iter()
                    .filter(|r| plan.changed_repos.contains(&r.clone_url))
                    .cloned()
                    .collect();
                if filtered.is_empty() {
                    tracing::warn!(job_id = %job.id, "partial delta plan selected zero repositories, treating as full");
                    (DeltaDecision::Full, job.selected_repositories.clone())
                } else {
                    (DeltaDecision::Partial, filtered)
                }
            }
        };
        if selected.is_empty() {
            selected = job.selected_repositories.clone();
        }

        // 4. Filesystem preparation.
        let t0 = Instant::now();
        if self.config.output.clean {
            let _ = std::fs::remove_dir_all(&output_dir);
            std::fs::create_dir_all(&output_dir)?;
        }
        let workspace_dir = self.resolve_workspace_dir(&output_dir, None);
        if self.config.output.clean
            && matches!(self.config.build.clone_strategy, CloneStrategy::Fresh)
            && workspace_dir.starts_with(&output_dir)
        {
            let _ = std::fs::remove_dir_all(&workspace_dir);
        }
        std::fs::create_dir_all(&workspace_dir)?;
        report.record_stage("filesystem_prep", t0.elapsed().as_millis() as u64);

        // 5. Generation.
        let t0 = Instant::now();
        let mut report = match self
            .generator
            .generate(&context, &selected, &workspace_dir, shutdown)
            .await
        {
            Ok(mut generated) => {
                if self.config.build.live_reload {
                    if let Err(e) = inject_livereload_script(&output_dir) {
                        generated.push_warning(format!("livereload injection failed: {e}"));
                    }
                }
                generated
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "site generation failed");
                report.outcome = Some(BuildOutcome::Failed);
                report.push_error(e.to_string());
                report
            }
        };
        report.record_stage("generation", t0.elapsed().as_millis() as u64);

        // 6. Post-persist.
        let t0 = Instant::now();
        report.delta_decision = Some(match decision {
            DeltaDecision::Full => docsd_types::DeltaDecision::Full,
            DeltaDecision::Partial => docsd_types::DeltaDecision::Partial,
        });
        report.delta_changed_repos = plan.changed_repos.clone();
        report.delta_repo_reasons = plan.repo_reasons.clone();

        let generation_succeeded = !matches!(report.outcome, Some(BuildOutcome::Failed));
        if generation_succeeded {
            for repo in &selected {
                let fresh = rescan_repo_doc_paths(repo, &workspace_dir);
                self.metadata.set_doc_file_paths(&repo.clone_url, fresh.clone());
                self.metadata.set_doc_files_hash(&repo.clone_url, hash_doc_paths(&fresh));
            }
        }

        let mut deletions_detected = 0u64;
        if matches!(decision, DeltaDecision::Partial)
            && !report.doc_files_hash.is_empty()
            && self.config.build.detect_deletions
        {
            let unchanged: Vec<&RepositoryDescriptor> = job
                .selected_repositories
                .iter()
                .filter(|r| !plan.changed_repos.contains(&r.clone_url))
                .collect();
            for repo in unchanged {
                let persisted = self.metadata.doc_file_paths(&repo.clone_url);
                let fresh = rescan_repo_doc_paths(repo, &workspace_dir);
                if fresh != persisted {
                    let deficit = persisted.len().saturating_sub(fresh.len());
                    deletions_detected += deficit as u64;
                    self.metadata.set_doc_file_paths(&repo.clone_url, fresh.clone());
                    self.metadata.set_doc_files_hash(&repo.clone_url, hash_doc_paths(&fresh));
                }
            }

            let union: Vec<String> = self
                .metadata
                .all_doc_file_paths()
                .into_values()
                .flatten()
                .collect();
            report.doc_files_hash = hash_doc_paths(union);
        }
        report.deletions_detected = deletions_detected;
        self.metrics.doc_deletions_detected.fetch_add(deletions_detected, Ordering::Relaxed);

        if generation_succeeded {
            for repo in &selected {
                self.build_counter.increment_build_count(&repo.clone_url);
                if report.failed_repositories.contains(&repo.clone_url) {
                    self.build_counter.increment_error_count(&repo.clone_url);
                }
                let count = count_doc_files(&content_dir(&output_dir, repo, self.config.build.namespace_forges));
                self.build_counter.set_document_count(&repo.clone_url, count);
                self.build_counter.set_last_build(&repo.clone_url, chrono::Utc::now());

                if let Some(sha) = read_workspace_head(&workspace_dir, &repo.name) {
                    self.commit_tracker.set_last_commit(&repo.clone_url, sha);
                }
            }

            self.config_state
                .set_last_config_hash(self.config.compute_config_hash_for_persistence());
            if let Ok(serialized) = serde_json::to_vec(&report) {
                if let Err(e) = persist::atomic_write(&report_artifact_path(&output_dir), &serialized) {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to persist build report artifact");
                }
                self.config_state
                    .set_last_report_checksum(hash_bytes(&serialized));
            }
            if !report.doc_files_hash.is_empty() {
                self.config_state
                    .set_last_global_doc_files_hash(report.doc_files_hash.clone());
            }
        } else {
            for repo in &selected {
                self.build_counter.increment_error_count(&repo.clone_url);
            }
        }

        if !report.doc_files_hash.is_empty() {
            self.livereload.broadcast(&report.doc_files_hash).await;
        }
        report.record_stage("post_persist", t0.elapsed().as_millis() as u64);

        if report.outcome.is_none() {
            report.outcome = Some(BuildOutcome::Completed);
        }
        match report.outcome {
            Some(BuildOutcome::Failed) => {
                self.metrics.builds_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.metrics.builds_completed.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Builder for Pipeline {
    async fn build(&self, job: BuildJob, shutdown: ShutdownSignal) -> anyhow::Result<BuildReport> {
        self.run_stages(job, shutdown).await
    }
}

fn recompute_global_hash(metadata: &dyn RepositoryMetadataWriter) -> String {
    let union: Vec<String> = metadata.all_doc_file_paths().into_values().flatten().collect();
    hash_doc_paths(union)
}

/// Rescans `docs/` and `documentation/` under the repo's working copy,
/// producing repo-name–prefixed, slash-normalized paths — the global-union
/// representation, distinct from the unprefixed paths `delta::compute_quick_hash`
/// uses for change detection.
fn rescan_repo_doc_paths(repo: &RepositoryDescriptor, workspace_dir: &Path) -> Vec<String> {
    let repo_root = workspace_dir.join(&repo.name);
    let mut out = Vec::new();
    for root_name in ["docs", "documentation"] {
        let root = repo_root.join(root_name);
        walk_markdown(&repo_root, &root, &repo.name, &mut out);
    }
    out.sort_unstable();
    out.dedup();
    out
}

fn walk_markdown(repo_root: &Path, dir: &Path, repo_name: &str, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_markdown(repo_root, &path, repo_name, out);
            continue;
        }
        let is_markdown = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
            .unwrap_or(false);
        if !is_markdown {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(repo_root) {
            let normalized = relative.to_string_lossy().replace('\\', "/");
            out.push(format!("{repo_name}/{normalized}"));
        }
    }
}

fn content_dir(output_dir: &Path, repo: &RepositoryDescriptor, namespace_forges: bool) -> PathBuf {
    let content_root = output_dir.join("content");
    if namespace_forges {
        // Namespacing prefixes the generated tree with an owner/forge
        // segment; without a forge client in scope, fall back to the
        // repo's own name as its own namespace rather than guessing one.
        content_root.join(&repo.name).join(&repo.name)
    } else {
        content_root.join(&repo.name)
    }
}

fn count_doc_files(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_doc_files(&path);
            continue;
        }
        let is_markdown = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
            .unwrap_or(false);
        if !is_markdown {
            continue;
        }
        let excluded = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| EXCLUDED_DOC_FILES.contains(&n.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !excluded {
            count += 1;
        }
    }
    count
}

/// Reads the working copy's current commit sha by following `.git/HEAD`
/// (and, for a symbolic ref, the ref file or `packed-refs`) rather than
/// depending on a git object-model library — this core only ever needs the
/// tip commit, never history or objects.
fn read_workspace_head(workspace_dir: &Path, repo_name: &str) -> Option<String> {
    let git_dir = workspace_dir.join(repo_name).join(".git");
    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    if let Some(ref_path) = head.strip_prefix("ref: ") {
        if let Ok(sha) = std::fs::read_to_string(git_dir.join(ref_path)) {
            return Some(sha.trim().to_string());
        }
        read_packed_ref(&git_dir, ref_path)
    } else {
        Some(head.to_string())
    }
}

fn read_packed_ref(git_dir: &Path, ref_path: &str) -> Option<String> {
    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed.lines().find_map(|line| {
        if line.starts_with('#') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let sha = parts.next()?;
        let name = parts.next()?;
        (name == ref_path).then(|| sha.to_string())
    })
}

const LIVERELOAD_SENTINEL: &str = "docsd-livereload";

/// Injects a livereload `<script>` tag before `</body>` in every rendered
/// HTML file, case-insensitively matching the last occurrence and skipping
/// files that already carry the sentinel (idempotent across repeated runs).
fn inject_livereload_script(output_dir: &Path) -> anyhow::Result<()> {
    let public_dir = output_dir.join("public");
    if !public_dir.is_dir() {
        return Ok(());
    }
    walk_html(&public_dir)
}

fn walk_html(dir: &Path) -> anyhow::Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_html(&path)?;
            continue;
        }
        let is_html = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
            .unwrap_or(false);
        if !is_html {
            continue;
        }
        let contents = std::fs::read_to_string(&path)?;
        if contents.contains(LIVERELOAD_SENTINEL) {
            continue;
        }
        if let Some(idx) = contents.to_ascii_lowercase().rfind("</body>") {
            let script = format!(
                "<script id=\"{LIVERELOAD_SENTINEL}\">/* livereload */</script>\n</body>"
            );
            let mut updated = contents.clone();
            updated.replace_range(idx..idx + "</body>".len(), &script);
            std::fs::write(&path, updated)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, OutputConfig};
    use crate::livereload::BroadcastLiveReloadHub;
    use crate::state_store::DocsdStateStore;

    struct StaticGenerator {
        report: BuildReport,
    }

    #[async_trait]
    impl SiteGenerator for StaticGenerator {
        async fn generate(
            &self,
            _context: &GenerationContext,
            _repos: &[RepositoryDescriptor],
            _workspace_dir: &Path,
            _shutdown: ShutdownSignal,
        ) -> anyhow::Result<BuildReport> {
            Ok(self.report.clone())
        }
    }

    fn repo() -> RepositoryDescriptor {
        RepositoryDescriptor::new("repo", "https://example.com/org/repo.git", "main")
    }

    fn pipeline_with(config: DocsdConfig, report: BuildReport, dir: &Path) -> (Pipeline, Arc<DocsdStateStore>) {
        let state = DocsdStateStore::load_or_default(dir.join("state.json"));
        let pipeline = Pipeline::new(
            config,
            Arc::new(StaticGenerator { report }),
            state.clone(),
            state.clone(),
            state.clone(),
            state.clone(),
            Arc::new(BroadcastLiveReloadHub::default()),
            Arc::new(PipelineMetrics::default()),
        );
        (pipeline, state)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_build_persists_commit_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("workspace/repo/docs")).unwrap();
        std::fs::write(dir.path().join("workspace/repo/docs/a.md"), b"content").unwrap();
        std::fs::create_dir_all(dir.path().join("workspace/repo/.git")).unwrap();
        std::fs::write(dir.path().join("workspace/repo/.git/HEAD"), b"deadbeef\n").unwrap();

        let config = DocsdConfig {
            repositories: vec![repo()],
            build: BuildConfig {
                workspace_dir: Some(dir.path().join("workspace")),
                skip_if_unchanged: false,
                ..BuildConfig::default()
            },
            output: OutputConfig {
                directory: dir.path().join("site"),
                clean: false,
            },
            ..Default::default()
        };

        let mut generated = BuildReport::default();
        generated.outcome = Some(BuildOutcome::Completed);
        generated.doc_files_hash = "placeholder".to_string();

        let (pipeline, state) = pipeline_with(config, generated, dir.path());
        let job = BuildJob::new(docsd_types::JobType::Manual, docsd_types::JobPriority::High, vec![repo()]);

        let (_handle, shutdown) = crate::shutdown::ShutdownHandle::new();
        let report = pipeline.build(job, shutdown).await.unwrap();

        assert_eq!(report.outcome, Some(BuildOutcome::Completed));
        assert_eq!(state.last_commit("https://example.com/org/repo.git"), Some("deadbeef".to_string()));
        assert!(state.last_config_hash().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generation_failure_still_runs_post_persist_without_commit() {
        struct FailingGenerator;
        #[async_trait]
        impl SiteGenerator for FailingGenerator {
            async fn generate(
                &self,
                _context: &GenerationContext,
                _repos: &[RepositoryDescriptor],
                _workspace_dir: &Path,
                _shutdown: ShutdownSignal,
            ) -> anyhow::Result<BuildReport> {
                anyhow::bail!("clone failed")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = DocsdConfig {
            repositories: vec![repo()],
            build: BuildConfig {
                skip_if_unchanged: false,
                ..BuildConfig::default()
            },
            output: OutputConfig {
                directory: dir.path().join("site"),
                clean: false,
            },
            ..Default::default()
        };

        let state = DocsdStateStore::load_or_default(dir.path().join("state.json"));
        let pipeline = Pipeline::new(
            config,
            Arc::new(FailingGenerator),
            state.clone(),
            state.clone(),
            state.clone(),
            state.clone(),
            Arc::new(BroadcastLiveReloadHub::default()),
            Arc::new(PipelineMetrics::default()),
        );
        let job = BuildJob::new(docsd_types::JobType::Manual, docsd_types::JobPriority::High, vec![repo()]);
        let (_handle, shutdown) = crate::shutdown::ShutdownHandle::new();
        let report = pipeline.build(job, shutdown).await.unwrap();

        assert_eq!(report.outcome, Some(BuildOutcome::Failed));
        assert!(state.last_commit("https://example.com/org/repo.git").is_none());
    }

    #[test]
    fn repo_cache_path_guard_rejects_traversal_in_rescan() {
        // rescan_repo_doc_paths should never be handed a repo name containing
        // traversal components in practice (RepositoryDescriptor is
        // core-controlled), but it must not panic if a workspace lacks the
        // expected directories.
        let dir = tempfile::tempdir().unwrap();
        let paths = rescan_repo_doc_paths(&repo(), dir.path());
        assert!(paths.is_empty());
    }

    #[test]
    fn build_report_summary_snapshot() {
        let mut report = BuildReport::skipped("public/ already current");
        report.cloned_repositories.push("org/repo".to_string());
        report.deletions_detected = 1;

        insta::assert_snapshot!(
            report.render_summary(),
            @r#"
outcome: skipped
summary: public/ already current
rendered_pages: 0
cloned_repositories: 1
failed_repositories: 0
skipped_repositories: 0
deletions_detected: 1
"#
        );
    }
}
