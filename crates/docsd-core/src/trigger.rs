//! Converts external trigger inputs into bus events or direct queue
//! enqueues (§4.4).
//!
//! Five paths converge on the bus/queue: manual and scheduled builds
//! enqueue a [`BuildJob`] directly with no debouncing; a webhook consumer
//! task turns `WebhookReceived` into `RepoUpdateRequested`; any subsystem
//! can publish `BuildRequested` straight to the debouncer (no dedicated
//! type here — it is just a bus publish); and a removal consumer prunes
//! persisted state when discovery reports a repository gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use docsd_types::{JobPriority, JobType, RepoRemoved, RepoUpdateRequested, RepositoryDescriptor, WebhookReceived};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::queue::{BuildJob, BuildQueue};
use crate::remote_head_cache::RemoteHeadCache;
use crate::repo_updater::RepoResolver;
use crate::shutdown::ShutdownSignal;
use crate::state_store::DocsdStateStore;

/// True if `candidate` (a forge's `owner/name`, or a full clone URL) refers
/// to the same repository as `clone_url`, tolerating a trailing `.git` and
/// either `/` or `:` separating owner from name.
pub fn repo_full_name_matches(candidate: &str, clone_url: &str) -> bool {
    let left = normalize_owner_repo(candidate);
    !left.is_empty() && left == normalize_owner_repo(clone_url)
}

fn normalize_owner_repo(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let no_git = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let unified = no_git.replace(':', "/");
    let segments: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 => String::new(),
        1 => segments[0].to_ascii_lowercase(),
        n => format!("{}/{}", segments[n - 2], segments[n - 1]).to_ascii_lowercase(),
    }
}

/// Result of evaluating one `WebhookReceived` against the configured
/// repositories, factored out of the async consumer so the matching and
/// path-filtering rules (§4.4.3, testable property 6) are unit-testable
/// without a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookTriggerOutcome {
    /// Empty when the webhook matched no configured repository, or matched
    /// but every changed path fell outside every matched repo's `doc_paths`.
    pub job_id: String,
    pub requests: Vec<RepoUpdateRequested>,
}

/// Pure matching/filtering logic for one webhook delivery.
pub fn handle_webhook(
    event: &WebhookReceived,
    repos: &[RepositoryDescriptor],
    planned_job_id: Option<String>,
    now: DateTime<Utc>,
) -> WebhookTriggerOutcome {
    let matched: Vec<&RepositoryDescriptor> = repos
        .iter()
        .filter(|r| r.branch == event.branch && repo_full_name_matches(&event.repo_full_name, &r.clone_url))
        .collect();
    if matched.is_empty() {
        return WebhookTriggerOutcome::default();
    }

    let relevant: Vec<&RepositoryDescriptor> = if event.changed_paths.is_empty() {
        matched
    } else {
        matched
            .into_iter()
            .filter(|r| event.changed_paths.iter().any(|p| r.matches_doc_path(p)))
            .collect()
    };
    if relevant.is_empty() {
        return WebhookTriggerOutcome::default();
    }

    let job_id = planned_job_id.unwrap_or_else(|| format!("webhook-{}", now.timestamp()));
    let requests = relevant
        .into_iter()
        .map(|r| RepoUpdateRequested {
            job_id: job_id.clone(),
            immediate: false,
            repo_url: r.clone_url.clone(),
            branch: r.branch.clone(),
            requested_at: now,
        })
        .collect();

    WebhookTriggerOutcome { job_id, requests }
}

/// Subscribes to `WebhookReceived` and republishes `RepoUpdateRequested` for
/// every matched, doc-path-relevant repository.
pub struct WebhookConsumer;

impl WebhookConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        resolver: Arc<dyn RepoResolver>,
        check_build_running: Arc<dyn Fn() -> bool + Send + Sync>,
        planned_job_id: Arc<dyn Fn() -> Option<String> + Send + Sync>,
        bus_in: EventBus<WebhookReceived>,
        bus_out: EventBus<RepoUpdateRequested>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut rx, _unsub) = bus_in.subscribe(256);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("webhook trigger consumer shutting down");
                        return;
                    }
                    maybe_evt = rx.recv() => {
                        let Some(evt) = maybe_evt else { return };
                        let repos = resolver.all();
                        let planned = if check_build_running() { planned_job_id() } else { None };
                        let outcome = handle_webhook(&evt, &repos, planned, Utc::now());
                        if outcome.requests.is_empty() {
                            tracing::debug!(
                                repo_full_name = %evt.repo_full_name,
                                "webhook ignored: no matching repository or no doc-path change"
                            );
                            continue;
                        }
                        for req in outcome.requests {
                            if let Err(e) = bus_out.publish(req) {
                                tracing::warn!(error = %e, "failed to publish RepoUpdateRequested: bus closed");
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Builds the direct-enqueue job for a manually triggered build. No
/// debouncing: manual requests always enqueue immediately at high priority.
pub fn manual_build_job(repos: Vec<RepositoryDescriptor>) -> BuildJob {
    BuildJob::new(JobType::Manual, JobPriority::High, repos)
}

/// Periodic scheduled-build trigger, driven by a standard cron expression
/// (`Daemon.Sync.Schedule`). Bypasses the debouncer the same way manual
/// triggers do — a scheduled tick always targets the full configured
/// repository list.
pub struct Scheduler;

impl Scheduler {
    pub fn spawn(
        schedule_expr: String,
        repos_provider: Arc<dyn Fn() -> Vec<RepositoryDescriptor> + Send + Sync>,
        queue: Arc<BuildQueue>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let schedule = match schedule_expr.parse::<cron::Schedule>() {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(schedule = %schedule_expr, error = %e, "invalid cron schedule, scheduler disabled");
                    return;
                }
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!("cron schedule has no upcoming occurrences, scheduler exiting");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("scheduler shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {
                        let job = BuildJob::new(JobType::Scheduled, JobPriority::Normal, repos_provider());
                        if let Err(e) = queue.enqueue(job) {
                            tracing::warn!(error = %e, "scheduled build dropped");
                        }
                    }
                }
            }
        })
    }
}

/// Bounds a repo-cache-relative removal path to `repo_cache_dir`, refusing
/// any `repo_name` whose `..` components would escape it. Lexical only —
/// the target may already be gone, so this can't rely on `canonicalize`.
pub fn safe_repo_cache_path(repo_cache_dir: &Path, repo_name: &str) -> Option<PathBuf> {
    let base = normalize_lexically(repo_cache_dir);
    let joined = normalize_lexically(&repo_cache_dir.join(repo_name));
    if joined.starts_with(&base) && joined != base {
        Some(joined)
    } else {
        None
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Subscribes to `RepoRemoved` (discovery reconciliation) and prunes state,
/// the remote-head cache, and the cached clone directory.
pub struct RepoRemovalConsumer;

impl RepoRemovalConsumer {
    pub fn spawn(
        state: Arc<DocsdStateStore>,
        cache: Arc<Mutex<RemoteHeadCache>>,
        repo_cache_dir: Option<PathBuf>,
        bus_in: EventBus<RepoRemoved>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut rx, _unsub) = bus_in.subscribe(64);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("repo removal consumer shutting down");
                        return;
                    }
                    maybe_evt = rx.recv() => {
                        let Some(evt) = maybe_evt else { return };
                        state.remove_repository(&evt.repo_url);
                        cache.lock().await.remove_repo(&evt.repo_url);

                        let Some(dir) = &repo_cache_dir else { continue };
                        match safe_repo_cache_path(dir, &evt.repo_name) {
                            Some(target) => {
                                if target.exists() {
                                    if let Err(e) = std::fs::remove_dir_all(&target) {
                                        tracing::warn!(path = %target.display(), error = %e, "failed to remove cached clone directory");
                                    }
                                }
                            }
                            None => {
                                tracing::warn!(
                                    repo_name = %evt.repo_name,
                                    cache_dir = %dir.display(),
                                    "refusing to remove path outside the repo cache directory"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, url: &str, branch: &str) -> RepositoryDescriptor {
        RepositoryDescriptor::new(name, url, branch)
    }

    #[test]
    fn matches_owner_repo_regardless_of_git_suffix() {
        assert!(repo_full_name_matches("org/repo", "https://example.com/org/repo.git"));
        assert!(repo_full_name_matches("org/repo.git", "https://example.com/org/repo"));
        assert!(repo_full_name_matches("git@example.com:org/repo.git", "https://example.com/org/repo.git"));
        assert!(!repo_full_name_matches("org/other", "https://example.com/org/repo.git"));
    }

    #[test]
    fn unmatched_repo_full_name_is_ignored() {
        let event = WebhookReceived {
            forge: "github".to_string(),
            repo_full_name: "org/unknown".to_string(),
            branch: "main".to_string(),
            changed_paths: vec!["docs/intro.md".to_string()],
        };
        let outcome = handle_webhook(&event, &[repo("repo", "https://example.com/org/repo.git", "main")], None, Utc::now());
        assert!(outcome.job_id.is_empty());
        assert!(outcome.requests.is_empty());
    }

    #[test]
    fn non_doc_path_change_is_ignored() {
        let event = WebhookReceived {
            forge: "github".to_string(),
            repo_full_name: "org/repo".to_string(),
            branch: "main".to_string(),
            changed_paths: vec!["src/config.yaml".to_string()],
        };
        let outcome = handle_webhook(&event, &[repo("repo", "https://example.com/org/repo.git", "main")], None, Utc::now());
        assert!(outcome.job_id.is_empty());
        assert!(outcome.requests.is_empty());
    }

    #[test]
    fn doc_path_change_produces_job_id_and_request() {
        let event = WebhookReceived {
            forge: "github".to_string(),
            repo_full_name: "org/repo".to_string(),
            branch: "main".to_string(),
            changed_paths: vec!["docs/README.md".to_string()],
        };
        let outcome = handle_webhook(&event, &[repo("repo", "https://example.com/org/repo.git", "main")], None, Utc::now());
        assert!(!outcome.job_id.is_empty());
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].job_id, outcome.job_id);
    }

    #[test]
    fn empty_changed_paths_is_treated_as_relevant() {
        let event = WebhookReceived {
            forge: "github".to_string(),
            repo_full_name: "org/repo".to_string(),
            branch: "main".to_string(),
            changed_paths: vec![],
        };
        let outcome = handle_webhook(&event, &[repo("repo", "https://example.com/org/repo.git", "main")], None, Utc::now());
        assert_eq!(outcome.requests.len(), 1);
    }

    #[test]
    fn planned_job_id_is_reused_when_provided() {
        let event = WebhookReceived {
            forge: "github".to_string(),
            repo_full_name: "org/repo".to_string(),
            branch: "main".to_string(),
            changed_paths: vec!["docs/a.md".to_string()],
        };
        let outcome = handle_webhook(
            &event,
            &[repo("repo", "https://example.com/org/repo.git", "main")],
            Some("orchestrated-build-42".to_string()),
            Utc::now(),
        );
        assert_eq!(outcome.job_id, "orchestrated-build-42");
    }

    #[test]
    fn path_traversal_outside_cache_dir_is_refused() {
        let base = Path::new("/tmp/cache");
        assert_eq!(safe_repo_cache_path(base, "../outside.txt"), None);
        assert_eq!(
            safe_repo_cache_path(base, "normal-repo"),
            Some(PathBuf::from("/tmp/cache/normal-repo"))
        );
    }

    #[test]
    fn path_traversal_guard_rejects_collapsing_to_the_base_itself() {
        let base = Path::new("/tmp/cache");
        assert_eq!(safe_repo_cache_path(base, ".."), None);
    }
}
