//! Per-repository remote-head change detector (§4.3).
//!
//! Consumes [`RepoUpdateRequested`], asks a pluggable [`RemoteHeadChecker`]
//! whether the branch's remote HEAD moved, updates the persisted cache, and
//! — only when it did move — republishes a [`BuildRequested`] carrying the
//! original `job_id` so the eventual build stays linked to whatever
//! triggered the check (typically a webhook).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docsd_types::{BuildRequested, RepoUpdateRequested, RepoUpdated, RepositoryDescriptor};
use docsd_retry::{AsyncRetryExecutor, RetryStrategyConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::remote_head_cache::RemoteHeadCache;
use crate::shutdown::ShutdownSignal;

/// Resolves the full [`RepositoryDescriptor`] for a repo URL from whatever
/// the daemon currently considers "repos for an orchestrated build" —
/// the explicit config list, or the last discovery result.
pub trait RepoResolver: Send + Sync {
    fn resolve(&self, repo_url: &str) -> Option<RepositoryDescriptor>;

    /// Every repository currently considered part of the orchestrated
    /// build, for consumers (the webhook trigger, the scheduler) that need
    /// to scan rather than look up by url.
    fn all(&self) -> Vec<RepositoryDescriptor>;
}

/// A static list, suitable for explicit configuration or a snapshot of the
/// last discovery result.
pub struct StaticRepoResolver {
    repos: Vec<RepositoryDescriptor>,
}

impl StaticRepoResolver {
    pub fn new(repos: Vec<RepositoryDescriptor>) -> Self {
        Self { repos }
    }
}

impl RepoResolver for StaticRepoResolver {
    fn resolve(&self, repo_url: &str) -> Option<RepositoryDescriptor> {
        self.repos.iter().find(|r| r.clone_url == repo_url).cloned()
    }

    fn all(&self) -> Vec<RepositoryDescriptor> {
        self.repos.clone()
    }
}

/// Outcome of checking one repository's remote HEAD.
#[derive(Debug, Clone)]
pub struct RemoteHeadResult {
    pub changed: bool,
    pub commit_sha: String,
}

/// Pluggable remote-head check, e.g. `git ls-remote` or a forge API call.
/// Boxed as a trait object so the daemon can swap in a fake for tests
/// without the repo updater knowing about git or any forge protocol.
#[async_trait]
pub trait RemoteHeadChecker: Send + Sync {
    async fn check(
        &self,
        repo: &RepositoryDescriptor,
        branch: &str,
        cached_sha: Option<&str>,
    ) -> anyhow::Result<RemoteHeadResult>;
}

pub struct RepoUpdater {
    cache: Arc<Mutex<RemoteHeadCache>>,
}

impl RepoUpdater {
    /// Snapshot-save the cache, called from the daemon's shutdown path.
    pub async fn persist_cache(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.cache.lock().await.save(path)
    }

    pub fn spawn(
        resolver: Arc<dyn RepoResolver>,
        checker: Arc<dyn RemoteHeadChecker>,
        cache: Arc<Mutex<RemoteHeadCache>>,
        retry_config: RetryStrategyConfig,
        bus_in: EventBus<RepoUpdateRequested>,
        bus_repo_updated: EventBus<RepoUpdated>,
        bus_build_requested: EventBus<BuildRequested>,
        mut shutdown: ShutdownSignal,
    ) -> (Self, JoinHandle<()>) {
        let handle = Self {
            cache: Arc::clone(&cache),
        };

        let join = tokio::spawn(async move {
            let (mut rx, _unsub) = bus_in.subscribe(256);
            let retry = AsyncRetryExecutor::new(retry_config);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("repo updater shutting down");
                        return;
                    }
                    maybe_req = rx.recv() => {
                        let Some(req) = maybe_req else { return };
                        Self::handle_request(
                            &resolver,
                            &checker,
                            &cache,
                            &retry,
                            &bus_repo_updated,
                            &bus_build_requested,
                            req,
                        )
                        .await;
                    }
                }
            }
        });

        (handle, join)
    }

    async fn handle_request(
        resolver: &Arc<dyn RepoResolver>,
        checker: &Arc<dyn RemoteHeadChecker>,
        cache: &Arc<Mutex<RemoteHeadCache>>,
        retry: &AsyncRetryExecutor,
        bus_repo_updated: &EventBus<RepoUpdated>,
        bus_build_requested: &EventBus<BuildRequested>,
        req: RepoUpdateRequested,
    ) {
        let Some(repo) = resolver.resolve(&req.repo_url) else {
            tracing::warn!(repo_url = %req.repo_url, "repo updater: no configured repository matches");
            let _ = bus_repo_updated.publish(RepoUpdated {
                job_id: req.job_id,
                repo_url: req.repo_url,
                branch: req.branch,
                commit_sha: None,
                changed: false,
                updated_at: Utc::now(),
                immediate: req.immediate,
            });
            return;
        };

        let cached_sha = cache
            .lock()
            .await
            .get(&req.repo_url, &req.branch)
            .map(|e| e.commit_sha.clone());

        let result = retry
            .run_until(
                |_attempt| {
                    let checker = Arc::clone(checker);
                    let repo = repo.clone();
                    let branch = req.branch.clone();
                    let cached_sha = cached_sha.clone();
                    async move { checker.check(&repo, &branch, cached_sha.as_deref()).await }
                },
                |e| {
                    e.downcast_ref::<crate::git_remote::GitRemoteError>()
                        .is_some_and(crate::git_remote::GitRemoteError::is_permanent)
                },
            )
            .await;

        match result {
            Ok(head) => {
                let now = Utc::now();
                cache
                    .lock()
                    .await
                    .record(&req.repo_url, &req.branch, head.commit_sha.clone(), now);

                let _ = bus_repo_updated.publish(RepoUpdated {
                    job_id: req.job_id.clone(),
                    repo_url: req.repo_url.clone(),
                    branch: req.branch.clone(),
                    commit_sha: Some(head.commit_sha),
                    changed: head.changed,
                    updated_at: now,
                    immediate: req.immediate,
                });

                if head.changed {
                    let _ = bus_build_requested.publish(BuildRequested {
                        job_id: Some(req.job_id),
                        immediate: req.immediate,
                        reason: "remote head changed".to_string(),
                        repo_url: req.repo_url,
                        branch: req.branch,
                        requested_at: now,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(repo_url = %req.repo_url, error = %e, "remote head check failed after retries");
                let _ = bus_repo_updated.publish(RepoUpdated {
                    job_id: req.job_id,
                    repo_url: req.repo_url,
                    branch: req.branch,
                    commit_sha: None,
                    changed: false,
                    updated_at: Utc::now(),
                    immediate: req.immediate,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeChecker {
        sha: String,
        fail_first_n: AtomicUsize,
    }

    #[async_trait]
    impl RemoteHeadChecker for FakeChecker {
        async fn check(
            &self,
            _repo: &RepositoryDescriptor,
            _branch: &str,
            cached_sha: Option<&str>,
        ) -> anyhow::Result<RemoteHeadResult> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient network error");
            }
            let changed = cached_sha != Some(self.sha.as_str());
            Ok(RemoteHeadResult {
                changed,
                commit_sha: self.sha.clone(),
            })
        }
    }

    fn repo() -> RepositoryDescriptor {
        RepositoryDescriptor::new("repo", "https://example.com/org/repo.git", "main")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changed_head_publishes_build_requested_with_same_job_id() {
        let resolver: Arc<dyn RepoResolver> = Arc::new(StaticRepoResolver::new(vec![repo()]));
        let checker: Arc<dyn RemoteHeadChecker> = Arc::new(FakeChecker {
            sha: "abc123".to_string(),
            fail_first_n: AtomicUsize::new(0),
        });
        let cache = Arc::new(Mutex::new(RemoteHeadCache::new()));
        let bus_in: EventBus<RepoUpdateRequested> = EventBus::new();
        let bus_repo_updated: EventBus<RepoUpdated> = EventBus::new();
        let bus_build_requested: EventBus<BuildRequested> = EventBus::new();
        let (mut updated_rx, _h1) = bus_repo_updated.subscribe(8);
        let (mut requested_rx, _h2) = bus_build_requested.subscribe(8);

        let (_updater, _join) = RepoUpdater::spawn(
            resolver,
            checker,
            cache,
            RetryStrategyConfig {
                max_attempts: 2,
                ..docsd_retry::RetryPolicy::Default.to_config()
            },
            bus_in.clone(),
            bus_repo_updated,
            bus_build_requested,
            crate::shutdown::ShutdownHandle::new().1,
        );

        bus_in
            .publish(RepoUpdateRequested {
                job_id: "webhook-1".to_string(),
                immediate: false,
                repo_url: "https://example.com/org/repo.git".to_string(),
                branch: "main".to_string(),
                requested_at: Utc::now(),
            })
            .unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(1), updated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.changed);
        assert_eq!(updated.commit_sha, Some("abc123".to_string()));

        let requested = tokio::time::timeout(Duration::from_secs(1), requested_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requested.job_id, Some("webhook-1".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unchanged_head_does_not_publish_build_requested() {
        let resolver: Arc<dyn RepoResolver> = Arc::new(StaticRepoResolver::new(vec![repo()]));
        let checker: Arc<dyn RemoteHeadChecker> = Arc::new(FakeChecker {
            sha: "abc123".to_string(),
            fail_first_n: AtomicUsize::new(0),
        });
        let cache = Arc::new(Mutex::new(RemoteHeadCache::new()));
        cache
            .lock()
            .await
            .record("https://example.com/org/repo.git", "main", "abc123".to_string(), Utc::now());

        let bus_in: EventBus<RepoUpdateRequested> = EventBus::new();
        let bus_repo_updated: EventBus<RepoUpdated> = EventBus::new();
        let bus_build_requested: EventBus<BuildRequested> = EventBus::new();
        let (mut updated_rx, _h1) = bus_repo_updated.subscribe(8);
        let (mut requested_rx, _h2) = bus_build_requested.subscribe(8);

        let (_updater, _join) = RepoUpdater::spawn(
            resolver,
            checker,
            cache,
            docsd_retry::RetryPolicy::Default.to_config(),
            bus_in.clone(),
            bus_repo_updated,
            bus_build_requested,
            crate::shutdown::ShutdownHandle::new().1,
        );

        bus_in
            .publish(RepoUpdateRequested {
                job_id: "webhook-2".to_string(),
                immediate: false,
                repo_url: "https://example.com/org/repo.git".to_string(),
                branch: "main".to_string(),
                requested_at: Utc::now(),
            })
            .unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(1), updated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.changed);

        let no_request = tokio::time::timeout(Duration::from_millis(200), requested_rx.recv()).await;
        assert!(no_request.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolved_repo_reports_unchanged_without_panicking() {
        let resolver: Arc<dyn RepoResolver> = Arc::new(StaticRepoResolver::new(vec![]));
        let checker: Arc<dyn RemoteHeadChecker> = Arc::new(FakeChecker {
            sha: "abc123".to_string(),
            fail_first_n: AtomicUsize::new(0),
        });
        let cache = Arc::new(Mutex::new(RemoteHeadCache::new()));
        let bus_in: EventBus<RepoUpdateRequested> = EventBus::new();
        let bus_repo_updated: EventBus<RepoUpdated> = EventBus::new();
        let bus_build_requested: EventBus<BuildRequested> = EventBus::new();
        let (mut updated_rx, _h1) = bus_repo_updated.subscribe(8);

        let (_updater, _join) = RepoUpdater::spawn(
            resolver,
            checker,
            cache,
            docsd_retry::RetryPolicy::Default.to_config(),
            bus_in.clone(),
            bus_repo_updated,
            bus_build_requested,
            crate::shutdown::ShutdownHandle::new().1,
        );

        bus_in
            .publish(RepoUpdateRequested {
                job_id: "webhook-3".to_string(),
                immediate: false,
                repo_url: "https://unknown.example.com/org/repo.git".to_string(),
                branch: "main".to_string(),
                requested_at: Utc::now(),
            })
            .unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(1), updated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.changed);
        assert_eq!(updated.commit_sha, None);
    }

    struct AlwaysAuthFailsChecker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteHeadChecker for AlwaysAuthFailsChecker {
        async fn check(
            &self,
            repo: &RepositoryDescriptor,
            _branch: &str,
            _cached_sha: Option<&str>,
        ) -> anyhow::Result<RemoteHeadResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(crate::git_remote::GitRemoteError::AuthFailed {
                url: repo.clone_url.clone(),
            }
            .into())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_auth_failure_is_not_retried() {
        let resolver: Arc<dyn RepoResolver> = Arc::new(StaticRepoResolver::new(vec![repo()]));
        let calls = Arc::new(AtomicUsize::new(0));
        let checker: Arc<dyn RemoteHeadChecker> = Arc::new(AlwaysAuthFailsChecker {
            calls: Arc::clone(&calls),
        });
        let cache = Arc::new(Mutex::new(RemoteHeadCache::new()));
        let bus_in: EventBus<RepoUpdateRequested> = EventBus::new();
        let bus_repo_updated: EventBus<RepoUpdated> = EventBus::new();
        let bus_build_requested: EventBus<BuildRequested> = EventBus::new();
        let (mut updated_rx, _h1) = bus_repo_updated.subscribe(8);

        let (_updater, _join) = RepoUpdater::spawn(
            resolver,
            checker,
            cache,
            RetryStrategyConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(5),
                ..docsd_retry::RetryPolicy::Default.to_config()
            },
            bus_in.clone(),
            bus_repo_updated,
            bus_build_requested,
            crate::shutdown::ShutdownHandle::new().1,
        );

        bus_in
            .publish(RepoUpdateRequested {
                job_id: "webhook-4".to_string(),
                immediate: false,
                repo_url: "https://example.com/org/repo.git".to_string(),
                branch: "main".to_string(),
                requested_at: Utc::now(),
            })
            .unwrap();

        let updated = tokio::time::timeout(Duration::from_secs(1), updated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.changed);

        // Give a would-be retry loop a chance to fire before asserting it didn't.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "auth failure should short-circuit retries, not exhaust max_attempts"
        );
    }
}
