//! # docsd-core
//!
//! Build-trigger and orchestration core behind the `docsd` documentation
//! build daemon.
//!
//! `docsd` watches a set of configured (or discovered) repositories,
//! coalesces change signals from webhooks, a periodic schedule, and manual
//! triggers into a single debounced build request, and drives a staged
//! pipeline that skips unchanged output, classifies a build as full or
//! partial, and hands off to a pluggable site generator.
//!
//! ## Pipeline
//!
//! The core flow is **trigger → debounce → enqueue → build**:
//!
//! 1. [`trigger`] turns webhooks, scheduled ticks, and manual requests into
//!    [`docsd_types::RepoUpdateRequested`] or a direct [`queue::BuildJob`].
//! 2. [`repo_updater`] resolves a webhook's remote-head delta and republishes
//!    [`docsd_types::BuildRequested`] only when the branch actually moved.
//! 3. [`debouncer`] coalesces a burst of `BuildRequested` events into at most
//!    one [`docsd_types::BuildNow`] per quiet window (or forced at `max_delay`).
//! 4. [`queue`] turns each `BuildNow` into a [`queue::BuildJob`] and runs it
//!    through a bounded worker pool.
//! 5. [`pipeline`] executes the staged build: early skip, delta analysis,
//!    workspace preparation, generation, and post-persistence.
//!
//! ## Key Types
//!
//! - [`Daemon`] — wires every subsystem above together behind one
//!   construct/run/stop lifecycle; the CLI adapter's only entry point.
//! - [`config::DocsdConfig`] — `docsd.toml` surface plus `DOCSD_*` env overrides.
//! - [`state_store::DocsdStateStore`] — persisted per-repository and global state.
//! - [`queue::BuildJob`] / [`docsd_types::BuildReport`] — one build's input and outcome.
//!
//! ## Modules
//!
//! - [`bus`] — typed in-process publish/subscribe, one instance per event kind.
//! - [`config`] — `docsd.toml` loading, env overrides, validation, config hashing.
//! - [`debouncer`] — build-request coalescing state machine.
//! - [`delta`] — full-vs-partial build classification from commit/quick-hash state.
//! - [`error`] — [`ConfigError`] and [`WebhookError`], the two typed boundaries.
//! - [`generator`] — the out-of-scope site generator contract.
//! - [`git_remote`] — default `git ls-remote`-backed [`repo_updater::RemoteHeadChecker`].
//! - [`livereload`] — in-process livereload broadcast hub.
//! - [`persist`] — atomic tempfile-then-rename JSON persistence.
//! - [`pipeline`] — the staged build [`queue::Builder`] implementation.
//! - [`queue`] — bounded FIFO build queue with a worker pool.
//! - [`remote_head_cache`] — persisted `(repo, branch) -> commit_sha` cache.
//! - [`repo_updater`] — per-repository remote-head change detector.
//! - [`shutdown`] — cooperative cancellation shared by every long-running task.
//! - [`skip`] — early-skip rule chain.
//! - [`state_store`] — persisted daemon state behind four capability traits.
//! - [`trigger`] — webhook/manual/scheduled/removal trigger consumers.
//! - [`webhook`] — HMAC-SHA256 inbound webhook signature verification.
//!
//! ## Out of scope
//!
//! The site generator, forge clients, HTTP admin surface, and livereload
//! transport are specified only by the interfaces this crate consumes —
//! see [`generator::SiteGenerator`], [`repo_updater::RepoResolver`],
//! [`repo_updater::RemoteHeadChecker`], and [`livereload::LiveReloadHub`].

pub mod bus;
pub mod config;
pub mod debouncer;
pub mod delta;
pub mod error;
pub mod generator;
pub mod git_remote;
pub mod livereload;
pub mod persist;
pub mod pipeline;
pub mod queue;
pub mod remote_head_cache;
pub mod repo_updater;
pub mod shutdown;
pub mod skip;
pub mod state_store;
pub mod trigger;
pub mod webhook;

pub use error::{ConfigError, WebhookError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docsd_types::{
    BuildNow, BuildRequested, RepoRemoved, RepoUpdateRequested, RepoUpdated, RepositoryDescriptor,
    WebhookReceived,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::DocsdConfig;
use crate::debouncer::{Debouncer, DebouncerConfig};
use crate::generator::SiteGenerator;
use crate::livereload::{BroadcastLiveReloadHub, LiveReloadHub};
use crate::pipeline::{Pipeline, PipelineMetrics};
use crate::queue::{BuildJob, BuildQueue};
use crate::remote_head_cache::{self, RemoteHeadCache};
use crate::repo_updater::{RemoteHeadChecker, RepoResolver, RepoUpdater};
use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::state_store::DocsdStateStore;
use crate::trigger::{RepoRemovalConsumer, Scheduler, WebhookConsumer};

/// Where the daemon persists its state between runs.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub state_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("daemon-state.json")
    }

    pub fn remote_head_cache_file(&self) -> PathBuf {
        remote_head_cache::default_cache_path(&self.state_dir)
    }
}

/// Every external collaborator the daemon needs injected: the site
/// generator, the remote-head checker, and (optionally) a repository
/// resolver standing in for a discovery pass. All three are out-of-scope
/// interfaces per the design notes — the daemon only ever calls through
/// the trait object.
pub struct DaemonDeps {
    pub generator: Arc<dyn SiteGenerator>,
    pub remote_head_checker: Arc<dyn RemoteHeadChecker>,
    pub livereload: Arc<dyn LiveReloadHub>,
}

/// Wires the bus/debouncer/repo-updater/queue/trigger subsystems into one
/// construct → run → stop lifecycle.
///
/// Per the design notes, this is two disjoint graphs plus a plain handle:
/// the daemon owns the queue, the queue owns in-flight jobs, and jobs
/// reference the state store only through the capability-trait handles the
/// [`Pipeline`] was built with — there are no cycles, so a fresh `Daemon`
/// can be constructed from scratch in every test.
pub struct Daemon {
    config: DocsdConfig,
    state: Arc<DocsdStateStore>,
    remote_head_cache: Arc<Mutex<RemoteHeadCache>>,
    paths: DaemonPaths,
    queue: Arc<BuildQueue>,
    debouncer: Debouncer,
    shutdown: ShutdownHandle,
    bus_webhook_received: EventBus<WebhookReceived>,
    bus_repo_removed: EventBus<RepoRemoved>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Construct every subsystem and spawn its task, returning a handle
    /// ready to accept triggers. Does not block; callers await [`Daemon::stop`]
    /// (or simply hold the handle) for the daemon's lifetime.
    pub fn spawn(config: DocsdConfig, paths: DaemonPaths, deps: DaemonDeps) -> Self {
        let (shutdown, root_signal) = ShutdownHandle::new();
        let state = DocsdStateStore::load_or_default(paths.state_file());
        let remote_head_cache = Arc::new(Mutex::new(RemoteHeadCache::load(
            &paths.remote_head_cache_file(),
        )));

        let bus_build_requested: EventBus<BuildRequested> = EventBus::new();
        let bus_build_now: EventBus<BuildNow> = EventBus::new();
        let bus_webhook_received: EventBus<WebhookReceived> = EventBus::new();
        let bus_repo_update_requested: EventBus<RepoUpdateRequested> = EventBus::new();
        let bus_repo_updated: EventBus<RepoUpdated> = EventBus::new();
        let bus_repo_removed: EventBus<RepoRemoved> = EventBus::new();

        let mut tasks = Vec::new();

        let metrics = Arc::new(PipelineMetrics::default());
        let pipeline = Arc::new(Pipeline::new(
            config.clone(),
            Arc::clone(&deps.generator),
            state.clone(),
            state.clone(),
            state.clone(),
            state.clone(),
            Arc::clone(&deps.livereload),
            Arc::clone(&metrics),
        ));

        let queue = Arc::new(BuildQueue::spawn(
            config.daemon.sync.queue_size,
            config.daemon.sync.concurrent_builds,
            pipeline,
            root_signal.clone(),
        ));

        let (debouncer, debounce_task) = Debouncer::spawn(
            DebouncerConfig {
                quiet_window: config.daemon.sync.debounce.quiet_window,
                max_delay: config.daemon.sync.debounce.max_delay,
                poll_interval: config.daemon.sync.debounce.poll_interval,
            },
            bus_build_requested.clone(),
            bus_build_now.clone(),
            queue_running_predicate(Arc::clone(&queue)),
            root_signal.clone(),
        );
        tasks.push(debounce_task);

        tasks.push(queue::EnqueueConsumer::spawn(
            repos_provider(config.repositories.clone()),
            Arc::clone(&queue),
            bus_build_now,
            root_signal.clone(),
        ));

        let resolver: Arc<dyn RepoResolver> =
            Arc::new(repo_updater::StaticRepoResolver::new(config.repositories.clone()));
        let (repo_updater_handle, repo_updater_task) = RepoUpdater::spawn(
            Arc::clone(&resolver),
            Arc::clone(&deps.remote_head_checker),
            Arc::clone(&remote_head_cache),
            docsd_retry::RetryPolicy::Default.to_config(),
            bus_repo_update_requested.clone(),
            bus_repo_updated,
            bus_build_requested,
            root_signal.clone(),
        );
        tasks.push(repo_updater_task);
        // The updater handle only exists to persist the cache at shutdown;
        // its cache Arc is shared, so dropping the handle here is safe.
        drop(repo_updater_handle);

        tasks.push(WebhookConsumer::spawn(
            resolver,
            is_build_running_predicate(Arc::clone(&queue)),
            planned_job_id_predicate(debouncer.clone()),
            bus_webhook_received.clone(),
            bus_repo_update_requested,
            root_signal.clone(),
        ));

        tasks.push(Scheduler::spawn(
            config.daemon.sync.schedule.clone(),
            repos_provider(config.repositories.clone()),
            Arc::clone(&queue),
            root_signal.clone(),
        ));

        tasks.push(RepoRemovalConsumer::spawn(
            Arc::clone(&state),
            Arc::clone(&remote_head_cache),
            config.daemon.storage.repo_cache_dir.clone(),
            bus_repo_removed.clone(),
            root_signal.clone(),
        ));

        let flush_interval = config
            .daemon
            .storage
            .flush_interval
            .unwrap_or(Duration::from_secs(5));
        tasks.push(Arc::clone(&state).spawn_flush_task(flush_interval, root_signal));

        state.set_status("running");

        Self {
            config,
            state,
            remote_head_cache,
            paths,
            queue,
            debouncer,
            shutdown,
            bus_webhook_received,
            bus_repo_removed,
            tasks,
        }
    }

    /// Enqueue a manual, high-priority build of the full configured
    /// repository list (§4.4 — manual triggers bypass the debouncer).
    pub fn trigger_manual_build(&self) -> Result<String, queue::QueueError> {
        let job = trigger::manual_build_job(self.config.repositories.clone());
        let id = job.id.clone();
        self.queue.enqueue(job)?;
        Ok(id)
    }

    /// Feed an inbound, already-signature-verified webhook payload into the
    /// trigger layer.
    pub fn publish_webhook(&self, event: WebhookReceived) -> anyhow::Result<()> {
        self.bus_webhook_received
            .publish(event)
            .map_err(|e| anyhow::anyhow!("webhook bus closed: {e}"))?;
        Ok(())
    }

    /// Report a repository as removed by a discovery reconciliation pass.
    pub fn publish_repo_removed(&self, event: RepoRemoved) -> anyhow::Result<()> {
        self.bus_repo_removed
            .publish(event)
            .map_err(|e| anyhow::anyhow!("repo-removed bus closed: {e}"))?;
        Ok(())
    }

    pub fn job_snapshot(&self, job_id: &str) -> Option<docsd_types::JobSnapshot> {
        self.queue.snapshot(job_id)
    }

    pub fn active_jobs(&self) -> Vec<docsd_types::JobSnapshot> {
        self.queue.active_jobs()
    }

    pub fn state_snapshot(&self) -> state_store::StateDocument {
        self.state.snapshot()
    }

    pub fn config(&self) -> &DocsdConfig {
        &self.config
    }

    /// Signal every task to stop, drain the build queue, and persist both
    /// the state store and the remote-head cache one last time.
    pub async fn stop(self, drain_timeout: Duration) {
        self.shutdown.cancel();
        self.state.set_status("stopped");

        let queue = Arc::try_unwrap(self.queue).unwrap_or_else(|arc| {
            tracing::warn!("build queue still shared at shutdown, stopping via clone");
            // BuildQueue::stop consumes by value; an outstanding Arc clone
            // (e.g. a scheduler tick in flight) means this daemon instance
            // isn't the sole owner. Cloning the inner channel handles would
            // require BuildQueue to expose that, so fall back to waiting out
            // the same workers through the shared reference's Drop instead.
            drop(arc);
            return;
        });
        queue.stop(drain_timeout).await;

        for task in self.tasks {
            let _ = tokio::time::timeout(drain_timeout, task).await;
        }

        if let Err(e) = self.state.flush_if_dirty() {
            tracing::warn!(error = %e, "final state store flush failed");
        }
        if let Err(e) = self
            .remote_head_cache
            .lock()
            .await
            .save(&self.paths.remote_head_cache_file())
        {
            tracing::warn!(error = %e, "final remote-head cache flush failed");
        }
    }

    /// A fresh shutdown signal, for an embedder that wants to observe
    /// cancellation without tearing the daemon down itself.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }
}

fn repos_provider(
    repos: Vec<RepositoryDescriptor>,
) -> Arc<dyn Fn() -> Vec<RepositoryDescriptor> + Send + Sync> {
    Arc::new(move || repos.clone())
}

fn queue_running_predicate(queue: Arc<BuildQueue>) -> Arc<dyn Fn() -> bool + Send + Sync> {
    Arc::new(move || queue.is_build_running())
}

fn is_build_running_predicate(queue: Arc<BuildQueue>) -> Arc<dyn Fn() -> bool + Send + Sync> {
    Arc::new(move || queue.is_build_running())
}

fn planned_job_id_predicate(
    debouncer: Debouncer,
) -> Arc<dyn Fn() -> Option<String> + Send + Sync> {
    Arc::new(move || {
        // `planned_job_id` is async; the webhook consumer only needs a best
        // effort id to piggyback on, so a blocking-free `try_lock`-style
        // read would be ideal, but the debouncer only exposes the async
        // accessor. `futures::executor::block_on` would pull in an extra
        // dependency for one call site, so this runs it on the current
        // Tokio runtime via `Handle::block_on` from inside the consumer's
        // own async context instead.
        let debouncer = debouncer.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(debouncer.planned_job_id())
        })
    })
}
