//! Bounded FIFO build queue with `W` worker tasks (§4.5), plus the consumer
//! that turns each debounced `BuildNow` into a queued job (§2's "enqueue
//! consumer").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docsd_types::{BuildNow, BuildOutcome, BuildReport, JobPriority, JobSnapshot, JobStatus, JobType, RepositoryDescriptor};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::shutdown::ShutdownSignal;

/// Everything a queued build needs beyond its lightweight [`JobSnapshot`]:
/// the typed carrier the design notes call for in place of an untyped
/// metadata bag. Cross-component references (repos, reasons) live here;
/// the state and livereload handles a pipeline needs are injected into the
/// [`Builder`] implementation itself, not into the job.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub created_at: chrono::DateTime<Utc>,
    pub selected_repositories: Vec<RepositoryDescriptor>,
    pub repo_reasons: HashMap<String, String>,
}

impl BuildJob {
    pub fn new(job_type: JobType, priority: JobPriority, repos: Vec<RepositoryDescriptor>) -> Self {
        Self {
            id: format!("job-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            job_type,
            priority,
            created_at: Utc::now(),
            selected_repositories: repos,
            repo_reasons: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_repo_reasons(mut self, reasons: HashMap<String, String>) -> Self {
        self.repo_reasons = reasons;
        self
    }
}

/// The user-supplied execution contract a worker calls for each pulled job.
/// The staged build pipeline (§4.8) is the production implementation; tests
/// supply fakes.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, job: BuildJob, shutdown: ShutdownSignal) -> anyhow::Result<BuildReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("build queue is full")]
    Full,
    #[error("build queue is closed")]
    Closed,
}

/// Bounded FIFO with `W` concurrent workers sharing one receive end.
/// `enqueue` fails synchronously when the queue is full or closed; the
/// length counter (the channel's own backpressure) is never advanced on
/// failure.
pub struct BuildQueue {
    tx: mpsc::Sender<BuildJob>,
    jobs: Arc<std::sync::Mutex<HashMap<String, JobSnapshot>>>,
    active: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl BuildQueue {
    pub fn spawn(
        capacity: usize,
        workers: usize,
        builder: Arc<dyn Builder>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let jobs: Arc<std::sync::Mutex<HashMap<String, JobSnapshot>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let mut worker_handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let jobs = Arc::clone(&jobs);
            let active = Arc::clone(&active);
            let builder = Arc::clone(&builder);
            let mut worker_shutdown = shutdown.clone();

            worker_handles.push(tokio::spawn(async move {
                loop {
                    let maybe_job = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = worker_shutdown.cancelled() => None,
                            job = guard.recv() => job,
                        }
                    };
                    let Some(job) = maybe_job else {
                        tracing::debug!(worker = worker_id, "build queue worker shutting down");
                        return;
                    };

                    active.fetch_add(1, Ordering::SeqCst);
                    mark_status(&jobs, &job.id, JobStatus::Running, |s| s.started_at = Some(Utc::now()));

                    tracing::info!(job_id = %job.id, worker = worker_id, "build starting");
                    let result = builder.build(job.clone(), worker_shutdown.clone()).await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    let status = match &result {
                        Ok(report) if report.outcome == Some(BuildOutcome::Failed) => JobStatus::Failed,
                        Ok(_) => JobStatus::Completed,
                        Err(_) => JobStatus::Failed,
                    };
                    mark_status(&jobs, &job.id, status, |s| s.completed_at = Some(Utc::now()));

                    if let Err(e) = result {
                        tracing::error!(job_id = %job.id, error = %e, "build pipeline returned an error");
                    }
                }
            }));
        }

        Self {
            tx,
            jobs,
            active,
            closed,
            worker_handles,
        }
    }

    pub fn enqueue(&self, job: BuildJob) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let mut snapshot = JobSnapshot::new(job.id.clone(), job.job_type, job.priority);
        snapshot.repo_reasons = job.repo_reasons.clone();

        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        self.jobs
            .lock()
            .expect("build queue jobs mutex poisoned")
            .insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .expect("build queue jobs mutex poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.jobs
            .lock()
            .expect("build queue jobs mutex poisoned")
            .values()
            .filter(|s| s.status == JobStatus::Running)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_build_running(&self) -> bool {
        self.active_count() > 0
    }

    /// Stop accepting new jobs and wait up to `timeout` for active workers
    /// to drain; workers still running past the deadline are abandoned
    /// (their `JoinHandle` is dropped, not aborted, so an in-flight build
    /// finishes rather than being torn down mid-write).
    pub async fn stop(mut self, timeout: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        for handle in self.worker_handles.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                tracing::warn!("build queue worker did not stop within the shutdown window");
            }
        }
    }
}

fn mark_status(
    jobs: &std::sync::Mutex<HashMap<String, JobSnapshot>>,
    job_id: &str,
    status: JobStatus,
    extra: impl FnOnce(&mut JobSnapshot),
) {
    let mut jobs = jobs.lock().expect("build queue jobs mutex poisoned");
    if let Some(snapshot) = jobs.get_mut(job_id) {
        snapshot.status = status;
        extra(snapshot);
    }
}

/// Subscribes to `BuildNow` and turns each into a queued [`BuildJob`] against
/// the full configured repository list — the delta analyzer narrows the
/// selection later, inside the pipeline, so the queue itself stays ignorant
/// of partial-build logic.
pub struct EnqueueConsumer;

impl EnqueueConsumer {
    pub fn spawn(
        repos_provider: Arc<dyn Fn() -> Vec<RepositoryDescriptor> + Send + Sync>,
        queue: Arc<BuildQueue>,
        bus_in: EventBus<BuildNow>,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (mut rx, _unsub) = bus_in.subscribe(64);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("enqueue consumer shutting down");
                        return;
                    }
                    maybe_evt = rx.recv() => {
                        let Some(evt) = maybe_evt else { return };
                        let repos = repos_provider();
                        let mut repo_reasons = HashMap::new();
                        repo_reasons.insert(
                            evt.last_repo_url.clone(),
                            format!("{} ({})", evt.last_reason, evt.debounce_cause),
                        );
                        let job = BuildJob::new(JobType::Webhook, JobPriority::Normal, repos)
                            .with_id(evt.job_id.clone())
                            .with_repo_reasons(repo_reasons);
                        if let Err(e) = queue.enqueue(job) {
                            tracing::warn!(job_id = %evt.job_id, error = %e, "dropped BuildNow: queue full or closed");
                        }
                    }
                }
            }
        })
    }
}
