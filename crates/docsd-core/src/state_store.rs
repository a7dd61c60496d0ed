//! Persisted daemon state (§6, `daemon-state.json`).
//!
//! The pipeline never talks to [`DocsdStateStore`] directly; it consumes
//! one capability trait at a time (`RepositoryCommitTracker`,
//! `RepositoryBuildCounter`, `RepositoryMetadataWriter`,
//! `ConfigurationStateStore`) so a future backend only has to implement the
//! slice it actually needs, never a god-interface.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::persist;
use crate::shutdown::ShutdownSignal;

const SCHEMA_VERSION: &str = "2.0.0";
const DEFAULT_BUILD_RETENTION: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoState {
    pub last_commit: Option<String>,
    pub doc_files_hash: Option<String>,
    pub doc_file_paths: Vec<String>,
    pub document_count: u64,
    pub build_count: u64,
    pub error_count: u64,
    pub last_build: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub job_id: String,
    pub outcome: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStatistics {
    pub total_builds: u64,
    pub total_errors: u64,
    pub total_deletions_detected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub status: String,
    pub repositories: HashMap<String, RepoState>,
    pub builds: VecDeque<BuildRecord>,
    pub schedules: HashMap<String, String>,
    pub statistics: DaemonStatistics,
    pub configuration: Option<serde_json::Value>,
    pub last_config_hash: Option<String>,
    pub last_report_checksum: Option<String>,
    pub last_global_doc_files_hash: Option<String>,
}

impl Default for StateDocument {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION.to_string(),
            start_time: now,
            last_update: now,
            status: "idle".to_string(),
            repositories: HashMap::new(),
            builds: VecDeque::new(),
            schedules: HashMap::new(),
            statistics: DaemonStatistics::default(),
            configuration: None,
            last_config_hash: None,
            last_report_checksum: None,
            last_global_doc_files_hash: None,
        }
    }
}

/// Repository commit tracking: reading/recording each repo's last-built
/// commit sha (distinct from the remote-head cache, which tracks what the
/// *remote* reports regardless of whether a build used it).
pub trait RepositoryCommitTracker: Send + Sync {
    fn last_commit(&self, repo_url: &str) -> Option<String>;
    fn set_last_commit(&self, repo_url: &str, commit: String);
}

/// Per-repository build/error counters.
pub trait RepositoryBuildCounter: Send + Sync {
    fn increment_build_count(&self, repo_url: &str);
    fn increment_error_count(&self, repo_url: &str);
    fn set_document_count(&self, repo_url: &str, count: u64);
    fn set_last_build(&self, repo_url: &str, when: DateTime<Utc>);
}

/// Per-repository doc-files hash and path-list persistence, consumed by the
/// delta analyzer and the pipeline's global-hash recomposition step.
pub trait RepositoryMetadataWriter: Send + Sync {
    fn doc_files_hash(&self, repo_url: &str) -> Option<String>;
    fn set_doc_files_hash(&self, repo_url: &str, hash: String);
    fn doc_file_paths(&self, repo_url: &str) -> Vec<String>;
    fn set_doc_file_paths(&self, repo_url: &str, paths: Vec<String>);
    /// Every configured repo's persisted path list, for global-hash recomposition.
    fn all_doc_file_paths(&self) -> HashMap<String, Vec<String>>;
}

/// Global (non-per-repo) persisted values the skip evaluator and
/// post-persistence stage read and write.
pub trait ConfigurationStateStore: Send + Sync {
    fn last_config_hash(&self) -> Option<String>;
    fn set_last_config_hash(&self, hash: String);
    fn last_report_checksum(&self) -> Option<String>;
    fn set_last_report_checksum(&self, checksum: String);
    fn last_global_doc_files_hash(&self) -> Option<String>;
    fn set_last_global_doc_files_hash(&self, hash: String);
}

pub struct DocsdStateStore {
    doc: RwLock<StateDocument>,
    path: PathBuf,
    dirty: AtomicBool,
    build_retention: usize,
}

impl DocsdStateStore {
    pub fn load_or_default(path: PathBuf) -> Arc<Self> {
        let doc = persist::load_json_lenient(&path).unwrap_or_default();
        Arc::new(Self {
            doc: RwLock::new(doc),
            path,
            dirty: AtomicBool::new(false),
            build_retention: DEFAULT_BUILD_RETENTION,
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn with_repo_mut<F: FnOnce(&mut RepoState)>(&self, repo_url: &str, f: F) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        let entry = doc.repositories.entry(repo_url.to_string()).or_default();
        f(entry);
        doc.last_update = Utc::now();
        drop(doc);
        self.mark_dirty();
    }

    /// Record a completed build, evicting the oldest entry once retention
    /// is exceeded — the source this lineage continues from declares a
    /// 100-entry retention policy but never actually evicts; this store
    /// enforces true eviction.
    pub fn record_build(&self, record: BuildRecord) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.builds.push_back(record);
        while doc.builds.len() > self.build_retention {
            doc.builds.pop_front();
        }
        doc.statistics.total_builds += 1;
        doc.last_update = Utc::now();
        drop(doc);
        self.mark_dirty();
    }

    pub fn record_deletions_detected(&self, count: u64) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.statistics.total_deletions_detected += count;
        drop(doc);
        self.mark_dirty();
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.status = status.into();
        doc.last_update = Utc::now();
        drop(doc);
        self.mark_dirty();
    }

    pub fn set_configuration_snapshot(&self, snapshot: serde_json::Value) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.configuration = Some(snapshot);
        drop(doc);
        self.mark_dirty();
    }

    pub fn remove_repository(&self, repo_url: &str) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.repositories.remove(repo_url);
        drop(doc);
        self.mark_dirty();
    }

    /// A deep-copy snapshot for observability (CLI `status`, admin surface).
    pub fn snapshot(&self) -> StateDocument {
        self.doc.read().expect("state store lock poisoned").clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush now if dirty. Retries transient I/O failures with backoff;
    /// failures are logged and counted, never promoted to a build failure.
    pub fn flush_if_dirty(&self) -> anyhow::Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let bytes = {
            let doc = self.doc.read().expect("state store lock poisoned");
            serde_json::to_vec_pretty(&*doc)?
        };
        let executor = docsd_retry::RetryExecutor::from_policy(docsd_retry::RetryPolicy::Aggressive);
        let path = self.path.clone();
        let result = executor.run(|_attempt| persist::atomic_write(&path, &bytes));
        if let Err(e) = &result {
            tracing::warn!(error = %e, path = %self.path.display(), "state store flush failed after retries");
            self.dirty.store(true, Ordering::SeqCst);
        }
        result.map(|()| true)
    }

    /// Spawn the debounced flush task; a final flush runs once cancellation
    /// is observed so shutdown never drops a dirty document.
    pub fn spawn_flush_task(
        self: Arc<Self>,
        flush_interval: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let store = Arc::clone(&self);
                        let _ = tokio::task::spawn_blocking(move || store.flush_if_dirty()).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        let store = Arc::clone(&self);
                        if let Err(e) = tokio::task::spawn_blocking(move || store.flush_if_dirty()).await {
                            tracing::warn!(error = %e, "state store flush task panicked");
                        }
                    }
                }
            }
        })
    }
}

impl RepositoryCommitTracker for DocsdStateStore {
    fn last_commit(&self, repo_url: &str) -> Option<String> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .repositories
            .get(repo_url)
            .and_then(|r| r.last_commit.clone())
    }

    fn set_last_commit(&self, repo_url: &str, commit: String) {
        self.with_repo_mut(repo_url, |r| r.last_commit = Some(commit));
    }
}

impl RepositoryBuildCounter for DocsdStateStore {
    fn increment_build_count(&self, repo_url: &str) {
        self.with_repo_mut(repo_url, |r| r.build_count += 1);
    }

    fn increment_error_count(&self, repo_url: &str) {
        self.with_repo_mut(repo_url, |r| r.error_count += 1);
    }

    fn set_document_count(&self, repo_url: &str, count: u64) {
        self.with_repo_mut(repo_url, |r| r.document_count = count);
    }

    fn set_last_build(&self, repo_url: &str, when: DateTime<Utc>) {
        self.with_repo_mut(repo_url, |r| r.last_build = Some(when));
    }
}

impl RepositoryMetadataWriter for DocsdStateStore {
    fn doc_files_hash(&self, repo_url: &str) -> Option<String> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .repositories
            .get(repo_url)
            .and_then(|r| r.doc_files_hash.clone())
    }

    fn set_doc_files_hash(&self, repo_url: &str, hash: String) {
        self.with_repo_mut(repo_url, |r| r.doc_files_hash = Some(hash));
    }

    fn doc_file_paths(&self, repo_url: &str) -> Vec<String> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .repositories
            .get(repo_url)
            .map(|r| r.doc_file_paths.clone())
            .unwrap_or_default()
    }

    fn set_doc_file_paths(&self, repo_url: &str, paths: Vec<String>) {
        self.with_repo_mut(repo_url, |r| r.doc_file_paths = paths);
    }

    fn all_doc_file_paths(&self) -> HashMap<String, Vec<String>> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .repositories
            .iter()
            .map(|(url, r)| (url.clone(), r.doc_file_paths.clone()))
            .collect()
    }
}

impl ConfigurationStateStore for DocsdStateStore {
    fn last_config_hash(&self) -> Option<String> {
        self.doc.read().expect("state store lock poisoned").last_config_hash.clone()
    }

    fn set_last_config_hash(&self, hash: String) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.last_config_hash = Some(hash);
        drop(doc);
        self.mark_dirty();
    }

    fn last_report_checksum(&self) -> Option<String> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .last_report_checksum
            .clone()
    }

    fn set_last_report_checksum(&self, checksum: String) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.last_report_checksum = Some(checksum);
        drop(doc);
        self.mark_dirty();
    }

    fn last_global_doc_files_hash(&self) -> Option<String> {
        self.doc
            .read()
            .expect("state store lock poisoned")
            .last_global_doc_files_hash
            .clone()
    }

    fn set_last_global_doc_files_hash(&self, hash: String) {
        let mut doc = self.doc.write().expect("state store lock poisoned");
        doc.last_global_doc_files_hash = Some(hash);
        drop(doc);
        self.mark_dirty();
    }
}
