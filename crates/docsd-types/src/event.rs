use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the debouncer emitted a given `BuildNow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceCause {
    Quiet,
    MaxDelay,
    Immediate,
    AfterRunning,
}

impl std::fmt::Display for DebounceCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DebounceCause::Quiet => "quiet",
            DebounceCause::MaxDelay => "max_delay",
            DebounceCause::Immediate => "immediate",
            DebounceCause::AfterRunning => "after_running",
        };
        f.write_str(s)
    }
}

/// A raw webhook delivery, already parsed by a forge client but not yet
/// matched against configured repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReceived {
    pub forge: String,
    pub repo_full_name: String,
    pub branch: String,
    pub changed_paths: Vec<String>,
}

/// Emitted by the trigger layer or the repo updater; consumed by the debouncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequested {
    pub job_id: Option<String>,
    pub immediate: bool,
    pub reason: String,
    pub repo_url: String,
    pub branch: String,
    pub requested_at: DateTime<Utc>,
}

/// Emitted by the trigger layer; consumed by the repo updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUpdateRequested {
    pub job_id: String,
    pub immediate: bool,
    pub repo_url: String,
    pub branch: String,
    pub requested_at: DateTime<Utc>,
}

/// Emitted by the repo updater after checking remote HEAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUpdated {
    pub job_id: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub changed: bool,
    pub updated_at: DateTime<Utc>,
    pub immediate: bool,
}

/// Emitted by the debouncer at most once per coalesced burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNow {
    pub job_id: String,
    pub triggered_at: DateTime<Utc>,
    pub request_count: u64,
    pub last_reason: String,
    pub last_repo_url: String,
    pub last_branch: String,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub debounce_cause: DebounceCause,
}

/// Emitted by discovery reconciliation when a previously known repository
/// disappears from the forge's repository list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRemoved {
    pub repo_url: String,
    pub repo_name: String,
}

/// The full bus payload taxonomy, for subscribers that want a single typed
/// channel instead of one per event kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DaemonEvent {
    WebhookReceived(WebhookReceived),
    BuildRequested(BuildRequested),
    RepoUpdateRequested(RepoUpdateRequested),
    RepoUpdated(RepoUpdated),
    BuildNow(BuildNow),
    RepoRemoved(RepoRemoved),
}
