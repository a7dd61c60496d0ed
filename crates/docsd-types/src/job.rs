use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a build job was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Manual,
    Scheduled,
    Webhook,
}

/// Worker-pull priority. Manual builds are `High`; everything else is `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Normal,
    High,
}

/// Lifecycle status of a queued build job.
///
/// Jobs carry no retry state: the queue is in-memory only, and a process
/// restart simply drops whatever was `Pending` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Immutable point-in-time copy of a queued job's observable state, returned
/// by the queue's snapshot lookup. Carries no handles, so it is safe to hand
/// to observability code that outlives the job itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable reason per repository URL, populated by the webhook
    /// path and the debouncer so a build report can explain why each repo
    /// was selected.
    pub repo_reasons: HashMap<String, String>,
}

impl JobSnapshot {
    pub fn new(id: impl Into<String>, job_type: JobType, priority: JobPriority) -> Self {
        Self {
            id: id.into(),
            job_type,
            priority,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            repo_reasons: HashMap::new(),
        }
    }
}
