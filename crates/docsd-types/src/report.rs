use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const MESSAGE_TRUNCATE_LEN: usize = 500;

/// Final disposition of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Whether a build rebuilt every configured repository or a computed subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaDecision {
    Full,
    Partial,
}

/// Everything the core reads back from a generator invocation, plus the
/// delta/skip metadata the pipeline attaches during post-persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildReport {
    pub outcome: Option<BuildOutcome>,
    pub summary: String,
    pub rendered_pages: u64,
    pub cloned_repositories: Vec<String>,
    pub failed_repositories: Vec<String>,
    pub skipped_repositories: Vec<String>,
    pub static_rendered: u64,
    pub stage_durations: HashMap<String, u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub doc_files_hash: String,
    pub delta_decision: Option<DeltaDecision>,
    pub delta_changed_repos: Vec<String>,
    pub delta_repo_reasons: HashMap<String, String>,
    pub deletions_detected: u64,
}

impl BuildReport {
    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            outcome: Some(BuildOutcome::Skipped),
            summary: summary.into(),
            delta_decision: Some(DeltaDecision::Full),
            ..Default::default()
        }
    }

    /// Push a warning, truncating to [`MESSAGE_TRUNCATE_LEN`] characters with
    /// an ellipsis marker so a single runaway message can't blow out the
    /// persisted report file.
    pub fn push_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(truncate_message(message.into()));
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(truncate_message(message.into()));
    }

    pub fn record_stage(&mut self, stage: impl Into<String>, duration_ms: u64) {
        self.stage_durations.insert(stage.into(), duration_ms);
    }

    /// Deterministic multi-line rendering used for the daemon's completion
    /// log line and for `docsd status`. Field order and wording are fixed so
    /// callers can snapshot-test against it.
    pub fn render_summary(&self) -> String {
        let outcome = match self.outcome {
            Some(BuildOutcome::Completed) => "completed",
            Some(BuildOutcome::Failed) => "failed",
            Some(BuildOutcome::Skipped) => "skipped",
            None => "unknown",
        };
        [
            format!("outcome: {outcome}"),
            format!("summary: {}", self.summary),
            format!("rendered_pages: {}", self.rendered_pages),
            format!("cloned_repositories: {}", self.cloned_repositories.len()),
            format!("failed_repositories: {}", self.failed_repositories.len()),
            format!("skipped_repositories: {}", self.skipped_repositories.len()),
            format!("deletions_detected: {}", self.deletions_detected),
        ]
        .join("\n")
    }
}

fn truncate_message(message: String) -> String {
    if message.chars().count() <= MESSAGE_TRUNCATE_LEN {
        return message;
    }
    let truncated: String = message.chars().take(MESSAGE_TRUNCATE_LEN).collect();
    format!("{truncated}...")
}
