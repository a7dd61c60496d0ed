//! Per-repository quick-hash change classification and the aggregate
//! full/partial decision it feeds to the build pipeline (§4.7).

use std::collections::HashMap;
use std::path::Path;

use docsd_types::{hash_doc_paths, DeltaDecision, RepositoryDescriptor};

use crate::state_store::RepositoryMetadataWriter;

/// Per-repo classification, carried only for observability; the pipeline
/// acts on [`DeltaPlan::changed_repos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoClassification {
    Unknown,
    QuickHashDiff,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPlan {
    pub decision: DeltaDecision,
    pub reason: String,
    pub changed_repos: Vec<String>,
    pub repo_reasons: HashMap<String, String>,
}

/// Walk `docs/` and `documentation/` under `workspace_dir/<repo.name>`,
/// collecting repo-relative paths of `.md`/`.markdown` files (case
/// insensitive), sorted, then hashed with a NUL separator. Deterministic
/// regardless of the OS's directory-walk order.
pub fn compute_quick_hash(repo: &RepositoryDescriptor, workspace_dir: &Path) -> String {
    let repo_root = workspace_dir.join(&repo.name);
    let mut paths = Vec::new();
    for root_name in ["docs", "documentation"] {
        let root = repo_root.join(root_name);
        collect_markdown_paths(&root, &root, &mut paths);
    }
    paths.sort_unstable();
    hash_doc_paths(paths)
}

fn collect_markdown_paths(base: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_markdown_paths(base, &path, out);
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
        if let Ok(relative) = path.strip_prefix(base.parent().unwrap_or(base)) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Classify every repository in `repos` against persisted state, then
/// aggregate into a [`DeltaPlan`].
pub fn analyze(
    repos: &[RepositoryDescriptor],
    metadata: &dyn RepositoryMetadataWriter,
    last_commits: impl Fn(&str) -> Option<String>,
    workspace_dir: Option<&Path>,
) -> DeltaPlan {
    let mut changed = Vec::new();
    let mut reasons = HashMap::new();
    let mut unknown_count = 0usize;

    for repo in repos {
        let persisted_hash = metadata.doc_files_hash(&repo.clone_url);
        let last_commit = last_commits(&repo.clone_url);

        let classification = if persisted_hash.is_none() || last_commit.is_none() {
            if persisted_hash.is_none() && last_commit.is_none() {
                unknown_count += 1;
            }
            RepoClassification::Unknown
        } else if let Some(workspace_dir) = workspace_dir {
            let quick_hash = compute_quick_hash(repo, workspace_dir);
            let stored = persisted_hash.clone().unwrap_or_default();
            if !quick_hash.is_empty() && quick_hash != stored {
                RepoClassification::QuickHashDiff
            } else {
                RepoClassification::Unchanged
            }
        } else {
            RepoClassification::Unchanged
        };

        match classification {
            RepoClassification::Unknown => {
                changed.push(repo.clone_url.clone());
                reasons.insert(repo.clone_url.clone(), "unknown state".to_string());
            }
            RepoClassification::QuickHashDiff => {
                changed.push(repo.clone_url.clone());
                reasons.insert(repo.clone_url.clone(), "quick hash differs from persisted hash".to_string());
            }
            RepoClassification::Unchanged => {}
        }
    }

    if changed.is_empty() {
        return DeltaPlan {
            decision: DeltaDecision::Full,
            reason: "no_detected_repo_change".to_string(),
            changed_repos: vec![],
            repo_reasons: HashMap::new(),
        };
    }

    if changed.len() == repos.len() {
        let reason = if unknown_count == repos.len() {
            "all_repos_unknown_state"
        } else {
            "all_repos_changed"
        };
        return DeltaPlan {
            decision: DeltaDecision::Full,
            reason: reason.to_string(),
            changed_repos: vec![],
            repo_reasons: HashMap::new(),
        };
    }

    DeltaPlan {
        decision: DeltaDecision::Partial,
        reason: "partial_change_subset".to_string(),
        changed_repos: changed,
        repo_reasons: reasons,
    }
}
