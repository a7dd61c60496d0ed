//! Persisted `(repo_url, branch) -> commit_sha` cache consumed by the repo
//! updater so a webhook with an unchanged remote HEAD never triggers a
//! build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct CacheKey {
    repo_url: String,
    branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub commit_sha: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    entries: Vec<(CacheKey, CacheEntry)>,
}

/// In-memory remote-head cache with optional disk persistence.
///
/// Invariant: a write only replaces an existing entry if its `observed_at`
/// is strictly more recent, so an out-of-order retry response can never
/// regress a fresher observation.
#[derive(Debug, Default)]
pub struct RemoteHeadCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl RemoteHeadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let doc: Option<CacheDocument> = persist::load_json_lenient(path);
        let entries = doc
            .map(|d| d.entries.into_iter().collect())
            .unwrap_or_default();
        Self { entries }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let doc = CacheDocument {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        persist::atomic_write(path, &bytes)
    }

    pub fn get(&self, repo_url: &str, branch: &str) -> Option<&CacheEntry> {
        self.entries.get(&CacheKey {
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Record an observation, replacing any prior entry only if
    /// `observed_at` is strictly newer.
    pub fn record(&mut self, repo_url: &str, branch: &str, commit_sha: String, observed_at: DateTime<Utc>) {
        let key = CacheKey {
            repo_url: repo_url.to_string(),
            branch: branch.to_string(),
        };
        match self.entries.get(&key) {
            Some(existing) if existing.observed_at >= observed_at => {}
            _ => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        commit_sha,
                        observed_at,
                    },
                );
            }
        }
    }

    /// Remove every entry for `repo_url`, regardless of branch. Used by
    /// `RepoRemoved` handling.
    pub fn remove_repo(&mut self, repo_url: &str) {
        self.entries.retain(|k, _| k.repo_url != repo_url);
    }
}

/// Default on-disk location next to the daemon state file.
pub fn default_cache_path(state_dir: &Path) -> PathBuf {
    state_dir.join("remote-head-cache.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn later_observation_replaces_earlier() {
        let mut cache = RemoteHeadCache::new();
        let t0 = Utc::now();
        cache.record("url", "main", "sha1".to_string(), t0);
        cache.record("url", "main", "sha2".to_string(), t0 + Duration::seconds(1));
        assert_eq!(cache.get("url", "main").unwrap().commit_sha, "sha2");
    }

    #[test]
    fn out_of_order_observation_is_rejected() {
        let mut cache = RemoteHeadCache::new();
        let t0 = Utc::now();
        cache.record("url", "main", "sha2".to_string(), t0 + Duration::seconds(1));
        cache.record("url", "main", "sha1-stale".to_string(), t0);
        assert_eq!(cache.get("url", "main").unwrap().commit_sha, "sha2");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = RemoteHeadCache::new();
        cache.record("url", "main", "sha1".to_string(), Utc::now());
        cache.save(&path).unwrap();

        let loaded = RemoteHeadCache::load(&path);
        assert_eq!(loaded.get("url", "main").unwrap().commit_sha, "sha1");
    }

    #[test]
    fn remove_repo_drops_all_branches() {
        let mut cache = RemoteHeadCache::new();
        cache.record("url", "main", "sha1".to_string(), Utc::now());
        cache.record("url", "dev", "sha2".to_string(), Utc::now());
        cache.remove_repo("url");
        assert!(cache.get("url", "main").is_none());
        assert!(cache.get("url", "dev").is_none());
    }
}
