//! Default [`RemoteHeadChecker`] implementation (§4.3): shells out to
//! `git ls-remote <clone_url> <branch>` under a bounded timeout.
//!
//! A forge API client could answer the same question without a network
//! round trip to the repo's own host, but `git ls-remote` works against any
//! remote regardless of which forge fronts it, so it is the default every
//! embedder gets without configuring one.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use docsd_types::RepositoryDescriptor;
use tokio::process::Command;

use crate::repo_updater::{RemoteHeadChecker, RemoteHeadResult};

/// Non-zero exit or a timeout is retryable (the repo updater wraps every
/// `check` in [`docsd_retry::AsyncRetryExecutor`]); a recognizable auth
/// failure is not, since retrying it burns the backoff budget for nothing.
#[derive(Debug, thiserror::Error)]
pub enum GitRemoteError {
    #[error("git ls-remote timed out after {0:?}")]
    Timeout(Duration),
    #[error("git ls-remote exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("authentication failed for {url}")]
    AuthFailed { url: String },
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git ls-remote produced no matching ref for branch {0}")]
    NoSuchBranch(String),
}

impl GitRemoteError {
    /// Auth failures are permanent; everything else here is worth retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, GitRemoteError::AuthFailed { .. })
    }
}

pub struct GitRemoteHeadChecker {
    timeout: Duration,
}

impl GitRemoteHeadChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GitRemoteHeadChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl RemoteHeadChecker for GitRemoteHeadChecker {
    async fn check(
        &self,
        repo: &RepositoryDescriptor,
        branch: &str,
        cached_sha: Option<&str>,
    ) -> anyhow::Result<RemoteHeadResult> {
        let sha = ls_remote_head(&repo.clone_url, branch, self.timeout).await?;
        Ok(RemoteHeadResult {
            changed: cached_sha != Some(sha.as_str()),
            commit_sha: sha,
        })
    }
}

async fn ls_remote_head(clone_url: &str, branch: &str, timeout: Duration) -> Result<String, GitRemoteError> {
    let refspec = format!("refs/heads/{branch}");
    let mut command = Command::new("git");
    command
        .arg("ls-remote")
        .arg("--exit-code")
        .arg(clone_url)
        .arg(&refspec)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result?,
        Err(_) => return Err(GitRemoteError::Timeout(timeout)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if looks_like_auth_failure(&stderr) {
            return Err(GitRemoteError::AuthFailed {
                url: clone_url.to_string(),
            });
        }
        return Err(GitRemoteError::NonZeroExit {
            code: output.status.code(),
            stderr,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let sha = parts.next()?;
            let ref_name = parts.next()?;
            (ref_name == refspec).then(|| sha.to_string())
        })
        .ok_or_else(|| GitRemoteError::NoSuchBranch(branch.to_string()))
}

fn looks_like_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("fatal: could not read password")
}
