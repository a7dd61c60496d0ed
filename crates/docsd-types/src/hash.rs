//! Content-addressed hashing for doc file path sets.
//!
//! The daemon decides whether a build can be skipped by comparing the hash of
//! the current doc-relevant file list against the hash recorded for the last
//! successful build. Paths are sorted and NUL-joined before hashing so the
//! result only depends on the set of paths, never on directory walk order.

use sha2::{Digest, Sha256};

/// Hash a collection of repo-relative doc file paths into a stable hex digest.
///
/// Input order does not matter: paths are sorted before hashing. Duplicate
/// paths are hashed as given (callers are expected to de-duplicate upstream
/// if that matters for their use case).
pub fn hash_doc_paths<I, S>(paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = paths.into_iter().map(|p| p.as_ref().to_string()).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for (i, path) in sorted.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(path.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Hash arbitrary byte content (used for quick per-file change detection
/// ahead of a full delta analysis pass).
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
