use serde::{Deserialize, Serialize};

fn default_doc_paths() -> Vec<String> {
    vec!["docs".to_string(), "documentation".to_string()]
}

/// A configured or discovered source repository.
///
/// Loaded from configuration or produced by forge discovery; the core never
/// mutates a descriptor once it has been handed to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Path segment used both for the workspace clone directory and (with an
    /// optional namespace prefix) the generated content tree.
    pub name: String,
    pub clone_url: String,
    pub branch: String,
    #[serde(default = "default_doc_paths")]
    pub doc_paths: Vec<String>,
}

impl RepositoryDescriptor {
    pub fn new(
        name: impl Into<String>,
        clone_url: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            clone_url: clone_url.into(),
            branch: branch.into(),
            doc_paths: default_doc_paths(),
        }
    }

    /// Does `path` fall under one of this repository's configured doc roots?
    pub fn matches_doc_path(&self, path: &str) -> bool {
        self.doc_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_doc_paths_when_absent() {
        let json = r#"{"name":"repo","clone_url":"https://example.com/repo.git","branch":"main"}"#;
        let repo: RepositoryDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(repo.doc_paths, vec!["docs", "documentation"]);
    }

    #[test]
    fn matches_doc_path_prefix() {
        let repo = RepositoryDescriptor::new("repo", "url", "main");
        assert!(repo.matches_doc_path("docs/intro.md"));
        assert!(!repo.matches_doc_path("src/main.rs"));
    }
}
