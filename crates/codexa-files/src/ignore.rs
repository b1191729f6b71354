//! Noise filter for paths that should not be synced or eagerly listed.

use std::collections::HashSet;

/// Directory names skipped by default.
pub fn default_ignored_dirs() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "__pycache__",
        ".cache",
        "target",
        ".venv",
        "venv",
        "dist",
        "build",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    dirs: HashSet<String>,
    /// Skip every dot-file and dot-directory.
    skip_hidden: bool,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(default_ignored_dirs(), true)
    }
}

impl IgnoreRules {
    pub fn new(dirs: impl IntoIterator<Item = String>, skip_hidden: bool) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
            skip_hidden,
        }
    }

    /// Whether a single path segment is noise.
    pub fn is_ignored_name(&self, name: &str) -> bool {
        (self.skip_hidden && name.starts_with('.')) || self.dirs.contains(name)
    }

    /// Whether any segment of a relative path is noise.
    pub fn is_ignored(&self, rel: &str) -> bool {
        rel.split('/')
            .filter(|s| !s.is_empty())
            .any(|segment| self.is_ignored_name(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_and_dependency_paths_are_ignored() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored(".git/HEAD"));
        assert!(rules.is_ignored("web/node_modules/react/index.js"));
        assert!(rules.is_ignored("src/.env"));
        assert!(!rules.is_ignored("src/main.rs"));
        assert!(!rules.is_ignored(""));
    }

    #[test]
    fn hidden_files_can_be_allowed() {
        let rules = IgnoreRules::new(vec!["target".to_string()], false);
        assert!(!rules.is_ignored(".env"));
        assert!(rules.is_ignored("target/debug/app"));
    }
}
