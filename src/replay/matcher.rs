//! Matchers deciding which tree entries a Drop pass removes.

use std::collections::HashSet;

use crate::internal::object::tree::TreeEntry;

/// Decides whether an entry at an absolute repo path is dropped.
pub trait DropMatcher: Send + Sync {
    fn matches(&self, entry: &TreeEntry, abs_path: &str) -> bool;
}

/// Drops exact paths. Naming a directory drops its whole subtree, since
/// the subtree entry itself matches. The empty set matches nothing, which
/// makes `Drop` with no paths a whole-history no-op.
#[derive(Debug, Default)]
pub struct PathSetMatcher {
    paths: HashSet<String>,
}

impl PathSetMatcher {
    pub fn new<I, T>(paths: I) -> PathSetMatcher
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        PathSetMatcher {
            paths: paths
                .into_iter()
                .map(|p| p.into().trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl DropMatcher for PathSetMatcher {
    fn matches(&self, _entry: &TreeEntry, abs_path: &str) -> bool {
        self.paths.contains(abs_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, ObjectHash};
    use crate::internal::object::tree::EntryMode;

    fn entry(name: &str) -> TreeEntry {
        TreeEntry::new(
            EntryMode::Regular,
            ObjectHash::new(HashKind::Sha1, name.as_bytes()),
            name,
        )
    }

    /// Exact paths match; unrelated and partial paths do not.
    #[test]
    fn exact_path_matching() {
        let m = PathSetMatcher::new(["a/b/c.txt", "vendor"]);
        assert!(m.matches(&entry("c.txt"), "a/b/c.txt"));
        assert!(m.matches(&entry("vendor"), "vendor"));
        assert!(!m.matches(&entry("c.txt"), "a/b/c.txt.bak"));
        assert!(!m.matches(&entry("b"), "a/b"));
    }

    /// The empty matcher matches nothing at all.
    #[test]
    fn empty_matches_nothing() {
        let m = PathSetMatcher::new(Vec::<String>::new());
        assert!(m.is_empty());
        assert!(!m.matches(&entry("x"), "x"));
    }

    /// Slash noise in configured paths is normalized.
    #[test]
    fn trims_slashes() {
        let m = PathSetMatcher::new(["/docs/readme.md/"]);
        assert!(m.matches(&entry("readme.md"), "docs/readme.md"));
    }
}
