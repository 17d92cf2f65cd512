//! Sparse matcher: a prefix trie over `/`-separated path segments that
//! gates subtree descent during tree walks. An empty path set behaves like
//! a full walk.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
}

/// Trie built once per request from the client's path list.
#[derive(Debug, Default)]
pub struct SparseMatcher {
    root: Node,
}

impl SparseMatcher {
    /// Build from repo-relative paths. Empty segments (doubled or leading
    /// slashes) are ignored; an empty iterator yields a match-all matcher.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = Node::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.as_ref().split('/').filter(|s| !s.is_empty()) {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        SparseMatcher { root }
    }

    pub fn is_match_all(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Cursor for the repository root.
    pub fn cursor(&self) -> SparseCursor<'_> {
        if self.is_match_all() {
            SparseCursor { node: None }
        } else {
            SparseCursor {
                node: Some(&self.root),
            }
        }
    }
}

/// Position inside the trie while a tree walk descends. A cursor with no
/// node includes everything below it (empty path set, or the walk passed
/// the end of a configured path).
#[derive(Debug, Clone, Copy)]
pub struct SparseCursor<'a> {
    node: Option<&'a Node>,
}

impl<'a> SparseCursor<'a> {
    /// Whether everything below this point is included.
    pub fn is_match_all(&self) -> bool {
        self.node.is_none()
    }

    /// Whether to descend into the entry named `name`, and the cursor to
    /// carry into it. `None` means the subtree is pruned.
    pub fn descend(&self, name: &str) -> Option<SparseCursor<'a>> {
        let Some(node) = self.node else {
            return Some(SparseCursor { node: None });
        };
        let child = node.children.get(name)?;
        if child.children.is_empty() {
            // End of a configured path: include the whole subtree.
            Some(SparseCursor { node: None })
        } else {
            Some(SparseCursor { node: Some(child) })
        }
    }

    /// Whether a leaf entry (blob, fragments) named `name` is selected.
    pub fn selects(&self, name: &str) -> bool {
        match self.node {
            None => true,
            Some(node) => node.children.contains_key(name),
        }
    }
}
