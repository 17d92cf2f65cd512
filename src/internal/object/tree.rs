//! Tree objects: the ordered directory listings of the platform.
//!
//! Each entry carries a mode, a unique name, the id of its target and the
//! target's size when it is file-like (regular, executable, symlink,
//! fragments). The canonical body is line oriented:
//!
//! ```text
//! <mode-octal> <hex-id> <size|-> <name>\n
//! ```
//!
//! Entries are sorted byte-wise on the name, with subtree names compared as
//! if suffixed by `/` so a directory `a` and a file `a.txt` order the same
//! way regardless of which level they are expanded at.

use std::cmp::Ordering;
use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

/// Entry modes and their fixed octal tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    Subtree,
    Fragments,
    Submodule,
}

impl EntryMode {
    pub const fn token(&self) -> &'static str {
        match self {
            EntryMode::Regular => "100644",
            EntryMode::Executable => "100755",
            EntryMode::Symlink => "120000",
            EntryMode::Subtree => "40000",
            EntryMode::Submodule => "160000",
            EntryMode::Fragments => "170000",
        }
    }

    pub fn from_token(token: &str) -> Result<EntryMode, ZetaError> {
        match token {
            "100644" => Ok(EntryMode::Regular),
            "100755" => Ok(EntryMode::Executable),
            "120000" => Ok(EntryMode::Symlink),
            "40000" | "040000" => Ok(EntryMode::Subtree),
            "160000" => Ok(EntryMode::Submodule),
            "170000" => Ok(EntryMode::Fragments),
            other => Err(ZetaError::malformed(format!("tree entry mode `{other}`"))),
        }
    }

    /// File-like entries carry a size in the listing.
    pub fn carries_size(&self) -> bool {
        matches!(
            self,
            EntryMode::Regular | EntryMode::Executable | EntryMode::Symlink | EntryMode::Fragments
        )
    }

    pub fn is_subtree(&self) -> bool {
        matches!(self, EntryMode::Subtree)
    }
}

/// One listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub name: String,
    pub id: ObjectHash,
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn new(mode: EntryMode, id: ObjectHash, name: impl Into<String>) -> Self {
        TreeEntry {
            mode,
            name: name.into(),
            id,
            size: None,
        }
    }

    pub fn with_size(mode: EntryMode, id: ObjectHash, name: impl Into<String>, size: u64) -> Self {
        TreeEntry {
            mode,
            name: name.into(),
            id,
            size: Some(size),
        }
    }

    /// Sort key: subtrees compare as `name/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut k = self.name.clone().into_bytes();
        if self.mode.is_subtree() {
            k.push(b'/');
        }
        k
    }
}

/// Canonical entry ordering.
pub fn canonical_cmp(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectHash,
    pub entries: Vec<TreeEntry>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "tree {}", self.id)?;
        for e in &self.entries {
            writeln!(
                f,
                "{} {} {} {}",
                e.mode.token(),
                e.id,
                e.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                e.name
            )?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries: sorts canonically, rejects duplicate or
    /// empty names, and computes the id.
    pub fn from_entries(kind: HashKind, mut entries: Vec<TreeEntry>) -> Result<Tree, ZetaError> {
        for e in &entries {
            if e.name.is_empty() || e.name.contains('\n') || e.name.contains('/') {
                return Err(ZetaError::malformed(format!(
                    "tree entry name `{}`",
                    e.name.escape_default()
                )));
            }
        }
        entries.sort_by(canonical_cmp);
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(ZetaError::malformed(format!(
                    "duplicate tree entry `{}`",
                    pair[0].name
                )));
            }
        }
        let mut tree = Tree {
            id: ObjectHash::zero(kind),
            entries,
        };
        tree.id = tree.object_hash(kind)?;
        Ok(tree)
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError> {
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn_str(4, " ");
            let mode = fields
                .next()
                .and_then(|f| std::str::from_utf8(f).ok())
                .ok_or_else(|| ZetaError::malformed("tree entry missing mode"))?;
            let mode = EntryMode::from_token(mode)?;
            let id = fields
                .next()
                .and_then(|f| std::str::from_utf8(f).ok())
                .ok_or_else(|| ZetaError::malformed("tree entry missing id"))?;
            let id = ObjectHash::from_str(id).map_err(ZetaError::Malformed)?;
            let size = fields
                .next()
                .and_then(|f| std::str::from_utf8(f).ok())
                .ok_or_else(|| ZetaError::malformed("tree entry missing size"))?;
            let size = match size {
                "-" => None,
                n => Some(
                    n.parse::<u64>()
                        .map_err(|e| ZetaError::malformed(format!("tree entry size: {e}")))?,
                ),
            };
            let name = fields
                .next()
                .map(|f| String::from_utf8_lossy(f).to_string())
                .ok_or_else(|| ZetaError::malformed("tree entry missing name"))?;
            if name.is_empty() {
                return Err(ZetaError::malformed("empty tree entry name"));
            }
            entries.push(TreeEntry {
                mode,
                name,
                id,
                size,
            });
        }
        Ok(Tree { id: hash, entries })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn get_size(&self) -> usize {
        self.entries.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        let mut data = Vec::new();
        for e in &self.entries {
            data.extend(e.mode.token().as_bytes());
            data.push(b' ');
            data.extend(e.id.to_string().as_bytes());
            data.push(b' ');
            match e.size {
                Some(s) => data.extend(s.to_string().as_bytes()),
                None => data.push(b'-'),
            }
            data.push(b' ');
            data.extend(e.name.as_bytes());
            data.push(b'\n');
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::object::blob::Blob;

    fn blob_id(content: &str) -> ObjectHash {
        Blob::from_content(HashKind::Sha1, content).id
    }

    fn sample_tree() -> Tree {
        let entries = vec![
            TreeEntry::with_size(EntryMode::Regular, blob_id("b"), "zz.txt", 1),
            TreeEntry::new(EntryMode::Subtree, blob_id("t"), "src"),
            TreeEntry::with_size(EntryMode::Executable, blob_id("x"), "run.sh", 2),
        ];
        Tree::from_entries(HashKind::Sha1, entries).unwrap()
    }

    /// Encode→decode→encode is byte identical and preserves the id.
    #[test]
    fn round_trip_is_identity() {
        let tree = sample_tree();
        let data = tree.to_data().unwrap();
        let back = Tree::from_bytes(&data, tree.id).unwrap();
        assert_eq!(back.to_data().unwrap(), data);
        assert_eq!(back.object_hash(HashKind::Sha1).unwrap(), tree.id);
        assert_eq!(back.entries, tree.entries);
    }

    /// Subtrees sort as `name/`: `src` (dir) orders after `src-old.txt`.
    #[test]
    fn canonical_sort_treats_subtrees_with_slash() {
        let entries = vec![
            TreeEntry::new(EntryMode::Subtree, blob_id("d"), "src"),
            TreeEntry::with_size(EntryMode::Regular, blob_id("f"), "src-old.txt", 3),
            TreeEntry::with_size(EntryMode::Regular, blob_id("g"), "src.txt", 3),
        ];
        let tree = Tree::from_entries(HashKind::Sha1, entries).unwrap();
        let names: Vec<&str> = tree.entries.iter().map(|e| e.name.as_str()).collect();
        // 0x2d '-' < 0x2e '.' < 0x2f '/', so src-old.txt < src.txt < src/
        assert_eq!(names, vec!["src-old.txt", "src.txt", "src"]);
    }

    /// Duplicate names are rejected at construction.
    #[test]
    fn duplicate_names_rejected() {
        let entries = vec![
            TreeEntry::with_size(EntryMode::Regular, blob_id("a"), "a.txt", 1),
            TreeEntry::with_size(EntryMode::Regular, blob_id("b"), "a.txt", 1),
        ];
        let err = Tree::from_entries(HashKind::Sha1, entries).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    /// Names with spaces survive the listing format (name is the last field).
    #[test]
    fn names_with_spaces() {
        let entries = vec![TreeEntry::with_size(
            EntryMode::Regular,
            blob_id("a"),
            "release notes.md",
            9,
        )];
        let tree = Tree::from_entries(HashKind::Sha1, entries).unwrap();
        let back = Tree::from_bytes(&tree.to_data().unwrap(), tree.id).unwrap();
        assert_eq!(back.entries[0].name, "release notes.md");
    }

    /// Fragments entries carry a size and survive round-trip.
    #[test]
    fn fragments_entry_round_trip() {
        let entries = vec![TreeEntry::with_size(
            EntryMode::Fragments,
            blob_id("m"),
            "dataset.bin",
            10_737_418_240,
        )];
        let tree = Tree::from_entries(HashKind::Sha256, entries).unwrap();
        let back = Tree::from_bytes(&tree.to_data().unwrap(), tree.id).unwrap();
        assert_eq!(back.entries[0].mode, EntryMode::Fragments);
        assert_eq!(back.entries[0].size, Some(10_737_418_240));
    }

    /// A bad mode token is malformed, not a panic.
    #[test]
    fn bad_mode_is_malformed() {
        let data = b"100645 8ab686eafeb1f44702738c8b0f24f2567c36da6d 3 x\n";
        let err = Tree::from_bytes(data, ObjectHash::zero(HashKind::Sha1)).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
