//! Commit objects record one version of the repository: the root tree, the
//! ordered parent list, author and committer stamps, optional extra
//! headers, and the message.
//!
//! The canonical body is the textual header format:
//!
//! ```text
//! tree <hex>
//! parent <hex>            (zero or more)
//! author <signature>
//! committer <signature>
//! <field> <value>         (zero or more extra headers)
//!
//! <message>
//! ```
//!
//! A header value may span lines; continuation lines start with exactly one
//! space which is stripped when joining. Lines inside a continuation are
//! never re-interpreted as headers, which is what keeps embedded objects
//! (mergetag and friends) intact, trailing whitespace included.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::ObjectTrait;
use crate::internal::object::signature::Signature;
use crate::internal::object::types::ObjectType;

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    /// Ordered headers beyond the four standard ones, value joined across
    /// continuation lines.
    pub extra_headers: Vec<(String, String)>,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "commit {}", self.id)?;
        writeln!(f, "tree {}", self.tree_id)?;
        for parent in &self.parent_ids {
            writeln!(f, "parent {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        kind: HashKind,
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_ids: Vec<ObjectHash>,
        message: impl Into<String>,
    ) -> Result<Commit, ZetaError> {
        Self::with_extra_headers(kind, author, committer, tree_id, parent_ids, vec![], message)
    }

    pub fn with_extra_headers(
        kind: HashKind,
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_ids: Vec<ObjectHash>,
        extra_headers: Vec<(String, String)>,
        message: impl Into<String>,
    ) -> Result<Commit, ZetaError> {
        let mut commit = Commit {
            id: ObjectHash::zero(kind),
            tree_id,
            parent_ids,
            author,
            committer,
            extra_headers,
            message: message.into(),
        };
        commit.id = commit.object_hash(kind)?;
        Ok(commit)
    }

    /// Content equality: identical tree, ordered parents, author,
    /// committer, ordered extra headers and message. Ids are derived and
    /// deliberately not consulted.
    pub fn equal(&self, other: &Commit) -> bool {
        self.tree_id == other.tree_id
            && self.parent_ids == other.parent_ids
            && self.author == other.author
            && self.committer == other.committer
            && self.extra_headers == other.extra_headers
            && self.message == other.message
    }

    /// First non-empty message line, used for squash summaries and tag
    /// subjects.
    pub fn subject(&self) -> &str {
        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
    }
}

/// Split a header body into `(field, value)` pairs plus the message,
/// honoring continuation lines. Shared by the commit and tag decoders.
pub(crate) fn parse_headers(data: &[u8]) -> Result<(Vec<(String, Vec<u8>)>, Vec<u8>), ZetaError> {
    let mut headers: Vec<(String, Vec<u8>)> = Vec::new();
    let mut rest = data;

    loop {
        let line_end = rest.find_byte(b'\n');
        let (line, next) = match line_end {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => {
                return Err(ZetaError::malformed(
                    "object body ends inside the header block",
                ));
            }
        };

        if line.is_empty() {
            // Blank separator; the message is everything after it.
            return Ok((headers, next.to_vec()));
        }

        if line[0] == b' ' {
            // Continuation of the previous header, leading space stripped.
            // Trailing whitespace is preserved verbatim.
            let Some(last) = headers.last_mut() else {
                return Err(ZetaError::malformed(
                    "continuation line without a preceding header",
                ));
            };
            last.1.push(b'\n');
            last.1.extend_from_slice(&line[1..]);
        } else {
            let (field, value) = match line.find_byte(b' ') {
                Some(sp) => (&line[..sp], line[sp + 1..].to_vec()),
                None => (line, Vec::new()),
            };
            let field = std::str::from_utf8(field)
                .map_err(|_| ZetaError::malformed("header field is not UTF-8"))?
                .to_string();
            headers.push((field, value));
        }
        rest = next;
    }
}

/// Serialize `(field, value)` pairs, splitting multi-line values back into
/// continuation lines.
pub(crate) fn write_header(data: &mut Vec<u8>, field: &str, value: &[u8]) {
    data.extend(field.as_bytes());
    data.push(b' ');
    let mut first = true;
    for line in value.split(|b| *b == b'\n') {
        if !first {
            data.push(b'\n');
            data.push(b' ');
        }
        data.extend(line);
        first = false;
    }
    data.push(b'\n');
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError> {
        let (headers, message) = parse_headers(data)?;

        let mut tree_id: Option<ObjectHash> = None;
        let mut parent_ids = Vec::new();
        let mut author: Option<Signature> = None;
        let mut committer: Option<Signature> = None;
        let mut extra_headers = Vec::new();

        for (field, value) in headers {
            match field.as_str() {
                "tree" if tree_id.is_none() => {
                    let hex = std::str::from_utf8(&value)
                        .map_err(|_| ZetaError::malformed("tree id is not UTF-8"))?;
                    tree_id = Some(ObjectHash::from_str(hex).map_err(ZetaError::Malformed)?);
                }
                "tree" => return Err(ZetaError::malformed("duplicate tree header")),
                "parent" => {
                    let hex = std::str::from_utf8(&value)
                        .map_err(|_| ZetaError::malformed("parent id is not UTF-8"))?;
                    parent_ids.push(ObjectHash::from_str(hex).map_err(ZetaError::Malformed)?);
                }
                "author" if author.is_none() => {
                    author = Some(Signature::from_value(&value)?);
                }
                "committer" if committer.is_none() => {
                    committer = Some(Signature::from_value(&value)?);
                }
                _ => {
                    let value = String::from_utf8_lossy(&value).to_string();
                    extra_headers.push((field, value));
                }
            }
        }

        let tree_id = tree_id.ok_or_else(|| ZetaError::malformed("commit is missing tree"))?;
        let author = author.ok_or_else(|| ZetaError::malformed("commit is missing author"))?;
        let committer =
            committer.ok_or_else(|| ZetaError::malformed("commit is missing committer"))?;

        Ok(Commit {
            id: hash,
            tree_id,
            parent_ids,
            author,
            committer,
            extra_headers,
            message: String::from_utf8_lossy(&message).to_string(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn get_size(&self) -> usize {
        self.message.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        let mut data = Vec::new();

        write_header(&mut data, "tree", self.tree_id.to_string().as_bytes());
        for parent in &self.parent_ids {
            write_header(&mut data, "parent", parent.to_string().as_bytes());
        }
        write_header(&mut data, "author", &self.author.to_value());
        write_header(&mut data, "committer", &self.committer.to_value());
        for (field, value) in &self.extra_headers {
            write_header(&mut data, field, value.as_bytes());
        }
        data.push(b'\n');
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str) -> Signature {
        Signature::new(name, format!("{name}@zeta.dev"), 1699000000)
    }

    fn tree_hash() -> ObjectHash {
        ObjectHash::from_str("341e54913a3a43069f2927cc0f703e5a9f730df1").unwrap()
    }

    fn basic_commit() -> Commit {
        Commit::new(
            HashKind::Sha1,
            sig("ada"),
            sig("grace"),
            tree_hash(),
            vec![],
            "initial import\n",
        )
        .unwrap()
    }

    /// decode(encode(c)) reproduces every field and the id.
    #[test]
    fn round_trip_is_identity() {
        let c = Commit::with_extra_headers(
            HashKind::Sha1,
            sig("ada"),
            sig("grace"),
            tree_hash(),
            vec![tree_hash()],
            vec![("encoding".into(), "UTF-8".into())],
            "subject\n\nbody text\n",
        )
        .unwrap();
        let data = c.to_data().unwrap();
        let back = Commit::from_bytes(&data, c.id).unwrap();
        assert!(c.equal(&back));
        assert_eq!(back.to_data().unwrap(), data);
        assert_eq!(back.object_hash(HashKind::Sha1).unwrap(), c.id);
    }

    /// Multi-line extra headers round-trip with trailing whitespace kept.
    #[test]
    fn continuation_preserves_embedded_object() {
        let mergetag = "object 9c7f7d3e\ntype commit\ntag v1.0\n\nrelease  ";
        let c = Commit::with_extra_headers(
            HashKind::Sha1,
            sig("ada"),
            sig("grace"),
            tree_hash(),
            vec![],
            vec![("mergetag".into(), mergetag.into())],
            "Merge tag 'v1.0'\n",
        )
        .unwrap();
        let data = c.to_data().unwrap();
        // Every embedded line is prefixed with exactly one space on the wire.
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.contains("\n type commit\n"));
        let back = Commit::from_bytes(&data, c.id).unwrap();
        assert_eq!(back.extra_headers[0].1, mergetag);
    }

    /// Lines that look like headers inside a continuation stay joined.
    #[test]
    fn header_lookalikes_in_continuation() {
        let raw = b"tree 341e54913a3a43069f2927cc0f703e5a9f730df1\n\
author a <a@z> 1 +0000\n\
committer c <c@z> 1 +0000\n\
note first\n tree is not a header here\n\
\n\
msg";
        let c = Commit::from_bytes(raw, ObjectHash::zero(HashKind::Sha1)).unwrap();
        assert_eq!(c.extra_headers.len(), 1);
        assert_eq!(c.extra_headers[0].0, "note");
        assert_eq!(c.extra_headers[0].1, "first\ntree is not a header here");
    }

    /// A continuation line with no preceding header is malformed, not a
    /// crash.
    #[test]
    fn orphan_continuation_is_malformed() {
        let raw = b" floating continuation\n\nmsg";
        let err = Commit::from_bytes(raw, ObjectHash::zero(HashKind::Sha1)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    /// Missing tree is rejected.
    #[test]
    fn missing_tree_is_malformed() {
        let raw = b"author a <a@z> 1 +0000\ncommitter c <c@z> 1 +0000\n\nmsg";
        let err = Commit::from_bytes(raw, ObjectHash::zero(HashKind::Sha1)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    /// Empty author and committer values are accepted.
    #[test]
    fn empty_signatures_accepted() {
        let raw = b"tree 341e54913a3a43069f2927cc0f703e5a9f730df1\n\
author\n\
committer\n\
\n\
msg";
        let c = Commit::from_bytes(raw, ObjectHash::zero(HashKind::Sha1)).unwrap();
        assert!(c.author.is_empty());
        assert!(c.committer.is_empty());
    }

    /// Octopus merges: an arbitrary number of parents is fine.
    #[test]
    fn many_parents() {
        let parents: Vec<ObjectHash> = (0..40)
            .map(|i| {
                ObjectHash::new(HashKind::Sha1, format!("parent-{i}").as_bytes())
            })
            .collect();
        let c = Commit::new(
            HashKind::Sha1,
            sig("ada"),
            sig("grace"),
            tree_hash(),
            parents.clone(),
            "octopus\n",
        )
        .unwrap();
        let back = Commit::from_bytes(&c.to_data().unwrap(), c.id).unwrap();
        assert_eq!(back.parent_ids, parents);
    }

    /// Messages larger than 10 MiB decode without truncation.
    #[test]
    fn oversized_message_accepted() {
        let message = "x".repeat(10 * 1024 * 1024 + 17);
        let c = Commit::new(
            HashKind::Sha256,
            sig("ada"),
            sig("grace"),
            ObjectHash::new(HashKind::Sha256, b"t"),
            vec![],
            message.clone(),
        )
        .unwrap();
        let back = Commit::from_bytes(&c.to_data().unwrap(), c.id).unwrap();
        assert_eq!(back.message.len(), message.len());
    }

    /// Equality discriminates on every field; identical content is equal.
    #[test]
    fn equality_discrimination() {
        let base = basic_commit();
        let same = basic_commit();
        assert!(base.equal(&same));

        let mut other = basic_commit();
        other.message = "different\n".into();
        assert!(!base.equal(&other));

        let mut other = basic_commit();
        other.parent_ids = vec![tree_hash()];
        assert!(!base.equal(&other));

        let mut other = basic_commit();
        other.author = sig("grace");
        assert!(!base.equal(&other));

        let mut other = basic_commit();
        other.extra_headers = vec![("encoding".into(), "latin1".into())];
        assert!(!base.equal(&other));
    }

    /// subject() returns the first non-empty line.
    #[test]
    fn subject_extraction() {
        let mut c = basic_commit();
        c.message = "\n\nfix: the thing\n\ndetails\n".into();
        assert_eq!(c.subject(), "fix: the thing");
    }
}
