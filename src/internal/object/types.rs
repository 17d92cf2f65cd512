//! Object kind enumeration shared by the object model, the pack codec and
//! the object database.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;

/// The five object kinds of the platform.
///
/// * `Blob`: opaque byte sequence with a length; contents are streamed.
/// * `Tree`: ordered directory listing of `(mode, name, hash, size)` entries.
/// * `Commit`: parents, tree, signatures, extra headers and a message.
/// * `Tag`: an annotated tag with its own id, tagger and message.
/// * `Fragments`: manifest splitting an oversize blob into ordered chunks,
///   enabling deduplicated storage of very large files.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
    Tag,
    Fragments,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";
const FRAGMENTS_OBJECT_TYPE: &[u8] = b"fragments";

impl Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::Fragments => write!(f, "fragments"),
        }
    }
}

impl ObjectType {
    /// The canonical-form header token for this kind.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Blob => BLOB_OBJECT_TYPE,
            ObjectType::Tag => TAG_OBJECT_TYPE,
            ObjectType::Fragments => FRAGMENTS_OBJECT_TYPE,
        }
    }

    /// Parse a header token back into a kind.
    pub fn from_token(token: &[u8]) -> Result<ObjectType, ZetaError> {
        match token {
            COMMIT_OBJECT_TYPE => Ok(ObjectType::Commit),
            TREE_OBJECT_TYPE => Ok(ObjectType::Tree),
            BLOB_OBJECT_TYPE => Ok(ObjectType::Blob),
            TAG_OBJECT_TYPE => Ok(ObjectType::Tag),
            FRAGMENTS_OBJECT_TYPE => Ok(ObjectType::Fragments),
            other => Err(ZetaError::malformed(format!(
                "`{}` is not a valid object type",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Kinds carried in the metadata stream (everything except blobs).
    pub fn is_metadata(&self) -> bool {
        !matches!(self, ObjectType::Blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Token round-trip covers all five kinds; garbage is rejected.
    #[test]
    fn token_round_trip() {
        for t in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
            ObjectType::Fragments,
        ] {
            assert_eq!(ObjectType::from_token(t.to_bytes()).unwrap(), t);
        }
        assert!(ObjectType::from_token(b"branch").is_err());
    }

    /// Only blobs travel on the object stream.
    #[test]
    fn metadata_partition() {
        assert!(!ObjectType::Blob.is_metadata());
        assert!(ObjectType::Fragments.is_metadata());
        assert!(ObjectType::Commit.is_metadata());
    }
}
