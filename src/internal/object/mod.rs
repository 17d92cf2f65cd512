//! Object model definitions for blobs, trees, commits, tags and fragment
//! manifests, plus the trait that lets the pack and storage layers create
//! strongly typed values from raw bytes.

pub mod blob;
pub mod commit;
pub mod fragments;
pub mod signature;
pub mod tag;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{
    errors::ZetaError,
    hash::{HashKind, ObjectHash},
    internal::object::types::ObjectType,
};

/// Common interface for all object kinds.
///
/// `to_data` produces the canonical body; the object id is the hash of
/// `"<kind> <len>\0" + body`, so round-trip decode→encode is byte identical
/// for well-formed inputs.
pub trait ObjectTrait: Send + Sync + Display {
    /// Parse a canonical body into an object carrying the given id.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError>
    where
        Self: Sized;

    /// Returns the kind of the object.
    fn get_type(&self) -> ObjectType;

    /// Body size in bytes.
    fn get_size(&self) -> usize;

    /// Serialize the canonical body.
    fn to_data(&self) -> Result<Vec<u8>, ZetaError>;

    /// Compute the object id from the canonical form.
    fn object_hash(&self, kind: HashKind) -> Result<ObjectHash, ZetaError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(kind, self.get_type(), &data))
    }
}

/// A parsed object of any kind, used where callers dispatch dynamically.
#[derive(Debug, Clone)]
pub enum AnyObject {
    Blob(blob::Blob),
    Tree(tree::Tree),
    Commit(commit::Commit),
    Tag(tag::Tag),
    Fragments(fragments::Fragments),
}

impl AnyObject {
    pub fn kind(&self) -> ObjectType {
        match self {
            AnyObject::Blob(_) => ObjectType::Blob,
            AnyObject::Tree(_) => ObjectType::Tree,
            AnyObject::Commit(_) => ObjectType::Commit,
            AnyObject::Tag(_) => ObjectType::Tag,
            AnyObject::Fragments(_) => ObjectType::Fragments,
        }
    }

    pub fn id(&self) -> ObjectHash {
        match self {
            AnyObject::Blob(o) => o.id,
            AnyObject::Tree(o) => o.id,
            AnyObject::Commit(o) => o.id,
            AnyObject::Tag(o) => o.id,
            AnyObject::Fragments(o) => o.id,
        }
    }

    /// Parse a body of a known kind.
    pub fn parse(kind: ObjectType, data: &[u8], hash: ObjectHash) -> Result<AnyObject, ZetaError> {
        Ok(match kind {
            ObjectType::Blob => AnyObject::Blob(blob::Blob::from_bytes(data, hash)?),
            ObjectType::Tree => AnyObject::Tree(tree::Tree::from_bytes(data, hash)?),
            ObjectType::Commit => AnyObject::Commit(commit::Commit::from_bytes(data, hash)?),
            ObjectType::Tag => AnyObject::Tag(tag::Tag::from_bytes(data, hash)?),
            ObjectType::Fragments => {
                AnyObject::Fragments(fragments::Fragments::from_bytes(data, hash)?)
            }
        })
    }

    /// Parse a canonical form with its `"<kind> <len>\0"` prefix, verifying
    /// the declared length.
    pub fn parse_canonical(data: &[u8], hash_kind: HashKind) -> Result<AnyObject, ZetaError> {
        let nul = data
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ZetaError::malformed("object header missing NUL"))?;
        let header = &data[..nul];
        let sp = header
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| ZetaError::malformed("object header missing space"))?;
        let kind = ObjectType::from_token(&header[..sp])?;
        let declared: usize = std::str::from_utf8(&header[sp + 1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ZetaError::malformed("object header length"))?;
        let body = &data[nul + 1..];
        if body.len() != declared {
            return Err(ZetaError::malformed(format!(
                "object header declares {declared} bytes, body has {}",
                body.len()
            )));
        }
        let id = ObjectHash::new(hash_kind, data);
        AnyObject::parse(kind, body, id)
    }

    pub fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        match self {
            AnyObject::Blob(o) => o.to_data(),
            AnyObject::Tree(o) => o.to_data(),
            AnyObject::Commit(o) => o.to_data(),
            AnyObject::Tag(o) => o.to_data(),
            AnyObject::Fragments(o) => o.to_data(),
        }
    }

    /// Serialize the full canonical form including the type/length prefix.
    pub fn to_canonical(&self) -> Result<Vec<u8>, ZetaError> {
        let body = self.to_data()?;
        let mut out = Vec::with_capacity(body.len() + 16);
        out.extend(self.kind().to_bytes());
        out.push(b' ');
        out.extend(body.len().to_string().as_bytes());
        out.push(0);
        out.extend(body);
        Ok(out)
    }
}
