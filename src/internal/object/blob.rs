//! Blob objects hold opaque file contents. Large blob payloads are
//! streamed through the storage layer; this parsed form only exists for
//! contents small enough to sit in memory (pack batches, tests, symlink
//! targets and similar).

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "blob {} ({} bytes)", self.id, self.data.len())
    }
}

impl Blob {
    /// Build a blob from in-memory content, computing its id.
    pub fn from_content(kind: HashKind, content: impl AsRef<[u8]>) -> Blob {
        let data = content.as_ref().to_vec();
        let id = ObjectHash::from_type_and_data(kind, ObjectType::Blob, &data);
        Blob { id, data }
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError> {
        Ok(Blob {
            id: hash,
            data: data.to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn get_size(&self) -> usize {
        self.data.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Blob ids are stable across construction paths.
    #[test]
    fn content_hash_is_stable() {
        let a = Blob::from_content(HashKind::Sha1, "hello");
        let b = Blob::from_bytes(b"hello", a.id).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.object_hash(HashKind::Sha1).unwrap(), a.id);
    }

    /// Different content yields different ids.
    #[test]
    fn content_discriminates() {
        let a = Blob::from_content(HashKind::Sha256, "hello");
        let b = Blob::from_content(HashKind::Sha256, "hello!");
        assert_ne!(a.id, b.id);
    }
}
