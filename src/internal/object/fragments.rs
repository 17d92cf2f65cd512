//! Fragment manifests replace an oversize blob with an ordered list of
//! smaller chunk blobs, so very large files deduplicate at chunk
//! granularity. The canonical body is one `<hex> <size>` line per chunk.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::ObjectTrait;
use crate::internal::object::types::ObjectType;

/// One chunk of a fragmented blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ObjectHash,
    pub size: u64,
}

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Fragments {
    pub id: ObjectHash,
    pub chunks: Vec<Chunk>,
}

impl PartialEq for Fragments {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Fragments {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "fragments {} ({} chunks)", self.id, self.chunks.len())
    }
}

impl Fragments {
    pub fn from_chunks(kind: HashKind, chunks: Vec<Chunk>) -> Result<Fragments, ZetaError> {
        if chunks.is_empty() {
            return Err(ZetaError::malformed("fragments manifest with no chunks"));
        }
        let mut fragments = Fragments {
            id: ObjectHash::zero(kind),
            chunks,
        };
        fragments.id = fragments.object_hash(kind)?;
        Ok(fragments)
    }

    /// Total payload size across all chunks.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

impl ObjectTrait for Fragments {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError> {
        let mut chunks = Vec::new();
        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            let sp = line
                .find_byte(b' ')
                .ok_or_else(|| ZetaError::malformed("fragments line missing size"))?;
            let id = std::str::from_utf8(&line[..sp])
                .map_err(|_| ZetaError::malformed("fragments chunk id is not UTF-8"))?;
            let id = ObjectHash::from_str(id).map_err(ZetaError::Malformed)?;
            let size = std::str::from_utf8(&line[sp + 1..])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ZetaError::malformed("fragments chunk size"))?;
            chunks.push(Chunk { id, size });
        }
        if chunks.is_empty() {
            return Err(ZetaError::malformed("fragments manifest with no chunks"));
        }
        Ok(Fragments { id: hash, chunks })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Fragments
    }

    fn get_size(&self) -> usize {
        self.chunks.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        let mut data = Vec::new();
        for chunk in &self.chunks {
            data.extend(chunk.id.to_string().as_bytes());
            data.push(b' ');
            data.extend(chunk.size.to_string().as_bytes());
            data.push(b'\n');
        }
        Ok(data)
    }
}
