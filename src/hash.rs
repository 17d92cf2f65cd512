//! Content-addressed identifiers with selectable algorithms (SHA-1 and
//! SHA-256). The algorithm is a property of the repository and is passed
//! explicitly wherever bytes are turned into ids; hex forms are accepted on
//! the wire, byte forms are used internally. The all-zero value denotes
//! "no such object / create" in protocol commands.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::internal::object::types::ObjectType;

/// Supported hash algorithms for object ids (selector only, no data).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    /// Byte length of the hash output.
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    /// Hex string length of the hash output.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }

    /// Lowercase name of the hash algorithm.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err(format!("unknown hash kind `{s}`")),
        }
    }
}

/// Concrete object id carrying the bytes for the selected algorithm.
///
/// Supports conversion to/from hex strings, byte slices, and stream
/// reading. Ordering and hashing are derived so ids can key maps and sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum ObjectHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Default for ObjectHash {
    fn default() -> Self {
        ObjectHash::Sha1([0u8; 20])
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            ObjectHash::Sha1(bytes) => bytes.as_slice(),
            ObjectHash::Sha256(bytes) => bytes.as_slice(),
        }
    }
}

/// Parse hex (40 chars for SHA-1, 64 for SHA-256) into an `ObjectHash`.
/// The algorithm is inferred from the length.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => {
                let mut h = [0u8; 20];
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                h.copy_from_slice(bytes.as_slice());
                Ok(ObjectHash::Sha1(h))
            }
            64 => {
                let mut h = [0u8; 32];
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                h.copy_from_slice(bytes.as_slice());
                Ok(ObjectHash::Sha256(h))
            }
            _ => Err(format!("invalid hash length {}", s.len())),
        }
    }
}

impl ObjectHash {
    /// All-zero id for a given hash kind ("no such object / create").
    pub const fn zero(kind: HashKind) -> ObjectHash {
        match kind {
            HashKind::Sha1 => ObjectHash::Sha1([0u8; 20]),
            HashKind::Sha256 => ObjectHash::Sha256([0u8; 32]),
        }
    }

    /// Zero-filled hex string for a given hash kind.
    pub fn zero_str(kind: HashKind) -> String {
        "0".repeat(kind.hex_len())
    }

    /// True when this is the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.as_ref().iter().all(|b| *b == 0)
    }

    /// Return the hash kind for this value.
    pub fn kind(&self) -> HashKind {
        match self {
            ObjectHash::Sha1(_) => HashKind::Sha1,
            ObjectHash::Sha256(_) => HashKind::Sha256,
        }
    }

    /// Return the hash size in bytes.
    pub fn size(&self) -> usize {
        self.kind().size()
    }

    /// Compute the hash of raw data with the given algorithm.
    pub fn new(kind: HashKind, data: &[u8]) -> ObjectHash {
        match kind {
            HashKind::Sha1 => {
                let h = sha1::Sha1::digest(data);
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(h.as_ref());
                ObjectHash::Sha1(bytes)
            }
            HashKind::Sha256 => {
                let h = sha2::Sha256::digest(data);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(h.as_ref());
                ObjectHash::Sha256(bytes)
            }
        }
    }

    /// Hash an object's canonical form: `"<kind> <len>\0"` + body.
    pub fn from_type_and_data(kind: HashKind, object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut d: Vec<u8> = Vec::with_capacity(data.len() + 16);
        d.extend(object_type.to_bytes());
        d.push(b' ');
        d.extend(data.len().to_string().as_bytes());
        d.push(b'\x00');
        d.extend(data);
        ObjectHash::new(kind, &d)
    }

    /// Create an `ObjectHash` from raw bytes matching the algorithm's size.
    pub fn from_bytes(kind: HashKind, bytes: &[u8]) -> Result<ObjectHash, String> {
        if bytes.len() != kind.size() {
            return Err(format!(
                "invalid byte length: got {}, expected {}",
                bytes.len(),
                kind.size()
            ));
        }
        match kind {
            HashKind::Sha1 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(bytes);
                Ok(ObjectHash::Sha1(h))
            }
            HashKind::Sha256 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(bytes);
                Ok(ObjectHash::Sha256(h))
            }
        }
    }

    /// Read hash bytes from a stream according to the algorithm's size.
    pub fn from_stream(kind: HashKind, data: &mut impl io::Read) -> io::Result<ObjectHash> {
        match kind {
            HashKind::Sha1 => {
                let mut h = [0u8; 20];
                data.read_exact(&mut h)?;
                Ok(ObjectHash::Sha1(h))
            }
            HashKind::Sha256 => {
                let mut h = [0u8; 32];
                data.read_exact(&mut h)?;
                Ok(ObjectHash::Sha256(h))
            }
        }
    }

    /// Return raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

/// Incremental hasher matching [`ObjectHash::new`], for streamed content.
#[derive(Clone)]
pub enum Hasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    pub fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashKind::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
        }
    }

    /// Seed the hasher with an object header for streamed canonical hashing.
    pub fn new_for_object(kind: HashKind, object_type: ObjectType, len: u64) -> Self {
        let mut h = Hasher::new(kind);
        h.update(object_type.to_bytes());
        h.update(b" ");
        h.update(len.to_string().as_bytes());
        h.update(b"\x00");
        h
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ObjectHash {
        match self {
            Hasher::Sha1(h) => {
                let out: [u8; 20] = h.finalize().into();
                ObjectHash::Sha1(out)
            }
            Hasher::Sha256(h) => {
                let out: [u8; 32] = h.finalize().into();
                ObjectHash::Sha256(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Hashing "Hello, world!" with SHA-1 should match the known value.
    #[test]
    fn sha1_new() {
        let h = ObjectHash::new(HashKind::Sha1, b"Hello, world!");
        assert_eq!(h.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// Hashing "Hello, world!" with SHA-256 should match the known value.
    #[test]
    fn sha256_new() {
        let h = ObjectHash::new(HashKind::Sha256, b"Hello, world!");
        assert_eq!(
            h.to_string(),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    /// Hex parsing infers the algorithm from the string length.
    #[test]
    fn from_str_infers_kind() {
        let sha1 = ObjectHash::from_str("8ab686eafeb1f44702738c8b0f24f2567c36da6d").unwrap();
        assert_eq!(sha1.kind(), HashKind::Sha1);
        let sha256 = ObjectHash::from_str(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        assert_eq!(sha256.kind(), HashKind::Sha256);
        assert!(ObjectHash::from_str("abc123").is_err());
    }

    /// Zero ids are recognized for both algorithms.
    #[test]
    fn zero_round_trip() {
        for kind in [HashKind::Sha1, HashKind::Sha256] {
            let z = ObjectHash::zero(kind);
            assert!(z.is_zero());
            assert_eq!(z.to_string(), ObjectHash::zero_str(kind));
            assert_eq!(ObjectHash::from_str(&ObjectHash::zero_str(kind)).unwrap(), z);
        }
    }

    /// Streaming hasher agrees with the one-shot canonical hash.
    #[test]
    fn incremental_matches_oneshot() {
        let body = b"hello zeta";
        let oneshot =
            ObjectHash::from_type_and_data(HashKind::Sha256, ObjectType::Blob, body);
        let mut h =
            Hasher::new_for_object(HashKind::Sha256, ObjectType::Blob, body.len() as u64);
        h.update(&body[..5]);
        h.update(&body[5..]);
        assert_eq!(h.finalize(), oneshot);
    }

    /// from_stream reads exactly the algorithm's width.
    #[test]
    fn from_stream_reads_width() {
        let bytes = [0xabu8; 32];
        let mut cur = std::io::Cursor::new(&bytes[..]);
        let h = ObjectHash::from_stream(HashKind::Sha1, &mut cur).unwrap();
        assert_eq!(h.size(), 20);
        assert_eq!(cur.position(), 20);
    }
}
