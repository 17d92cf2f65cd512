//! Streaming pack wire format.
//!
//! A pack is a framed sequence of objects with a CRC-64 trailer:
//!
//! ```text
//! [magic:4][version:u32 BE][reserved:4]
//! repeat:
//!   [item-length:u32 BE]          0 = end of stream
//!   [hex-id: hex_len ASCII bytes]
//!   [payload: item-length - hex_len bytes]
//! [crc64 hex: 16 ASCII bytes]     over everything above it
//! ```
//!
//! Two magics distinguish the metadata stream (commits, trees, tags,
//! fragment manifests, carried in canonical `"<kind> <len>\0"` form) from
//! the object stream (raw blob payloads). Optional zstd framing wraps the
//! transported bytes; the checksum always covers the logical stream.

pub mod checksum;
pub mod decode;
pub mod encode;
pub mod sparse;

use crate::errors::ZetaError;

/// Magic for commit/tree/tag/fragments streams.
pub const METADATA_MAGIC: [u8; 4] = *b"ZMTA";
/// Magic for raw blob streams.
pub const OBJECT_MAGIC: [u8; 4] = *b"ZOBJ";
/// Current wire version.
pub const PACK_VERSION: u32 = 1;
/// Hex-encoded CRC-64 trailer width.
pub const TRAILER_LEN: usize = 16;

/// Blobs above this size are omitted from batch responses; clients fall
/// back to single-object fetch or a presigned URL.
pub const MAX_BATCH_BLOB_SIZE: u64 = 8 << 20;

/// Which of the two streams a pack carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Metadata,
    Object,
}

impl StreamKind {
    pub const fn magic(&self) -> [u8; 4] {
        match self {
            StreamKind::Metadata => METADATA_MAGIC,
            StreamKind::Object => OBJECT_MAGIC,
        }
    }

    pub fn from_magic(magic: &[u8; 4]) -> Result<StreamKind, ZetaError> {
        match *magic {
            METADATA_MAGIC => Ok(StreamKind::Metadata),
            OBJECT_MAGIC => Ok(StreamKind::Object),
            other => Err(ZetaError::malformed(format!(
                "unknown pack magic {:02x?}",
                other
            ))),
        }
    }
}
