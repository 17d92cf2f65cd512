//! Pack decoder, symmetric to the encoder: read the magic and version,
//! loop over length-prefixed frames, then verify the CRC-64 trailer.

use std::io::Read;
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::types::ObjectType;
use crate::internal::object::AnyObject;
use crate::internal::pack::checksum::{trailer_hex, ChecksumReader};
use crate::internal::pack::{StreamKind, PACK_VERSION, TRAILER_LEN};

/// Upper bound on a single frame; anything larger is a malformed stream,
/// not an allocation request.
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Reads one pack stream. Wrap the reader in [`maybe_decompress`] first
/// when the content type negotiated zstd framing.
pub struct PackReader<R: Read> {
    inner: Option<ChecksumReader<R>>,
    kind: StreamKind,
    hash_kind: HashKind,
    done: bool,
}

impl<R: Read> PackReader<R> {
    /// Parse the stream header.
    pub fn new(reader: R, hash_kind: HashKind) -> Result<PackReader<R>, ZetaError> {
        let mut inner = ChecksumReader::new(reader);
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        let kind = StreamKind::from_magic(&magic)?;
        let version = inner.read_u32::<BigEndian>()?;
        if version != PACK_VERSION {
            return Err(ZetaError::malformed(format!(
                "unsupported pack version {version}"
            )));
        }
        let mut reserved = [0u8; 4];
        inner.read_exact(&mut reserved)?;
        Ok(PackReader {
            inner: Some(inner),
            kind,
            hash_kind,
            done: false,
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Next `(id, payload)` frame, or `None` once the end-of-stream marker
    /// and a valid trailer have been consumed.
    pub fn next_item(&mut self) -> Result<Option<(ObjectHash, Vec<u8>)>, ZetaError> {
        if self.done {
            return Ok(None);
        }
        let hex_len = self.hash_kind.hex_len();
        let inner = self.inner.as_mut().expect("reader already finished");

        let frame_len = inner.read_u32::<BigEndian>()?;
        if frame_len == 0 {
            self.verify_trailer()?;
            self.done = true;
            return Ok(None);
        }
        if frame_len > MAX_FRAME_LEN {
            return Err(ZetaError::malformed(format!(
                "pack frame of {frame_len} bytes"
            )));
        }
        if (frame_len as usize) < hex_len {
            return Err(ZetaError::malformed(format!(
                "pack frame of {frame_len} bytes is shorter than an id"
            )));
        }

        let mut hex = vec![0u8; hex_len];
        inner.read_exact(&mut hex)?;
        let hex = std::str::from_utf8(&hex)
            .map_err(|_| ZetaError::malformed("pack frame id is not UTF-8"))?;
        let id = ObjectHash::from_str(hex).map_err(ZetaError::Malformed)?;

        let mut payload = vec![0u8; frame_len as usize - hex_len];
        inner.read_exact(&mut payload)?;
        Ok(Some((id, payload)))
    }

    fn verify_trailer(&mut self) -> Result<(), ZetaError> {
        let (mut raw, computed) = self
            .inner
            .take()
            .expect("reader already finished")
            .into_parts();
        let mut trailer = [0u8; TRAILER_LEN];
        raw.read_exact(&mut trailer)?;
        let trailer = std::str::from_utf8(&trailer)
            .map_err(|_| ZetaError::malformed("pack trailer is not hex"))?;
        if trailer != trailer_hex(computed) {
            return Err(ZetaError::integrity(format!(
                "pack checksum mismatch: trailer {trailer}, computed {}",
                trailer_hex(computed)
            )));
        }
        Ok(())
    }
}

/// Wrap a reader in a zstd decoder when the content type negotiated
/// compression.
pub fn maybe_decompress<'a, R: Read + 'a>(
    reader: R,
    compressed: bool,
) -> Result<Box<dyn Read + 'a>, ZetaError> {
    if compressed {
        Ok(Box::new(zstd::stream::read::Decoder::new(reader)?))
    } else {
        Ok(Box::new(reader))
    }
}

/// Decode a full metadata stream, verifying that every payload hashes to
/// its declared id.
pub fn decode_metadata_stream(
    bytes: &[u8],
    hash_kind: HashKind,
    compressed: bool,
) -> Result<Vec<AnyObject>, ZetaError> {
    let reader = maybe_decompress(bytes, compressed)?;
    let mut reader = PackReader::new(reader, hash_kind)?;
    if reader.kind() != StreamKind::Metadata {
        return Err(ZetaError::malformed("expected a metadata stream"));
    }
    let mut objects = Vec::new();
    while let Some((id, payload)) = reader.next_item()? {
        let computed = ObjectHash::new(hash_kind, &payload);
        if computed != id {
            return Err(ZetaError::integrity(format!(
                "metadata item declares {id} but hashes to {computed}"
            )));
        }
        let object = AnyObject::parse_canonical(&payload, hash_kind)?;
        if !object.kind().is_metadata() {
            return Err(ZetaError::integrity(format!(
                "{} object {id} on the metadata stream",
                object.kind()
            )));
        }
        objects.push(object);
    }
    Ok(objects)
}

/// Decode a full object stream, joining split blob frames by id and
/// verifying content hashes.
pub fn decode_object_stream(
    bytes: &[u8],
    hash_kind: HashKind,
    compressed: bool,
) -> Result<Vec<(ObjectHash, Vec<u8>)>, ZetaError> {
    let reader = maybe_decompress(bytes, compressed)?;
    let mut reader = PackReader::new(reader, hash_kind)?;
    if reader.kind() != StreamKind::Object {
        return Err(ZetaError::malformed("expected an object stream"));
    }
    let mut blobs: Vec<(ObjectHash, Vec<u8>)> = Vec::new();
    while let Some((id, payload)) = reader.next_item()? {
        match blobs.last_mut() {
            // Continuation frames of a split blob share the id.
            Some((last_id, content)) if *last_id == id => content.extend(payload),
            _ => blobs.push((id, payload)),
        }
    }
    for (id, content) in &blobs {
        let computed = ObjectHash::from_type_and_data(hash_kind, ObjectType::Blob, content);
        if computed != *id {
            return Err(ZetaError::integrity(format!(
                "blob declares {id} but hashes to {computed}"
            )));
        }
    }
    Ok(blobs)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::internal::object::blob::Blob;
    use crate::internal::object::commit::Commit;
    use crate::internal::object::signature::Signature;
    use crate::internal::object::tree::{EntryMode, Tree, TreeEntry};
    use crate::internal::object::ObjectTrait;
    use crate::internal::pack::encode::FramedSink;

    const KIND: HashKind = HashKind::Sha1;

    async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk);
        }
        out
    }

    fn sample_objects() -> (Blob, Tree, Commit) {
        let blob = Blob::from_content(KIND, "fn main() {}\n");
        let tree = Tree::from_entries(
            KIND,
            vec![TreeEntry::with_size(
                EntryMode::Regular,
                blob.id,
                "main.rs",
                blob.data.len() as u64,
            )],
        )
        .unwrap();
        let commit = Commit::new(
            KIND,
            Signature::new("a", "a@z", 1),
            Signature::new("c", "c@z", 2),
            tree.id,
            vec![],
            "init\n",
        )
        .unwrap();
        (blob, tree, commit)
    }

    /// Metadata stream round-trips through encode and decode, trailer
    /// verified, for both plain and zstd transport.
    #[tokio::test]
    async fn metadata_round_trip() {
        for level in [None, Some(3)] {
            let (_, tree, commit) = sample_objects();
            let (tx, rx) = mpsc::channel(16);
            let mut sink = FramedSink::new(tx, StreamKind::Metadata, KIND, level)
                .await
                .unwrap();
            sink.metadata_item(&AnyObject::Commit(commit.clone()))
                .await
                .unwrap();
            sink.metadata_item(&AnyObject::Tree(tree.clone()))
                .await
                .unwrap();
            sink.finish().await.unwrap();

            let bytes = collect(rx).await;
            let objects = decode_metadata_stream(&bytes, KIND, level.is_some()).unwrap();
            assert_eq!(objects.len(), 2);
            assert_eq!(objects[0].id(), commit.id);
            assert_eq!(objects[1].id(), tree.id);
        }
    }

    /// A corrupted byte in the stream fails the trailer check.
    #[tokio::test]
    async fn corruption_detected() {
        let (_, tree, _) = sample_objects();
        let (tx, rx) = mpsc::channel(16);
        let mut sink = FramedSink::new(tx, StreamKind::Metadata, KIND, None)
            .await
            .unwrap();
        sink.metadata_item(&AnyObject::Tree(tree)).await.unwrap();
        sink.finish().await.unwrap();

        let mut bytes = collect(rx).await;
        // Flip a payload byte without touching frame lengths.
        let n = bytes.len();
        bytes[n - TRAILER_LEN - 6] ^= 0x01;
        let err = decode_metadata_stream(&bytes, KIND, false).unwrap_err();
        assert_eq!(err.status(), 409);
    }

    /// Object streams split large blobs across frames and join them back.
    #[tokio::test]
    async fn split_blob_round_trip() {
        let content = vec![7u8; super::super::encode::BLOB_FRAME_CHUNK + 1234];
        let blob = Blob::from_content(KIND, &content);
        let (tx, rx) = mpsc::channel(16);
        let mut sink = FramedSink::new(tx, StreamKind::Object, KIND, None)
            .await
            .unwrap();
        sink.blob_item(&blob.id, &blob.data).await.unwrap();
        sink.finish().await.unwrap();

        let bytes = collect(rx).await;
        let blobs = decode_object_stream(&bytes, KIND, false).unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0, blob.id);
        assert_eq!(blobs[0].1, content);
    }

    /// A payload that does not hash to its declared id is an integrity
    /// error.
    #[tokio::test]
    async fn lying_id_detected() {
        let blob = Blob::from_content(KIND, "real");
        let wrong_id = Blob::from_content(KIND, "other").id;
        let (tx, rx) = mpsc::channel(16);
        let mut sink = FramedSink::new(tx, StreamKind::Object, KIND, None)
            .await
            .unwrap();
        sink.blob_item(&wrong_id, &blob.data).await.unwrap();
        sink.finish().await.unwrap();

        let bytes = collect(rx).await;
        let err = decode_object_stream(&bytes, KIND, false).unwrap_err();
        assert_eq!(err.status(), 409);
    }

    /// The metadata stream rejects a blob-kind canonical payload.
    #[tokio::test]
    async fn blob_on_metadata_stream_rejected() {
        let blob = Blob::from_content(KIND, "sneaky");
        let canonical = {
            let mut v = Vec::new();
            v.extend(b"blob ");
            v.extend(blob.data.len().to_string().as_bytes());
            v.push(0);
            v.extend(&blob.data);
            v
        };
        let id = ObjectHash::new(KIND, &canonical);
        let (tx, rx) = mpsc::channel(16);
        let mut sink = FramedSink::new(tx, StreamKind::Metadata, KIND, None)
            .await
            .unwrap();
        sink.item(&id, &canonical).await.unwrap();
        sink.finish().await.unwrap();

        let bytes = collect(rx).await;
        let err = decode_metadata_stream(&bytes, KIND, false).unwrap_err();
        assert_eq!(err.status(), 409);
    }

    /// Truncated streams surface as IO/malformed errors, not panics.
    #[tokio::test]
    async fn truncated_stream_errors() {
        let (_, tree, _) = sample_objects();
        let (tx, rx) = mpsc::channel(16);
        let mut sink = FramedSink::new(tx, StreamKind::Metadata, KIND, None)
            .await
            .unwrap();
        sink.metadata_item(&AnyObject::Tree(tree)).await.unwrap();
        sink.finish().await.unwrap();
        let bytes = collect(rx).await;
        assert!(decode_metadata_stream(&bytes[..bytes.len() / 2], KIND, false).is_err());
    }

    /// ObjectTrait keeps ids coherent with what the canonical parse sees.
    #[test]
    fn canonical_parse_matches_trait() {
        let (_, _, commit) = sample_objects();
        let canonical = AnyObject::Commit(commit.clone()).to_canonical().unwrap();
        let parsed = AnyObject::parse_canonical(&canonical, KIND).unwrap();
        assert_eq!(parsed.id(), commit.id);
        assert_eq!(commit.object_hash(KIND).unwrap(), commit.id);
    }
}
