//! Streaming pack encoder.
//!
//! [`FramedSink`] turns logical frames into transported chunks: it keeps
//! the running CRC-64, optionally feeds bytes through a zstd encoder, and
//! hands finished chunks to an `mpsc` channel so a slow client exerts
//! back-pressure on the walker instead of buffering without bound.
//!
//! [`PackStreamer`] drives the sink from an [`ObjectSource`]: breadth-first
//! commit traversal with shallow cuts (`deepen-from`, `have`, `deepen`),
//! subtree descent gated by the sparse matcher, and a seen-set so each
//! object is emitted at most once per stream.

use std::collections::{HashSet, VecDeque};
use std::io::Write;

use async_trait::async_trait;
use byteorder::{BigEndian, WriteBytesExt};
use crc::Digest;
use tokio::sync::mpsc;

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::commit::Commit;
use crate::internal::object::fragments::Fragments;
use crate::internal::object::tag::Tag;
use crate::internal::object::tree::Tree;
use crate::internal::object::AnyObject;
use crate::internal::pack::checksum::{trailer_hex, CRC64_ISO};
use crate::internal::pack::sparse::{SparseCursor, SparseMatcher};
use crate::internal::pack::{StreamKind, PACK_VERSION, TRAILER_LEN};

/// Frames larger than this are split when a single blob is streamed.
pub const BLOB_FRAME_CHUNK: usize = 4 << 20;

/// Read access the encoder needs. The ODB facade implements this; tests
/// implement it over in-memory maps.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    fn hash_kind(&self) -> HashKind;
    async fn commit(&self, id: ObjectHash) -> Result<Commit, ZetaError>;
    async fn tree(&self, id: ObjectHash) -> Result<Tree, ZetaError>;
    async fn fragments(&self, id: ObjectHash) -> Result<Fragments, ZetaError>;
    async fn tag(&self, id: ObjectHash) -> Result<Tag, ZetaError>;
    /// Any metadata object (commit, tree, tag, fragments) by id.
    async fn metadata_object(&self, id: ObjectHash) -> Result<AnyObject, ZetaError>;
    async fn blob(&self, id: ObjectHash) -> Result<Vec<u8>, ZetaError>;
    async fn blob_size(&self, id: ObjectHash) -> Result<u64, ZetaError>;
}

enum Compressor {
    Plain(Vec<u8>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Compressor {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ZetaError> {
        match self {
            Compressor::Plain(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            Compressor::Zstd(enc) => {
                enc.write_all(bytes)?;
                Ok(())
            }
        }
    }

    /// Drain whatever transported bytes are ready.
    fn take(&mut self) -> Vec<u8> {
        match self {
            Compressor::Plain(buf) => std::mem::take(buf),
            Compressor::Zstd(enc) => std::mem::take(enc.get_mut()),
        }
    }

    fn finish(self) -> Result<Vec<u8>, ZetaError> {
        match self {
            Compressor::Plain(buf) => Ok(buf),
            Compressor::Zstd(enc) => Ok(enc.finish()?),
        }
    }
}

/// Chunked frame writer with checksum and optional compression.
pub struct FramedSink {
    tx: mpsc::Sender<Vec<u8>>,
    digest: Digest<'static, u64>,
    comp: Option<Compressor>,
    hex_len: usize,
}

impl FramedSink {
    /// Open the stream: writes the magic/version/reserved header.
    pub async fn new(
        tx: mpsc::Sender<Vec<u8>>,
        kind: StreamKind,
        hash_kind: HashKind,
        zstd_level: Option<i32>,
    ) -> Result<FramedSink, ZetaError> {
        let comp = match zstd_level {
            Some(level) => {
                Compressor::Zstd(zstd::stream::write::Encoder::new(Vec::new(), level)?)
            }
            None => Compressor::Plain(Vec::new()),
        };
        let mut sink = FramedSink {
            tx,
            digest: CRC64_ISO.digest(),
            comp: Some(comp),
            hex_len: hash_kind.hex_len(),
        };
        let mut header = Vec::with_capacity(12);
        header.extend(kind.magic());
        header.write_u32::<BigEndian>(PACK_VERSION)?;
        header.extend([0u8; 4]);
        sink.logical(&header)?;
        sink.deliver().await?;
        Ok(sink)
    }

    /// Bytes of the logical stream: checksummed, then transported.
    fn logical(&mut self, bytes: &[u8]) -> Result<(), ZetaError> {
        self.digest.update(bytes);
        self.comp
            .as_mut()
            .expect("sink already finished")
            .write(bytes)
    }

    async fn deliver(&mut self) -> Result<(), ZetaError> {
        let chunk = self.comp.as_mut().expect("sink already finished").take();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .await
            .map_err(|_| ZetaError::Transient("pack receiver went away".into()))
    }

    /// Emit one frame.
    pub async fn item(&mut self, id: &ObjectHash, payload: &[u8]) -> Result<(), ZetaError> {
        let frame_len = self.hex_len + payload.len();
        let frame_len = u32::try_from(frame_len)
            .map_err(|_| ZetaError::Fatal(format!("pack frame too large: {frame_len}")))?;
        let mut head = Vec::with_capacity(4 + self.hex_len);
        head.write_u32::<BigEndian>(frame_len)?;
        head.extend(id.to_string().as_bytes());
        self.logical(&head)?;
        self.logical(payload)?;
        self.deliver().await
    }

    /// Emit one metadata object in canonical form.
    pub async fn metadata_item(&mut self, object: &AnyObject) -> Result<(), ZetaError> {
        let canonical = object.to_canonical()?;
        self.item(&object.id(), &canonical).await
    }

    /// Emit a blob, split across frames when it exceeds the chunk size.
    pub async fn blob_item(&mut self, id: &ObjectHash, content: &[u8]) -> Result<(), ZetaError> {
        if content.is_empty() {
            return self.item(id, content).await;
        }
        for chunk in content.chunks(BLOB_FRAME_CHUNK) {
            self.item(id, chunk).await?;
        }
        Ok(())
    }

    /// Close the stream: end-of-stream marker, checksum trailer, and any
    /// bytes the compressor still holds.
    pub async fn finish(mut self) -> Result<(), ZetaError> {
        self.logical(&0u32.to_be_bytes())?;
        let FramedSink {
            tx, digest, comp, ..
        } = self;
        let trailer = trailer_hex(digest.finalize());
        debug_assert_eq!(trailer.len(), TRAILER_LEN);
        let mut comp = comp.expect("sink already finished");
        // The trailer is transported but sits outside the checksum.
        comp.write(trailer.as_bytes())?;
        let rest = comp.finish()?;
        if !rest.is_empty() {
            tx.send(rest)
                .await
                .map_err(|_| ZetaError::Transient("pack receiver went away".into()))?;
        }
        Ok(())
    }
}

/// Parameters of a shallow cut.
#[derive(Debug, Clone, Default)]
pub struct ShallowCut {
    /// Truncate the walk when this commit is reached (exclusive).
    pub deepen_from: Option<ObjectHash>,
    /// Commits the client already has; traversal stops at each.
    pub have: Vec<ObjectHash>,
    /// Maximum commits along each path from the head; -1 is unbounded.
    pub deepen: i64,
}

impl ShallowCut {
    pub fn unbounded() -> Self {
        ShallowCut {
            deepen_from: None,
            have: Vec::new(),
            deepen: -1,
        }
    }
}

/// Drives an [`ObjectSource`] into a [`FramedSink`].
pub struct PackStreamer<'a, S: ObjectSource> {
    source: &'a S,
    /// Subtree descent bound, -1 for unbounded. The root tree of an
    /// emitted commit is depth 0.
    tree_max_depth: i64,
}

impl<'a, S: ObjectSource> PackStreamer<'a, S> {
    pub fn new(source: &'a S) -> Self {
        PackStreamer {
            source,
            tree_max_depth: -1,
        }
    }

    pub fn with_tree_depth(mut self, tree_max_depth: i64) -> Self {
        self.tree_max_depth = tree_max_depth;
        self
    }

    /// Breadth-first metadata walk from `head`, honoring the shallow cut
    /// and the sparse matcher.
    pub async fn write_metadata(
        &self,
        sink: &mut FramedSink,
        head: ObjectHash,
        cut: &ShallowCut,
        sparse: &SparseMatcher,
    ) -> Result<(), ZetaError> {
        let have: HashSet<ObjectHash> = cut.have.iter().copied().collect();
        let mut seen: HashSet<ObjectHash> = HashSet::new();
        let mut queue: VecDeque<(ObjectHash, i64)> = VecDeque::new();
        queue.push_back((head, 0));

        while let Some((id, depth)) = queue.pop_front() {
            if seen.contains(&id) || have.contains(&id) {
                continue;
            }
            if cut.deepen_from == Some(id) {
                continue;
            }
            if cut.deepen >= 0 && depth >= cut.deepen {
                continue;
            }
            let commit = self.source.commit(id).await?;
            seen.insert(id);
            sink.metadata_item(&AnyObject::Commit(commit.clone())).await?;

            self.walk_tree(sink, commit.tree_id, sparse.cursor(), 0, &mut seen)
                .await?;

            for parent in commit.parent_ids {
                queue.push_back((parent, depth + 1));
            }
        }
        Ok(())
    }

    /// Recursive tree walk: emits the tree, then descends into subtrees
    /// the cursor admits, emitting fragments manifests for selected
    /// fragment entries. Objects already emitted in this stream are
    /// skipped via the seen-set.
    async fn walk_tree(
        &self,
        sink: &mut FramedSink,
        tree_id: ObjectHash,
        cursor: SparseCursor<'_>,
        depth: i64,
        seen: &mut HashSet<ObjectHash>,
    ) -> Result<(), ZetaError> {
        if seen.contains(&tree_id) {
            return Ok(());
        }
        let tree = self.source.tree(tree_id).await?;
        seen.insert(tree_id);
        sink.metadata_item(&AnyObject::Tree(tree.clone())).await?;

        for entry in &tree.entries {
            if entry.mode.is_subtree() {
                if self.tree_max_depth >= 0 && depth + 1 > self.tree_max_depth {
                    continue;
                }
                if let Some(next) = cursor.descend(&entry.name) {
                    Box::pin(self.walk_tree(sink, entry.id, next, depth + 1, seen)).await?;
                }
            } else if entry.mode == crate::internal::object::tree::EntryMode::Fragments
                && cursor.selects(&entry.name)
                && !seen.contains(&entry.id)
            {
                let manifest = self.source.fragments(entry.id).await?;
                seen.insert(entry.id);
                sink.metadata_item(&AnyObject::Fragments(manifest)).await?;
            }
        }
        Ok(())
    }

    /// Emit a specific set of metadata objects, deduplicated.
    pub async fn write_batch_metadata(
        &self,
        sink: &mut FramedSink,
        ids: &[ObjectHash],
    ) -> Result<(), ZetaError> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let object = self.source.metadata_object(*id).await?;
            sink.metadata_item(&object).await?;
        }
        Ok(())
    }

    /// Emit small blobs; blobs over `max_size` are skipped so the client
    /// falls back to single-object fetch or a presigned URL.
    pub async fn write_batch_objects(
        &self,
        sink: &mut FramedSink,
        ids: &[ObjectHash],
        max_size: u64,
    ) -> Result<(), ZetaError> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let size = self.source.blob_size(*id).await?;
            if size > max_size {
                tracing::debug!(oid = %id, size, "blob over batch threshold, skipped");
                continue;
            }
            let content = self.source.blob(*id).await?;
            sink.blob_item(id, &content).await?;
        }
        Ok(())
    }
}
