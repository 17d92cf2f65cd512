//! ODB facade: one Read/Write surface over the loose store, the parsed
//! cache, the remote blob store and the metadata database.
//!
//! Encoding a metadata object writes its canonical form to the loose
//! store, mirrors the body into the metadata DB and warms the parsed
//! cache. Encoding a blob places the payload in the remote store and
//! records a size stat. `hash_to` streams a blob to disk first and only
//! uploads when an existence probe says the remote does not have it yet.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::db::MetaStore;
use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::blob::Blob;
use crate::internal::object::commit::Commit;
use crate::internal::object::fragments::Fragments;
use crate::internal::object::tag::Tag;
use crate::internal::object::tree::Tree;
use crate::internal::object::types::ObjectType;
use crate::internal::object::AnyObject;
use crate::internal::pack::encode::ObjectSource;
use crate::model::repository;
use crate::storage::cache::MetaCache;
use crate::storage::loose::LooseStore;
use crate::storage::quarantine::Quarantine;
use crate::storage::remote::{RemoteStore, SizedStream};

/// Annotated tag chains peel at most this deep.
const MAX_TAG_DEPTH: usize = 20;

#[derive(Clone)]
pub struct Odb {
    repo: repository::Model,
    hash_kind: HashKind,
    loose: LooseStore,
    cache: MetaCache,
    remote: RemoteStore,
    meta: MetaStore,
    /// Memo of blobs the remote store is known to hold, so repeated
    /// `hash_to` calls skip the existence probe.
    known_remote: Arc<DashMap<ObjectHash, u64>>,
}

impl Odb {
    pub fn open(
        repo: repository::Model,
        storage: &StorageConfig,
        cache: MetaCache,
        remote: RemoteStore,
        meta: MetaStore,
    ) -> Result<Odb, ZetaError> {
        let hash_kind: HashKind = repo
            .hash_algo
            .parse()
            .map_err(|e: String| ZetaError::Fatal(format!("repository hash algo: {e}")))?;
        let loose = LooseStore::open(storage.root.join(repo.id.to_string()), hash_kind)?;
        Ok(Odb {
            repo,
            hash_kind,
            loose,
            cache,
            remote,
            meta,
            known_remote: Arc::new(DashMap::new()),
        })
    }

    pub fn repo(&self) -> &repository::Model {
        &self.repo
    }

    pub fn rid(&self) -> i64 {
        self.repo.id
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    pub fn remote(&self) -> &RemoteStore {
        &self.remote
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// Remote key of a blob payload.
    pub fn remote_key(&self, id: &ObjectHash) -> String {
        let hex = id.to_string();
        format!("repos/{}/objects/{}/{}", self.repo.id, &hex[..2], &hex[2..])
    }

    /// Open a push staging area.
    pub fn quarantine(&self) -> Result<Quarantine, ZetaError> {
        Quarantine::open(&self.loose)
    }

    /// Write an object. Metadata kinds land in the loose store, the
    /// metadata DB and the cache; blob payloads go to the remote store
    /// with a size stat recorded.
    pub async fn encode(&self, object: &AnyObject) -> Result<ObjectHash, ZetaError> {
        let id = self.loose.write_object(object)?;
        match object {
            AnyObject::Blob(blob) => {
                let key = self.remote_key(&id);
                if !self.remote.exists(&key).await? {
                    self.remote
                        .put(&key, bytes::Bytes::from(blob.data.clone()), "application/octet-stream")
                        .await?;
                }
                self.known_remote.insert(id, blob.data.len() as u64);
                self.meta
                    .record_blob(self.repo.id, id, blob.data.len() as u64)
                    .await?;
            }
            _ => {
                self.meta.store_metadata(self.repo.id, object).await?;
                self.cache.insert(self.repo.id, object.clone()).await;
            }
        }
        Ok(id)
    }

    /// Stream a blob of known size into the loose store, then upload it to
    /// the remote store unless an existence probe says it is already
    /// there.
    pub async fn hash_to(
        &self,
        mut reader: &mut (dyn std::io::Read + Send),
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<ObjectHash, ZetaError> {
        let id = self.loose.write_blob_stream(&mut reader, size)?;
        if self.known_remote.contains_key(&id) {
            return Ok(id);
        }
        let key = self.remote_key(&id);
        if !self.remote.exists(&key).await? {
            let (path, body_offset, body_len) = self.loose.blob_location(&id)?;
            self.remote
                .linear_upload(
                    &key,
                    &path,
                    body_offset,
                    body_len,
                    "application/octet-stream",
                    cancel,
                )
                .await?;
        }
        self.known_remote.insert(id, size);
        self.meta.record_blob(self.repo.id, id, size).await?;
        Ok(id)
    }

    /// Open a blob body at `start`: the loose store when cached locally,
    /// a remote range GET otherwise.
    pub async fn open_stream(
        &self,
        id: ObjectHash,
        start: u64,
    ) -> Result<SizedStream, ZetaError> {
        if self.loose.contains(&id) {
            let sized = self.loose.open_blob(&id, start)?;
            let size = sized.size;
            let file = tokio::fs::File::from_std(sized.reader);
            let stream = ReaderStream::new(file);
            use futures::TryStreamExt;
            return Ok(SizedStream {
                size,
                stream: Box::pin(stream.map_err(ZetaError::from)),
            });
        }
        self.remote.open(&self.remote_key(&id), start, None).await
    }

    /// Load a parsed object: cache, loose store, then the metadata DB.
    pub async fn objects(&self, id: ObjectHash) -> Result<AnyObject, ZetaError> {
        if let Some(cached) = self.cache.get(self.repo.id, &id).await {
            return Ok((*cached).clone());
        }
        if self.loose.contains(&id) {
            let object = self.loose.read_object(&id)?;
            self.cache.insert(self.repo.id, object.clone()).await;
            return Ok(object);
        }
        if let Some((kind, body)) = self.meta.metadata_bytes(self.repo.id, id).await? {
            let object = AnyObject::parse(kind, &body, id)?;
            self.cache.insert(self.repo.id, object.clone()).await;
            return Ok(object);
        }
        Err(ZetaError::not_found(format!("object {id}")))
    }

    /// Whether the object is resolvable here (loose, DB mirror, or blob
    /// stat) without asking the remote store.
    pub async fn has_object(&self, id: ObjectHash) -> Result<bool, ZetaError> {
        if self.loose.contains(&id) || self.known_remote.contains_key(&id) {
            return Ok(true);
        }
        if self.meta.metadata_bytes(self.repo.id, id).await?.is_some() {
            return Ok(true);
        }
        Ok(self.meta.blob_size(self.repo.id, id).await.is_ok())
    }

    /// Peel annotated tag chains to the commit they terminate at.
    pub async fn parse_rev(&self, id: ObjectHash) -> Result<Commit, ZetaError> {
        let mut current = id;
        for _ in 0..=MAX_TAG_DEPTH {
            match self.objects(current).await? {
                AnyObject::Commit(commit) => return Ok(commit),
                AnyObject::Tag(tag) => current = tag.object,
                other => {
                    return Err(ZetaError::integrity(format!(
                        "{current} peels to a {}, not a commit",
                        other.kind()
                    )));
                }
            }
        }
        Err(ZetaError::integrity(format!(
            "tag chain from {id} exceeds {MAX_TAG_DEPTH} levels"
        )))
    }

    /// Close and reopen the backing caches, used after bulk imports.
    pub fn reload(&self) {
        self.cache.clear();
        self.known_remote.clear();
    }

    async fn typed(&self, id: ObjectHash, want: ObjectType) -> Result<AnyObject, ZetaError> {
        let object = self.objects(id).await?;
        if object.kind() != want {
            return Err(ZetaError::integrity(format!(
                "object {id} decoded as {}, expected {want}",
                object.kind()
            )));
        }
        Ok(object)
    }

    pub async fn commit(&self, id: ObjectHash) -> Result<Commit, ZetaError> {
        match self.typed(id, ObjectType::Commit).await? {
            AnyObject::Commit(c) => Ok(c),
            _ => unreachable!("typed() checked the kind"),
        }
    }

    pub async fn tree(&self, id: ObjectHash) -> Result<Tree, ZetaError> {
        match self.typed(id, ObjectType::Tree).await? {
            AnyObject::Tree(t) => Ok(t),
            _ => unreachable!("typed() checked the kind"),
        }
    }

    pub async fn tag(&self, id: ObjectHash) -> Result<Tag, ZetaError> {
        match self.typed(id, ObjectType::Tag).await? {
            AnyObject::Tag(t) => Ok(t),
            _ => unreachable!("typed() checked the kind"),
        }
    }

    pub async fn fragments(&self, id: ObjectHash) -> Result<Fragments, ZetaError> {
        match self.typed(id, ObjectType::Fragments).await? {
            AnyObject::Fragments(f) => Ok(f),
            _ => unreachable!("typed() checked the kind"),
        }
    }

    pub async fn blob(&self, id: ObjectHash) -> Result<Blob, ZetaError> {
        if self.loose.contains(&id) {
            match self.loose.read_object(&id)? {
                AnyObject::Blob(b) => return Ok(b),
                other => {
                    return Err(ZetaError::integrity(format!(
                        "object {id} decoded as {}, expected blob",
                        other.kind()
                    )));
                }
            }
        }
        // Pull the payload from the remote store.
        use futures::StreamExt;
        let mut sized = self.remote.open(&self.remote_key(&id), 0, None).await?;
        let mut data = Vec::with_capacity(sized.size as usize);
        while let Some(chunk) = sized.stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        let blob = Blob::from_content(self.hash_kind, &data);
        if blob.id != id {
            return Err(ZetaError::integrity(format!(
                "remote blob {id} hashes to {}",
                blob.id
            )));
        }
        Ok(blob)
    }

    pub async fn blob_size(&self, id: ObjectHash) -> Result<u64, ZetaError> {
        if let Some(size) = self.known_remote.get(&id).map(|e| *e.value()) {
            return Ok(size);
        }
        if self.loose.contains(&id) {
            let (_, _, len) = self.loose.blob_location(&id)?;
            return Ok(len);
        }
        match self.meta.blob_size(self.repo.id, id).await {
            Ok(size) => Ok(size),
            Err(ZetaError::NotFound(_)) => {
                Ok(self.remote.stat(&self.remote_key(&id)).await?.size)
            }
            Err(e) => Err(e),
        }
    }
}

/// The capability record the pack encoder drives; keeps the encoder free
/// of a back-pointer into the ODB.
#[async_trait]
impl ObjectSource for Odb {
    fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    async fn commit(&self, id: ObjectHash) -> Result<Commit, ZetaError> {
        Odb::commit(self, id).await
    }

    async fn tree(&self, id: ObjectHash) -> Result<Tree, ZetaError> {
        Odb::tree(self, id).await
    }

    async fn fragments(&self, id: ObjectHash) -> Result<Fragments, ZetaError> {
        Odb::fragments(self, id).await
    }

    async fn tag(&self, id: ObjectHash) -> Result<Tag, ZetaError> {
        Odb::tag(self, id).await
    }

    async fn metadata_object(&self, id: ObjectHash) -> Result<AnyObject, ZetaError> {
        let object = self.objects(id).await?;
        if !object.kind().is_metadata() {
            return Err(ZetaError::integrity(format!(
                "object {id} is a blob, not metadata"
            )));
        }
        Ok(object)
    }

    async fn blob(&self, id: ObjectHash) -> Result<Vec<u8>, ZetaError> {
        Ok(Odb::blob(self, id).await?.data)
    }

    async fn blob_size(&self, id: ObjectHash) -> Result<u64, ZetaError> {
        Odb::blob_size(self, id).await
    }
}


#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::testutil::MemorySource;
    use super::*;
    use crate::internal::object::signature::Signature;
    use crate::internal::object::tree::{EntryMode, TreeEntry};
    use crate::internal::pack::decode::decode_metadata_stream;
    use crate::internal::pack::encode::{FramedSink, PackStreamer, ShallowCut};
    use crate::internal::pack::sparse::SparseMatcher;
    use crate::internal::pack::StreamKind;

    const KIND: HashKind = HashKind::Sha1;

    fn sig(n: &str) -> Signature {
        Signature::new(n, format!("{n}@zeta.dev"), 1700000000)
    }

    struct RepoBuilder {
        source: MemorySource,
    }

    impl RepoBuilder {
        fn new() -> Self {
            RepoBuilder {
                source: MemorySource::default(),
            }
        }

        fn blob(&self, content: &str) -> (ObjectHash, u64) {
            let blob = Blob::from_content(KIND, content);
            let size = blob.data.len() as u64;
            (self.source.insert(AnyObject::Blob(blob)), size)
        }

        fn tree(&self, entries: Vec<TreeEntry>) -> ObjectHash {
            let tree = Tree::from_entries(KIND, entries).unwrap();
            self.source.insert(AnyObject::Tree(tree))
        }

        fn commit(&self, tree: ObjectHash, parents: Vec<ObjectHash>, msg: &str) -> ObjectHash {
            let commit =
                Commit::new(KIND, sig("a"), sig("c"), tree, parents, msg).unwrap();
            self.source.insert(AnyObject::Commit(commit))
        }
    }

    async fn run_metadata_walk(
        source: &MemorySource,
        head: ObjectHash,
        cut: ShallowCut,
        sparse: SparseMatcher,
    ) -> Vec<AnyObject> {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sink = FramedSink::new(tx, StreamKind::Metadata, KIND, None)
            .await
            .unwrap();
        let streamer = PackStreamer::new(source);
        streamer
            .write_metadata(&mut sink, head, &cut, &sparse)
            .await
            .unwrap();
        sink.finish().await.unwrap();
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend(chunk);
        }
        decode_metadata_stream(&bytes, KIND, false).unwrap()
    }

    /// Scenario: sparse fetch emits head commit, root tree, the selected
    /// subtree, and nothing under unselected paths.
    #[tokio::test]
    async fn sparse_walk_soundness() {
        let repo = RepoBuilder::new();
        let (a_c, a_size) = repo.blob("int a;\n");
        let (b_c, b_size) = repo.blob("int b;\n");
        let (x_md, x_size) = repo.blob("# docs\n");
        let src = repo.tree(vec![
            TreeEntry::with_size(EntryMode::Regular, a_c, "a.c", a_size),
            TreeEntry::with_size(EntryMode::Regular, b_c, "b.c", b_size),
        ]);
        let docs = repo.tree(vec![TreeEntry::with_size(
            EntryMode::Regular,
            x_md,
            "x.md",
            x_size,
        )]);
        let root = repo.tree(vec![
            TreeEntry::new(EntryMode::Subtree, src, "src"),
            TreeEntry::new(EntryMode::Subtree, docs, "docs"),
        ]);
        let head = repo.commit(root, vec![], "head\n");

        let cut = ShallowCut {
            deepen: 1,
            ..ShallowCut::unbounded()
        };
        let objects =
            run_metadata_walk(&repo.source, head, cut, SparseMatcher::new(["src/a.c"])).await;

        let ids: Vec<ObjectHash> = objects.iter().map(|o| o.id()).collect();
        assert!(ids.contains(&head));
        assert!(ids.contains(&root));
        assert!(ids.contains(&src));
        assert!(!ids.contains(&docs), "docs subtree must be pruned");
        assert_eq!(objects.len(), 3);
    }

    /// Shallow depth bounds the commits emitted along each path.
    #[tokio::test]
    async fn shallow_depth_bound() {
        let repo = RepoBuilder::new();
        let root = repo.tree(vec![]);
        let c1 = repo.commit(root, vec![], "1\n");
        let c2 = repo.commit(root, vec![c1], "2\n");
        let c3 = repo.commit(root, vec![c2], "3\n");

        let cut = ShallowCut {
            deepen: 2,
            ..ShallowCut::unbounded()
        };
        let objects =
            run_metadata_walk(&repo.source, c3, cut, SparseMatcher::default()).await;
        let commits: Vec<ObjectHash> = objects
            .iter()
            .filter(|o| matches!(o, AnyObject::Commit(_)))
            .map(|o| o.id())
            .collect();
        assert_eq!(commits, vec![c3, c2]);

        // `have` stops the walk even when depth allows more.
        let cut = ShallowCut {
            have: vec![c2],
            deepen: -1,
            deepen_from: None,
        };
        let objects =
            run_metadata_walk(&repo.source, c3, cut, SparseMatcher::default()).await;
        let commits: Vec<ObjectHash> = objects
            .iter()
            .filter(|o| matches!(o, AnyObject::Commit(_)))
            .map(|o| o.id())
            .collect();
        assert_eq!(commits, vec![c3]);

        // deepen-from truncates at the named commit.
        let cut = ShallowCut {
            deepen_from: Some(c1),
            deepen: -1,
            have: vec![],
        };
        let objects =
            run_metadata_walk(&repo.source, c3, cut, SparseMatcher::default()).await;
        let commits: Vec<ObjectHash> = objects
            .iter()
            .filter(|o| matches!(o, AnyObject::Commit(_)))
            .map(|o| o.id())
            .collect();
        assert_eq!(commits, vec![c3, c2]);
    }

    /// Objects shared between commits are emitted once per stream.
    #[tokio::test]
    async fn seen_set_deduplicates() {
        let repo = RepoBuilder::new();
        let root = repo.tree(vec![]);
        let c1 = repo.commit(root, vec![], "1\n");
        let c2 = repo.commit(root, vec![c1], "2\n");

        let objects = run_metadata_walk(
            &repo.source,
            c2,
            ShallowCut::unbounded(),
            SparseMatcher::default(),
        )
        .await;
        let trees = objects
            .iter()
            .filter(|o| matches!(o, AnyObject::Tree(_)))
            .count();
        assert_eq!(trees, 1, "shared root tree must appear once");
    }

    /// Fragment manifests reachable from a commit ride the metadata
    /// stream.
    #[tokio::test]
    async fn fragments_on_metadata_stream() {
        let repo = RepoBuilder::new();
        let (chunk_id, chunk_size) = repo.blob("chunk-payload");
        let manifest = Fragments::from_chunks(
            KIND,
            vec![crate::internal::object::fragments::Chunk {
                id: chunk_id,
                size: chunk_size,
            }],
        )
        .unwrap();
        let manifest_id = repo.source.insert(AnyObject::Fragments(manifest.clone()));
        let root = repo.tree(vec![TreeEntry::with_size(
            EntryMode::Fragments,
            manifest_id,
            "huge.bin",
            manifest.total_size(),
        )]);
        let head = repo.commit(root, vec![], "big file\n");

        let objects = run_metadata_walk(
            &repo.source,
            head,
            ShallowCut::unbounded(),
            SparseMatcher::default(),
        )
        .await;
        assert!(objects
            .iter()
            .any(|o| matches!(o, AnyObject::Fragments(f) if f.id == manifest_id)));
    }
}
