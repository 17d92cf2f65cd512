//! Fetch-side endpoint implementations: reference resolution, metadata
//! and object streams, presigned shares, and the batch existence check.
//!
//! Pack-producing operations spawn the walker onto a task writing into an
//! `mpsc` channel; the transport forwards chunks as they arrive, so a
//! slow client blocks the walker instead of buffering the repository.

use std::str::FromStr;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::TransferConfig;
use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::AnyObject;
use crate::internal::pack::encode::{FramedSink, PackStreamer, ShallowCut, BLOB_FRAME_CHUNK};
use crate::internal::pack::sparse::SparseMatcher;
use crate::internal::pack::StreamKind;
use crate::odb::Odb;
use crate::protocol::core::ZetaService;
use crate::protocol::types::{
    BatchCheckEntry, FetchParams, LsReferenceResult, Operation, ShareEntry, AGENT,
    PROTOCOL_VERSION,
};

/// Chunk capacity of pack channels; bounded so back-pressure reaches the
/// walker.
const PACK_CHANNEL: usize = 64;

/// `ls-reference`: resolve a name, peel annotated tags, and describe the
/// repository's wire preferences.
pub async fn ls_reference(
    service: &ZetaService,
    odb: &Odb,
    refname: &str,
) -> Result<LsReferenceResult, ZetaError> {
    let repo = odb.repo();
    let (name, hash) = service.meta.resolve_ref(repo, refname).await?;
    let peeled = match odb.objects(hash).await? {
        AnyObject::Tag(_) => Some(odb.parse_rev(hash).await?.id.to_string()),
        _ => None,
    };
    Ok(LsReferenceResult {
        remote: format!("{}/{}", repo.namespace_id, repo.path),
        name,
        hash: hash.to_string(),
        peeled,
        head: format!("refs/heads/{}", repo.default_branch),
        version: PROTOCOL_VERSION,
        agent: AGENT.to_string(),
        hash_algo: repo.hash_algo.clone(),
        compression_algo: repo.compression_algo.clone(),
    })
}

/// `metadata`: commit/tree/fragments stream with shallow-cut and sparse
/// parameters.
pub async fn metadata_stream(
    odb: Odb,
    transfer: &TransferConfig,
    head: ObjectHash,
    params: &FetchParams,
    sparse_paths: Vec<String>,
    compressed: bool,
) -> Result<ReceiverStream<Vec<u8>>, ZetaError> {
    let cut = ShallowCut {
        deepen_from: params.deepen_from_hash()?,
        have: params.have_hashes()?,
        deepen: params.deepen,
    };
    let tree_depth = if params.depth != -1 {
        params.depth
    } else {
        transfer.tree_max_depth
    };
    let zstd_level = compressed.then_some(transfer.zstd_level);

    let (tx, rx) = mpsc::channel(PACK_CHANNEL);
    tokio::spawn(async move {
        let sparse = SparseMatcher::new(sparse_paths);
        let result = async {
            let mut sink =
                FramedSink::new(tx, StreamKind::Metadata, odb.hash_kind(), zstd_level).await?;
            PackStreamer::new(&odb)
                .with_tree_depth(tree_depth)
                .write_metadata(&mut sink, head, &cut, &sparse)
                .await?;
            sink.finish().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "metadata stream failed");
        }
    });
    Ok(ReceiverStream::new(rx))
}

/// `batch-metadata`: a specific id set, newline separated on the wire.
pub async fn batch_metadata_stream(
    odb: Odb,
    transfer: &TransferConfig,
    ids: Vec<ObjectHash>,
    compressed: bool,
) -> Result<ReceiverStream<Vec<u8>>, ZetaError> {
    let zstd_level = compressed.then_some(transfer.zstd_level);
    let (tx, rx) = mpsc::channel(PACK_CHANNEL);
    tokio::spawn(async move {
        let result = async {
            let mut sink =
                FramedSink::new(tx, StreamKind::Metadata, odb.hash_kind(), zstd_level).await?;
            PackStreamer::new(&odb)
                .write_batch_metadata(&mut sink, &ids)
                .await?;
            sink.finish().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "batch metadata stream failed");
        }
    });
    Ok(ReceiverStream::new(rx))
}

/// `objects`: one blob as a framed object stream, range-aware.
pub async fn single_object_stream(
    odb: Odb,
    oid: ObjectHash,
    offset: u64,
) -> Result<ReceiverStream<Vec<u8>>, ZetaError> {
    // Open before spawning so NotFound surfaces as a status, not a broken
    // stream.
    let mut sized = odb.open_stream(oid, offset).await?;
    let (tx, rx) = mpsc::channel(PACK_CHANNEL);
    tokio::spawn(async move {
        use futures::StreamExt;
        let result = async {
            let mut sink =
                FramedSink::new(tx, StreamKind::Object, odb.hash_kind(), None).await?;
            let mut buffer: Vec<u8> = Vec::with_capacity(BLOB_FRAME_CHUNK.min(1 << 20));
            while let Some(chunk) = sized.stream.next().await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);
                if buffer.len() >= BLOB_FRAME_CHUNK {
                    sink.item(&oid, &buffer).await?;
                    buffer.clear();
                }
            }
            if !buffer.is_empty() || sized.size == 0 {
                sink.item(&oid, &buffer).await?;
            }
            sink.finish().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(oid = %oid, error = %e, "object stream failed");
        }
    });
    Ok(ReceiverStream::new(rx))
}

/// `batch-objects`: small blobs only; oversize blobs are omitted and the
/// client falls back to single fetch or a share URL.
pub async fn batch_objects_stream(
    odb: Odb,
    transfer: &TransferConfig,
    ids: Vec<ObjectHash>,
) -> Result<ReceiverStream<Vec<u8>>, ZetaError> {
    let max = transfer.max_batch_blob_size;
    let (tx, rx) = mpsc::channel(PACK_CHANNEL);
    tokio::spawn(async move {
        let result = async {
            let mut sink = FramedSink::new(tx, StreamKind::Object, odb.hash_kind(), None).await?;
            PackStreamer::new(&odb)
                .write_batch_objects(&mut sink, &ids, max)
                .await?;
            sink.finish().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "batch object stream failed");
        }
    });
    Ok(ReceiverStream::new(rx))
}

/// `share-objects`: presigned URLs with a bounded lifetime.
pub async fn share_objects(
    odb: &Odb,
    share_ttl_secs: u64,
    ids: &[ObjectHash],
) -> Result<Vec<ShareEntry>, ZetaError> {
    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(share_ttl_secs as i64);
    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let size = odb.blob_size(*id).await?;
        let href = odb.remote().share(&odb.remote_key(id), expires_at);
        entries.push(ShareEntry {
            oid: id.to_string(),
            size,
            href,
            expires_at,
        });
    }
    Ok(entries)
}

/// `batch-check`: which of the ids the server already holds.
pub async fn batch_check(odb: &Odb, ids: &[ObjectHash]) -> Result<Vec<BatchCheckEntry>, ZetaError> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        match odb.blob_size(*id).await {
            Ok(size) => out.push(BatchCheckEntry {
                oid: id.to_string(),
                action: Operation::Download,
                size,
            }),
            Err(ZetaError::NotFound(_)) => out.push(BatchCheckEntry {
                oid: id.to_string(),
                action: Operation::Upload,
                size: 0,
            }),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Parse a newline-delimited id list request body.
pub fn parse_id_lines(body: &str) -> Result<Vec<ObjectHash>, ZetaError> {
    body.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| ObjectHash::from_str(l).map_err(ZetaError::Malformed))
        .collect()
}
