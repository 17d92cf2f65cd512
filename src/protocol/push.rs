//! Push handling: stream the client pack into a quarantine, prove the
//! referential integrity of the incoming DAG against main-ODB ∪
//! quarantine, promote, batch-store, and finish with a CAS reference
//! update — reporting progress on the line-oriented sideband the whole
//! way. Any failure discards the quarantine; concurrent readers never
//! observe a partially pushed object.

use std::collections::HashSet;
use std::io::Cursor;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::RefUpdate;
use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::tree::EntryMode;
use crate::internal::object::types::ObjectType;
use crate::internal::object::AnyObject;
use crate::internal::pack::decode::PackReader;
use crate::internal::pack::StreamKind;
use crate::odb::Odb;
use crate::protocol::types::{report, PushStats};
use crate::storage::quarantine::Quarantine;

/// Emit a `rate check` progress line every this many commits.
const RATE_CHECK_EVERY: usize = 64;

/// Parallel blob uploads during promotion.
const PROMOTE_UPLOAD_WORKERS: usize = 4;

pub struct PushRequest {
    pub refname: String,
    pub old: ObjectHash,
    pub new: ObjectHash,
    pub stats: Option<PushStats>,
}

/// Run one push. Protocol-level failures are reported on the sideband and
/// return `Ok`; only transport/infrastructure failures return `Err`.
pub async fn handle_push(
    odb: &Odb,
    request: &PushRequest,
    body: &[u8],
    sideband: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> Result<(), ZetaError> {
    let refname = request.refname.as_str();
    if let Some(stats) = request.stats {
        tracing::debug!(
            refname,
            metadata = stats.metadata,
            blobs = stats.blobs,
            "client push stats"
        );
    }

    // Fast CAS precheck before any unpacking.
    precheck_ref(odb, request).await?;

    if request.new.is_zero() {
        // Deletion carries no pack.
        return finalize_ref(odb, request, sideband).await;
    }

    // 1. Unpack into quarantine.
    let quarantine = odb.quarantine()?;
    let (_, has_tip) = match unpack_into(odb, &quarantine, body, request.new) {
        Ok(out) => out,
        Err(e) => {
            send(sideband, report::ng(refname, &e.public_message())).await?;
            return Ok(());
        }
    };
    // A branch may also be created onto a commit the server already has.
    if !has_tip && !odb.has_object(request.new).await? {
        send(
            sideband,
            report::ng(refname, &format!("commit '{}' not included in pack", request.new)),
        )
        .await?;
        return Ok(());
    }
    send(sideband, report::unpack_ok()).await?;

    // 2. Integrity walk over the union.
    if let Err(e) = verify_integrity(odb, &quarantine, request, sideband).await {
        match e {
            ZetaError::Integrity(reason)
            | ZetaError::NotFound(reason)
            | ZetaError::Malformed(reason) => {
                send(sideband, report::ng(refname, &reason)).await?;
                return Ok(()); // quarantine dropped here
            }
            other => return Err(other),
        }
    }

    // 3. Promote and batch-store.
    promote_and_store(odb, quarantine, cancel).await?;
    odb.reload();

    // 4. Reference CAS and final report.
    finalize_ref(odb, request, sideband).await
}

/// The declared `old` must match the server's view before any work: a
/// zero old creates, anything else must equal the stored hash.
async fn precheck_ref(odb: &Odb, request: &PushRequest) -> Result<(), ZetaError> {
    let current = match odb.meta().resolve_ref(odb.repo(), &request.refname).await {
        Ok((_, hash)) => Some(hash),
        Err(ZetaError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    match (current, request.old.is_zero()) {
        (None, true) => Ok(()),
        (None, false) => Err(ZetaError::conflict(format!(
            "{} does not exist on the remote",
            request.refname
        ))),
        (Some(_), true) => Err(ZetaError::conflict(format!(
            "{} already exists on the remote",
            request.refname
        ))),
        (Some(current), false) if current == request.old => Ok(()),
        (Some(current), false) => Err(ZetaError::conflict(format!(
            "{} is at {current}, not {}",
            request.refname, request.old
        ))),
    }
}

/// Decode the push payload — a metadata pack optionally followed by an
/// object pack — verifying every item's hash and staging it.
fn unpack_into(
    odb: &Odb,
    quarantine: &Quarantine,
    body: &[u8],
    tip: ObjectHash,
) -> Result<(HashSet<ObjectHash>, bool), ZetaError> {
    let hash_kind = odb.hash_kind();
    let mut commits = HashSet::new();
    let mut has_tip = false;
    let mut cursor = Cursor::new(body);

    let mut reader = PackReader::new(&mut cursor, hash_kind)?;
    if reader.kind() != StreamKind::Metadata {
        return Err(ZetaError::malformed("push must start with a metadata pack"));
    }
    while let Some((id, payload)) = reader.next_item()? {
        let computed = ObjectHash::new(hash_kind, &payload);
        if computed != id {
            return Err(ZetaError::integrity(format!(
                "object '{id}' hashes to {computed}"
            )));
        }
        let object = AnyObject::parse_canonical(&payload, hash_kind)?;
        if !object.kind().is_metadata() {
            return Err(ZetaError::integrity(format!(
                "{} '{id}' on the metadata stream",
                object.kind()
            )));
        }
        if object.kind() == ObjectType::Commit {
            commits.insert(id);
            if id == tip {
                has_tip = true;
            }
        }
        quarantine.store().write_canonical(&payload)?;
    }
    drop(reader);

    // Anything after the metadata trailer is the blob pack.
    if (cursor.position() as usize) < body.len() {
        let mut reader = PackReader::new(&mut cursor, hash_kind)?;
        if reader.kind() != StreamKind::Object {
            return Err(ZetaError::malformed("expected an object pack after metadata"));
        }
        let mut pending: Option<(ObjectHash, Vec<u8>)> = None;
        while let Some((id, payload)) = reader.next_item()? {
            match &mut pending {
                Some((pending_id, content)) if *pending_id == id => {
                    content.extend(payload);
                }
                _ => {
                    if let Some((done_id, content)) = pending.take() {
                        stage_blob(quarantine, hash_kind, done_id, content)?;
                    }
                    pending = Some((id, payload));
                }
            }
        }
        if let Some((done_id, content)) = pending.take() {
            stage_blob(quarantine, hash_kind, done_id, content)?;
        }
    }

    Ok((commits, has_tip))
}

fn stage_blob(
    quarantine: &Quarantine,
    hash_kind: crate::hash::HashKind,
    id: ObjectHash,
    content: Vec<u8>,
) -> Result<(), ZetaError> {
    let computed = ObjectHash::from_type_and_data(hash_kind, ObjectType::Blob, &content);
    if computed != id {
        return Err(ZetaError::integrity(format!(
            "blob '{id}' hashes to {computed}"
        )));
    }
    let staged = quarantine
        .store()
        .write_blob_stream(&mut &content[..], content.len() as u64)?;
    debug_assert_eq!(staged, id);
    Ok(())
}

/// Walk the new tip backwards. Reaching `old` (on an update) or a commit
/// the main ODB already holds proves that subgraph; everything newly
/// introduced must resolve completely inside main ∪ quarantine.
async fn verify_integrity(
    odb: &Odb,
    quarantine: &Quarantine,
    request: &PushRequest,
    sideband: &mpsc::Sender<String>,
) -> Result<(), ZetaError> {
    let mut queue = vec![request.new];
    let mut seen_commits: HashSet<ObjectHash> = HashSet::new();
    let mut seen_trees: HashSet<ObjectHash> = HashSet::new();
    let mut checked = 0usize;

    while let Some(id) = queue.pop() {
        if !seen_commits.insert(id) {
            continue;
        }
        if !request.old.is_zero() && id == request.old {
            // Integrity proved up to the previous tip.
            continue;
        }
        if !quarantine.store().contains(&id) && odb.has_object(id).await? {
            // Already present in the main ODB; known good.
            continue;
        }

        checked += 1;
        if checked % RATE_CHECK_EVERY == 0 {
            send(sideband, report::rate_check(&id)).await?;
        }

        let commit = match load_union(odb, quarantine, id).await? {
            AnyObject::Commit(c) => c,
            other => {
                return Err(ZetaError::integrity(format!(
                    "'{id}' is a {}, expected commit",
                    other.kind()
                )));
            }
        };
        verify_tree(odb, quarantine, commit.tree_id, &mut seen_trees).await?;
        queue.extend(commit.parent_ids);
    }
    Ok(())
}

/// Check a tree and everything it references against the union.
async fn verify_tree(
    odb: &Odb,
    quarantine: &Quarantine,
    tree_id: ObjectHash,
    seen: &mut HashSet<ObjectHash>,
) -> Result<(), ZetaError> {
    if !seen.insert(tree_id) {
        return Ok(());
    }
    let tree = match load_union(odb, quarantine, tree_id).await? {
        AnyObject::Tree(t) => t,
        other => {
            return Err(ZetaError::integrity(format!(
                "'{tree_id}' is a {}, expected tree",
                other.kind()
            )));
        }
    };
    for entry in &tree.entries {
        match entry.mode {
            EntryMode::Subtree => {
                Box::pin(verify_tree(odb, quarantine, entry.id, seen)).await?;
            }
            EntryMode::Regular | EntryMode::Executable | EntryMode::Symlink => {
                if !exists_union(odb, quarantine, entry.id).await? {
                    return Err(ZetaError::integrity(format!(
                        "blob '{}' not exists",
                        entry.id
                    )));
                }
            }
            EntryMode::Fragments => {
                let manifest = match load_union(odb, quarantine, entry.id).await {
                    Ok(AnyObject::Fragments(f)) => f,
                    Ok(other) => {
                        return Err(ZetaError::integrity(format!(
                            "'{}' is a {}, expected fragments",
                            entry.id,
                            other.kind()
                        )));
                    }
                    Err(_) => {
                        return Err(ZetaError::integrity(format!(
                            "fragments '{}' not exists",
                            entry.id
                        )));
                    }
                };
                for chunk in &manifest.chunks {
                    if !exists_union(odb, quarantine, chunk.id).await? {
                        return Err(ZetaError::integrity(format!(
                            "blob '{}' not exists",
                            chunk.id
                        )));
                    }
                }
            }
            // Pointers into other repositories are not resolvable here.
            EntryMode::Submodule => {}
        }
    }
    Ok(())
}

async fn load_union(
    odb: &Odb,
    quarantine: &Quarantine,
    id: ObjectHash,
) -> Result<AnyObject, ZetaError> {
    if quarantine.store().contains(&id) {
        return quarantine.store().read_object(&id);
    }
    odb.objects(id).await
}

async fn exists_union(
    odb: &Odb,
    quarantine: &Quarantine,
    id: ObjectHash,
) -> Result<bool, ZetaError> {
    if quarantine.store().contains(&id) {
        return Ok(true);
    }
    odb.has_object(id).await
}

/// Move staged objects into the main store, then mirror them out: blobs
/// to the remote store with bounded parallelism, metadata to the DB.
async fn promote_and_store(
    odb: &Odb,
    quarantine: Quarantine,
    cancel: &CancellationToken,
) -> Result<(), ZetaError> {
    use futures::stream::{self, StreamExt, TryStreamExt};

    let promoted = quarantine.promote(odb.loose())?;

    let mut metadata = Vec::new();
    let mut blobs = Vec::new();
    for id in promoted {
        let object = odb.loose().read_object(&id)?;
        if object.kind() == ObjectType::Blob {
            blobs.push(id);
        } else {
            metadata.push(object);
        }
    }

    stream::iter(blobs.into_iter().map(Ok::<_, ZetaError>))
        .try_for_each_concurrent(PROMOTE_UPLOAD_WORKERS, |id| async move {
            let key = odb.remote_key(&id);
            let (path, offset, len) = odb.loose().blob_location(&id)?;
            if !odb.remote().exists(&key).await? {
                odb.remote()
                    .linear_upload(&key, &path, offset, len, "application/octet-stream", cancel)
                    .await?;
            }
            odb.meta().record_blob(odb.rid(), id, len).await
        })
        .await?;

    odb.meta().store_metadata_batch(odb.rid(), &metadata).await
}

/// Final CAS and report lines.
async fn finalize_ref(
    odb: &Odb,
    request: &PushRequest,
    sideband: &mpsc::Sender<String>,
) -> Result<(), ZetaError> {
    let refname = request.refname.as_str();

    // Annotated-tag targets carry their subject/description into the row.
    let tag_meta = if request.new.is_zero() {
        None
    } else {
        match odb.objects(request.new).await {
            Ok(AnyObject::Tag(tag)) => {
                let (subject, description) = tag.split_message();
                Some((subject.to_string(), description.to_string()))
            }
            _ => None,
        }
    };

    let update = RefUpdate {
        name: refname.to_string(),
        old: request.old,
        new: request.new,
        tag_meta,
    };
    send(sideband, report::objects_verified()).await?;
    match odb
        .meta()
        .update_reference(odb.rid(), &update, &odb.repo().default_branch)
        .await
    {
        Ok(()) => send(sideband, report::ok(refname, &request.new)).await,
        Err(e) if e.status() < 500 => {
            send(sideband, report::ng(refname, &e.public_message())).await
        }
        Err(e) => Err(e),
    }
}

async fn send(sideband: &mpsc::Sender<String>, line: String) -> Result<(), ZetaError> {
    sideband
        .send(line)
        .await
        .map_err(|_| ZetaError::Transient("push report receiver went away".into()))
}
