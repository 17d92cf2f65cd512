//! Reference finalizer: after the rewrite passes, remap every reference
//! through the commit map — rewriting annotated tag chains along the way —
//! and issue atomic CAS updates, batched into one transaction on backends
//! that support it.

use std::collections::{HashMap, HashSet};

use crate::db::{MetaStore, RefUpdate};
use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::tag::Tag;
use crate::internal::object::AnyObject;

use super::ReplayStore;

/// Tag chains peel at most this deep while rewriting.
const MAX_TAG_CHAIN: usize = 20;

/// Compute the CAS updates the rewrite implies. References whose target
/// did not change produce no update. Duplicate names are skipped.
pub async fn plan_reference_updates<S: ReplayStore>(
    store: &S,
    commit_map: &HashMap<ObjectHash, ObjectHash>,
    refs: &[(String, ObjectHash)],
) -> Result<Vec<RefUpdate>, ZetaError> {
    // Aligned logging: pad every name to the longest one.
    let width = refs.iter().map(|(name, _)| name.len()).max().unwrap_or(0);

    let mut seen: HashSet<&str> = HashSet::new();
    let mut updates = Vec::new();
    for (name, old) in refs {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let (new, tag_meta) = rewrite_target(store, commit_map, *old, 0).await?;
        if new == *old {
            tracing::debug!("{name:width$} unchanged at {old}");
            continue;
        }
        tracing::info!("{name:width$} {old} -> {new}");
        updates.push(RefUpdate {
            name: name.clone(),
            old: *old,
            new,
            tag_meta,
        });
    }
    Ok(updates)
}

/// Remap one reference target. Annotated tags are rewritten recursively:
/// a tag-of-tag follows the chain, a tag-of-commit remaps through the
/// commit map, and only a chain that actually changed produces new tag
/// objects.
async fn rewrite_target<S: ReplayStore>(
    store: &S,
    commit_map: &HashMap<ObjectHash, ObjectHash>,
    id: ObjectHash,
    depth: usize,
) -> Result<(ObjectHash, Option<(String, String)>), ZetaError> {
    if depth > MAX_TAG_CHAIN {
        return Err(ZetaError::integrity(format!(
            "tag chain exceeds {MAX_TAG_CHAIN} levels"
        )));
    }
    match store.object(id).await? {
        AnyObject::Tag(tag) => {
            let (new_target, _) =
                Box::pin(rewrite_target(store, commit_map, tag.object, depth + 1)).await?;
            let meta = {
                let (subject, description) = tag.split_message();
                Some((subject.to_string(), description.to_string()))
            };
            if new_target == tag.object {
                return Ok((id, meta));
            }
            let new_tag = Tag::new(
                store.hash_kind(),
                new_target,
                tag.target_type,
                tag.name.clone(),
                tag.tagger.clone(),
                tag.message.clone(),
            )?;
            store.write(&AnyObject::Tag(new_tag.clone())).await?;
            Ok((new_tag.id, meta))
        }
        AnyObject::Commit(_) => Ok((commit_map.get(&id).copied().unwrap_or(id), None)),
        // Blob-targeting refs and the like pass through untouched.
        _ => Ok((id, None)),
    }
}

/// Apply planned updates: one transaction when the backend supports it,
/// per-reference CAS otherwise (each still individually atomic).
pub async fn apply_reference_updates(
    meta: &MetaStore,
    rid: i64,
    updates: &[RefUpdate],
    default_branch: &str,
) -> Result<(), ZetaError> {
    if updates.is_empty() {
        return Ok(());
    }
    if meta.supports_txn_refs() {
        meta.update_references(rid, updates, default_branch).await
    } else {
        for update in updates {
            meta.update_reference(rid, update, default_branch).await?;
        }
        Ok(())
    }
}
