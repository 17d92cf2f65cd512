//! In-memory cache of parsed metadata objects, keyed by `(repo, id)` with
//! cost-based eviction: each entry weighs roughly its decoded payload and
//! the cache holds a bounded total cost. Commits and trees are cached;
//! blob contents never are.

use std::sync::Arc;

use moka::future::Cache;

use crate::hash::ObjectHash;
use crate::internal::object::AnyObject;
use crate::internal::object::types::ObjectType;

#[derive(Clone)]
pub struct MetaCache {
    cache: Cache<(i64, ObjectHash), Arc<AnyObject>>,
}

/// Approximate in-memory weight of a parsed object.
fn weigh(object: &AnyObject) -> u32 {
    let payload = match object {
        AnyObject::Commit(c) => {
            c.message.len()
                + c.parent_ids.len() * 32
                + c.extra_headers
                    .iter()
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>()
        }
        AnyObject::Tree(t) => t
            .entries
            .iter()
            .map(|e| e.name.len() + 48)
            .sum::<usize>(),
        AnyObject::Tag(t) => t.message.len() + t.name.len(),
        AnyObject::Fragments(f) => f.chunks.len() * 40,
        AnyObject::Blob(b) => b.data.len(),
    };
    u32::try_from(payload + 96).unwrap_or(u32::MAX)
}

impl MetaCache {
    pub fn new(max_cost: u64) -> MetaCache {
        let cache = Cache::builder()
            .max_capacity(max_cost)
            .weigher(|_, v: &Arc<AnyObject>| weigh(v))
            .build();
        MetaCache { cache }
    }

    /// Insert commits and trees (and tag/fragment manifests); blobs are
    /// deliberately not retained.
    pub async fn insert(&self, repo_id: i64, object: AnyObject) {
        if object.kind() == ObjectType::Blob {
            return;
        }
        self.cache
            .insert((repo_id, object.id()), Arc::new(object))
            .await;
    }

    pub async fn get(&self, repo_id: i64, id: &ObjectHash) -> Option<Arc<AnyObject>> {
        self.cache.get(&(repo_id, *id)).await
    }

    /// Drop everything, used by `reload()` after bulk imports.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashKind;
    use crate::internal::object::blob::Blob;
    use crate::internal::object::tree::Tree;

    /// Trees are cached per repo; blobs are not.
    #[tokio::test]
    async fn caches_metadata_not_blobs() {
        let cache = MetaCache::new(1 << 20);
        let tree = Tree::from_entries(HashKind::Sha1, vec![]).unwrap();
        let blob = Blob::from_content(HashKind::Sha1, "data");

        cache.insert(1, AnyObject::Tree(tree.clone())).await;
        cache.insert(1, AnyObject::Blob(blob.clone())).await;

        assert!(cache.get(1, &tree.id).await.is_some());
        assert!(cache.get(1, &blob.id).await.is_none());
        // Same id under another repo is a different key.
        assert!(cache.get(2, &tree.id).await.is_none());
    }

    /// clear() empties the cache.
    #[tokio::test]
    async fn clear_invalidates() {
        let cache = MetaCache::new(1 << 20);
        let tree = Tree::from_entries(HashKind::Sha1, vec![]).unwrap();
        cache.insert(1, AnyObject::Tree(tree.clone())).await;
        cache.clear();
        cache.cache.run_pending_tasks().await;
        assert!(cache.get(1, &tree.id).await.is_none());
    }
}
