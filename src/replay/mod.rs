//! Repository replay engine: rewrites commit DAGs (drop paths, graft,
//! linearise + squash) with correct DAG preservation, then finalizes the
//! reference namespace atomically.
//!
//! A [`Rewriter`] is one replay session. Its two caches — the commit map
//! (`original id → rewritten id`) and the entry map
//! (`"<path>:<original hex>" → rewritten entry`) — are shared by every
//! pass of the session and guarded by a single mutex; the lock is never
//! held across an await point.

pub mod matcher;
pub mod refupdate;
pub mod rewrite;
pub mod unbranch;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::commit::Commit;
use crate::internal::object::tag::Tag;
use crate::internal::object::tree::{Tree, TreeEntry};
use crate::internal::object::AnyObject;

/// The store surface a replay session drives. The ODB facade implements
/// this; tests run against an in-memory map.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    fn hash_kind(&self) -> HashKind;
    async fn commit(&self, id: ObjectHash) -> Result<Commit, ZetaError>;
    async fn tree(&self, id: ObjectHash) -> Result<Tree, ZetaError>;
    async fn tag(&self, id: ObjectHash) -> Result<Tag, ZetaError>;
    async fn object(&self, id: ObjectHash) -> Result<AnyObject, ZetaError>;
    async fn write(&self, object: &AnyObject) -> Result<ObjectHash, ZetaError>;
}

#[async_trait]
impl ReplayStore for crate::odb::Odb {
    fn hash_kind(&self) -> HashKind {
        crate::odb::Odb::hash_kind(self)
    }

    async fn commit(&self, id: ObjectHash) -> Result<Commit, ZetaError> {
        crate::odb::Odb::commit(self, id).await
    }

    async fn tree(&self, id: ObjectHash) -> Result<Tree, ZetaError> {
        crate::odb::Odb::tree(self, id).await
    }

    async fn tag(&self, id: ObjectHash) -> Result<Tag, ZetaError> {
        crate::odb::Odb::tag(self, id).await
    }

    async fn object(&self, id: ObjectHash) -> Result<AnyObject, ZetaError> {
        self.objects(id).await
    }

    async fn write(&self, object: &AnyObject) -> Result<ObjectHash, ZetaError> {
        self.encode(object).await
    }
}

#[derive(Default)]
pub(crate) struct Caches {
    /// original commit id → rewritten commit id
    pub commit_map: HashMap<ObjectHash, ObjectHash>,
    /// `"<path>:<original hex>"` → rewritten entry
    pub entry_map: HashMap<String, TreeEntry>,
}

/// One replay session over a store.
pub struct Rewriter<'a, S: ReplayStore> {
    pub(crate) store: &'a S,
    pub(crate) caches: Mutex<Caches>,
}

impl<'a, S: ReplayStore> Rewriter<'a, S> {
    pub fn new(store: &'a S) -> Rewriter<'a, S> {
        Rewriter {
            store,
            caches: Mutex::new(Caches::default()),
        }
    }

    /// The rewritten id of `original`, when a pass has produced one.
    pub fn mapped(&self, original: ObjectHash) -> Option<ObjectHash> {
        self.caches
            .lock()
            .expect("replay cache lock")
            .commit_map
            .get(&original)
            .copied()
    }

    /// Snapshot of the commit map, for the reference finalizer.
    pub fn commit_map(&self) -> HashMap<ObjectHash, ObjectHash> {
        self.caches
            .lock()
            .expect("replay cache lock")
            .commit_map
            .clone()
    }

    /// Original commit ids this session superseded with a different id.
    /// The engine only marks; discarding the superseded objects is the
    /// external GC's job.
    pub fn superseded(&self) -> Vec<ObjectHash> {
        self.caches
            .lock()
            .expect("replay cache lock")
            .commit_map
            .iter()
            .filter(|(original, rewritten)| original != rewritten)
            .map(|(original, _)| *original)
            .collect()
    }

    /// Record a mapping into the session's commit map. Rewrite passes do
    /// this as they go; callers resuming a partial migration seed prior
    /// results the same way before grafting.
    pub fn record_commit(&self, original: ObjectHash, rewritten: ObjectHash) {
        self.caches
            .lock()
            .expect("replay cache lock")
            .commit_map
            .insert(original, rewritten);
    }

    pub(crate) fn cached_entry(&self, sig: &str) -> Option<TreeEntry> {
        self.caches
            .lock()
            .expect("replay cache lock")
            .entry_map
            .get(sig)
            .cloned()
    }

    pub(crate) fn record_entry(&self, sig: String, entry: TreeEntry) {
        self.caches
            .lock()
            .expect("replay cache lock")
            .entry_map
            .insert(sig, entry);
    }
}

/// Commits reachable from `tips`, parents before children (reverse
/// topological order) — the order the Drop/Graft rewriter consumes.
pub async fn topo_reverse<S: ReplayStore>(
    store: &S,
    tips: &[ObjectHash],
) -> Result<Vec<ObjectHash>, ZetaError> {
    // Collect the subgraph.
    let mut parents_of: HashMap<ObjectHash, Vec<ObjectHash>> = HashMap::new();
    let mut queue: VecDeque<ObjectHash> = tips.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if parents_of.contains_key(&id) {
            continue;
        }
        let commit = store.commit(id).await?;
        for parent in &commit.parent_ids {
            queue.push_back(*parent);
        }
        parents_of.insert(id, commit.parent_ids);
    }

    // Kahn's algorithm on the parent→child direction.
    let mut blocked: HashMap<ObjectHash, usize> = HashMap::new();
    let mut children_of: HashMap<ObjectHash, Vec<ObjectHash>> = HashMap::new();
    for (child, parents) in &parents_of {
        blocked.insert(*child, parents.len());
        for parent in parents {
            children_of.entry(*parent).or_default().push(*child);
        }
    }
    let mut ready: VecDeque<ObjectHash> = blocked
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(parents_of.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for child in children_of.get(&id).cloned().unwrap_or_default() {
            let n = blocked.get_mut(&child).expect("child was collected");
            *n -= 1;
            if *n == 0 {
                ready.push_back(child);
            }
        }
    }
    if order.len() != parents_of.len() {
        return Err(ZetaError::Fatal("commit graph contains a cycle".into()));
    }
    Ok(order)
}

/// First-parent chain from `tip` to its root, oldest first — the order
/// the linearise pass consumes.
pub async fn first_parent_chain<S: ReplayStore>(
    store: &S,
    tip: ObjectHash,
) -> Result<Vec<ObjectHash>, ZetaError> {
    let mut chain = Vec::new();
    let mut current = Some(tip);
    let mut seen = HashSet::new();
    while let Some(id) = current {
        if !seen.insert(id) {
            return Err(ZetaError::Fatal("first-parent chain contains a cycle".into()));
        }
        chain.push(id);
        current = store.commit(id).await?.parent_ids.first().copied();
    }
    chain.reverse();
    Ok(chain)
}

/// Every commit reachable from `start` through all parents.
pub(crate) async fn reachable_from<S: ReplayStore>(
    store: &S,
    start: ObjectHash,
) -> Result<HashSet<ObjectHash>, ZetaError> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        for parent in store.commit(id).await?.parent_ids {
            queue.push_back(parent);
        }
    }
    Ok(seen)
}
