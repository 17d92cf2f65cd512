//! Replay engine flows against a real object database and metadata
//! store: drop-path rewrites with reference finalization, and the
//! HEAD-only graft across a partial migration boundary.

use chrono::Utc;
use sea_orm::{ActiveValue::Set, EntityTrait};

use zeta_server::config::{DatabaseConfig, ServerConfig};
use zeta_server::db::MetaStore;
use zeta_server::hash::{HashKind, ObjectHash};
use zeta_server::internal::object::commit::Commit;
use zeta_server::internal::object::signature::Signature;
use zeta_server::internal::object::tree::{EntryMode, Tree, TreeEntry};
use zeta_server::internal::object::AnyObject;
use zeta_server::model;
use zeta_server::odb::Odb;
use zeta_server::replay::matcher::PathSetMatcher;
use zeta_server::replay::refupdate::{apply_reference_updates, plan_reference_updates};
use zeta_server::replay::{first_parent_chain, topo_reverse, Rewriter};
use zeta_server::storage::cache::MetaCache;
use zeta_server::storage::remote::RemoteStore;

const KIND: HashKind = HashKind::Sha1;

fn sig(n: &str) -> Signature {
    Signature::new(n, format!("{n}@zeta.dev"), 1700000000)
}

struct Harness {
    odb: Odb,
    meta: MetaStore,
    _storage: tempfile::TempDir,
}

async fn harness() -> Harness {
    let storage = tempfile::tempdir().unwrap();
    let config = ServerConfig::default();
    let meta = MetaStore::connect(&DatabaseConfig::default()).await.unwrap();

    let now = Utc::now();
    model::namespace::Entity::insert(model::namespace::ActiveModel {
        id: Set(1),
        path: Set("acme".into()),
        owner_id: Set(1),
        created_at: Set(now),
    })
    .exec(meta.connection())
    .await
    .unwrap();
    model::repository::Entity::insert(model::repository::ActiveModel {
        id: Set(1),
        namespace_id: Set(1),
        path: Set("core".into()),
        visibility: Set(model::Visibility::Private),
        default_branch: Set("main".into()),
        hash_algo: Set("sha1".into()),
        compression_algo: Set("zstd".into()),
        created_at: Set(now),
        updated_at: Set(now),
    })
    .exec(meta.connection())
    .await
    .unwrap();
    let repo = meta.repository_by_path("acme", "core").await.unwrap();

    let mut storage_cfg = config.storage.clone();
    storage_cfg.root = storage.path().to_path_buf();
    let odb = Odb::open(
        repo,
        &storage_cfg,
        MetaCache::new(64 << 20),
        RemoteStore::new(&config.remote),
        meta.clone(),
    )
    .unwrap();

    Harness {
        odb,
        meta,
        _storage: storage,
    }
}

async fn put_tree(odb: &Odb, entries: Vec<TreeEntry>) -> ObjectHash {
    let tree = Tree::from_entries(KIND, entries).unwrap();
    odb.encode(&AnyObject::Tree(tree.clone())).await.unwrap()
}

async fn put_commit(
    odb: &Odb,
    tree: ObjectHash,
    parents: Vec<ObjectHash>,
    msg: &str,
) -> ObjectHash {
    let commit = Commit::new(KIND, sig("a"), sig("c"), tree, parents, msg).unwrap();
    odb.encode(&AnyObject::Commit(commit.clone())).await.unwrap()
}

/// Scenario: drop `a/b/c.txt` from a one-commit repo, update `main`, and
/// observe the stale CAS conflict afterwards.
#[tokio::test]
async fn drop_path_and_finalize_refs() {
    let h = harness().await;

    let blob1 = ObjectHash::new(KIND, b"blob one");
    let blob2 = ObjectHash::new(KIND, b"blob two");
    let b = put_tree(
        &h.odb,
        vec![TreeEntry::with_size(EntryMode::Regular, blob1, "c.txt", 8)],
    )
    .await;
    let a = put_tree(&h.odb, vec![TreeEntry::new(EntryMode::Subtree, b, "b")]).await;
    let root = put_tree(
        &h.odb,
        vec![
            TreeEntry::new(EntryMode::Subtree, a, "a"),
            TreeEntry::with_size(EntryMode::Regular, blob2, "d.txt", 8),
        ],
    )
    .await;
    let c1 = put_commit(&h.odb, root, vec![], "initial\n").await;

    h.meta
        .update_branch(1, "main", ObjectHash::zero(KIND), c1)
        .await
        .unwrap();

    let rewriter = Rewriter::new(&h.odb);
    let matcher = PathSetMatcher::new(["a/b/c.txt"]);
    let order = topo_reverse(&h.odb, &[c1]).await.unwrap();
    rewriter.rewrite_commits(&matcher, &order).await.unwrap();

    let c1_new = rewriter.mapped(c1).unwrap();
    assert_ne!(c1_new, c1);

    // The rewritten commit matches the original in everything but the
    // tree.
    let old = h.odb.commit(c1).await.unwrap();
    let new = h.odb.commit(c1_new).await.unwrap();
    assert_eq!(new.message, old.message);
    assert_eq!(new.author, old.author);
    assert_ne!(new.tree_id, old.tree_id);
    let new_root = h.odb.tree(new.tree_id).await.unwrap();
    assert!(new_root.entry("d.txt").is_some());

    // Finalize: main moves to the rewritten commit.
    let refs = h.meta.list_refs(1).await.unwrap();
    let updates = plan_reference_updates(&h.odb, &rewriter.commit_map(), &refs)
        .await
        .unwrap();
    apply_reference_updates(&h.meta, 1, &updates, "main")
        .await
        .unwrap();
    assert_eq!(
        h.meta.list_refs(1).await.unwrap(),
        vec![("refs/heads/main".to_string(), c1_new)]
    );

    // A client still declaring the pre-replay hash loses the CAS race.
    let stale = h.meta.update_branch(1, "main", c1, c1_new).await.unwrap_err();
    assert!(stale.is_already_locked());
}

/// Scenario: chain P → Q → R; a migration rewrote only Q. The HEAD-only
/// graft makes R' point at Q' while P stays untouched.
#[tokio::test]
async fn graft_across_migration_boundary() {
    let h = harness().await;
    let root = put_tree(&h.odb, vec![]).await;
    let p = put_commit(&h.odb, root, vec![], "P\n").await;
    let q = put_commit(&h.odb, root, vec![p], "Q\n").await;
    let r = put_commit(&h.odb, root, vec![q], "R\n").await;

    // Stand-in for a prior migration pass that rewrote Q only.
    let q_new = put_commit(&h.odb, root, vec![p], "Q rewritten\n").await;
    let rewriter = Rewriter::new(&h.odb);
    rewriter.record_commit(q, q_new);

    let r_new = rewriter.graft_head(r).await.unwrap();
    assert_ne!(r_new, r);
    let grafted = h.odb.commit(r_new).await.unwrap();
    assert_eq!(grafted.parent_ids, vec![q_new]);
    assert_eq!(grafted.message, "R\n");
    // P is untouched.
    assert_eq!(h.odb.commit(p).await.unwrap().id, p);
}

/// Scenario: linearise over HEAD with first-parent walk through the real
/// ODB.
#[tokio::test]
async fn unbranch_through_odb() {
    let h = harness().await;
    let root = put_tree(&h.odb, vec![]).await;
    let a = put_commit(&h.odb, root, vec![], "A\n").await;
    let d = put_commit(&h.odb, root, vec![a], "D subject\n").await;
    let e = put_commit(&h.odb, root, vec![d], "E subject\n").await;
    let b = put_commit(&h.odb, root, vec![a], "B\n").await;
    let m = put_commit(&h.odb, root, vec![b, e], "Merge side\n").await;

    let rewriter = Rewriter::new(&h.odb);
    let chain = first_parent_chain(&h.odb, m).await.unwrap();
    assert_eq!(chain, vec![a, b, m]);
    let tip = rewriter.unbranch(&chain, None).await.unwrap().unwrap();

    let squashed = h.odb.commit(tip).await.unwrap();
    assert_eq!(squashed.parent_ids.len(), 1);
    assert!(squashed.message.contains("* E subject"));
    assert!(squashed.message.contains("* D subject"));
}
