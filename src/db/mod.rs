//! Metadata store: repositories, users, memberships and the reference
//! namespace, all behind compare-and-swap updates.
//!
//! Every reference mutation is conditioned on the previous hash:
//!
//! * `old = zero` inserts; a unique-key conflict is `Conflict`.
//! * `new = zero` deletes inside a transaction; zero rows affected is
//!   `Conflict`.
//! * otherwise updates `WHERE hash = old`; a differing stored hash is
//!   reported before writing, and zero rows affected is `Conflict`.
//!
//! Parsed metadata bodies (commits, trees, tags, fragments) are mirrored
//! into per-kind tables so the pack encoder can serve them without
//! touching the blob store.

use chrono::Utc;
use sea_orm::sea_query::{Expr, Index, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, Database, DatabaseConnection,
    DatabaseTransaction, DbErr, EntityTrait, QueryFilter, Schema, TransactionTrait,
};

use crate::config::DatabaseConfig;
use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::internal::object::types::ObjectType;
use crate::internal::object::AnyObject;
use crate::model::{
    branch, commit_row, deploy_key, email, member, namespace, object_row, refext, repository,
    ssh_key, tag, tree_row, user, Visibility,
};

/// Access levels a user can hold on a namespace or repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    None = 0,
    Reporter = 20,
    Developer = 30,
    Master = 40,
    Owner = 50,
}

impl AccessLevel {
    pub fn from_i32(value: i32) -> AccessLevel {
        match value {
            v if v >= 50 => AccessLevel::Owner,
            v if v >= 40 => AccessLevel::Master,
            v if v >= 30 => AccessLevel::Developer,
            v if v >= 20 => AccessLevel::Reporter,
            _ => AccessLevel::None,
        }
    }

    pub fn can_read(&self) -> bool {
        *self >= AccessLevel::Reporter
    }

    pub fn can_write(&self) -> bool {
        *self >= AccessLevel::Developer
    }
}

/// Which table a reference name lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKind {
    Branch(String),
    Tag(String),
    Other(String),
}

impl RefKind {
    /// Dispatch a fully qualified reference name by prefix.
    pub fn parse(refname: &str) -> RefKind {
        if let Some(name) = refname.strip_prefix("refs/heads/") {
            RefKind::Branch(name.to_string())
        } else if let Some(name) = refname.strip_prefix("refs/tags/") {
            RefKind::Tag(name.to_string())
        } else {
            RefKind::Other(refname.to_string())
        }
    }

    pub fn full_name(&self) -> String {
        match self {
            RefKind::Branch(name) => format!("refs/heads/{name}"),
            RefKind::Tag(name) => format!("refs/tags/{name}"),
            RefKind::Other(name) => name.clone(),
        }
    }
}

/// One CAS reference update.
#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub name: String,
    pub old: ObjectHash,
    pub new: ObjectHash,
    /// `(subject, description)` copied from an annotated tag's message.
    pub tag_meta: Option<(String, String)>,
}

#[derive(Clone)]
pub struct MetaStore {
    db: DatabaseConnection,
}

impl MetaStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<MetaStore, ZetaError> {
        let mut options = sea_orm::ConnectOptions::new(cfg.url.clone());
        // An in-memory sqlite exists per connection; more than one would
        // each see an empty schema.
        let max = if cfg.url.contains(":memory:") {
            1
        } else {
            cfg.max_connections
        };
        options.max_connections(max);
        let db = Database::connect(options).await?;
        let store = MetaStore { db };
        store.bootstrap().await?;
        Ok(store)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Whether batched reference updates can share one transaction.
    pub fn supports_txn_refs(&self) -> bool {
        true
    }

    /// Create tables and unique indexes when missing.
    async fn bootstrap(&self) -> Result<(), ZetaError> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        macro_rules! create {
            ($entity:expr) => {{
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            }};
        }
        create!(namespace::Entity);
        create!(repository::Entity);
        create!(user::Entity);
        create!(member::Entity);
        create!(branch::Entity);
        create!(tag::Entity);
        create!(refext::Entity);
        create!(ssh_key::Entity);
        create!(email::Entity);
        create!(deploy_key::Entity);
        create!(commit_row::Entity);
        create!(tree_row::Entity);
        create!(object_row::Entity);

        let indexes = [
            Index::create()
                .name("uniq_branches_rid_name")
                .table(branch::Entity)
                .col(branch::Column::Rid)
                .col(branch::Column::Name)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_tags_rid_name")
                .table(tag::Entity)
                .col(tag::Column::Rid)
                .col(tag::Column::Name)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_refs_rid_name")
                .table(refext::Entity)
                .col(refext::Column::Rid)
                .col(refext::Column::Name)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_repositories_ns_path")
                .table(repository::Entity)
                .col(repository::Column::NamespaceId)
                .col(repository::Column::Path)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_commits_rid_hash")
                .table(commit_row::Entity)
                .col(commit_row::Column::Rid)
                .col(commit_row::Column::Hash)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_trees_rid_hash")
                .table(tree_row::Entity)
                .col(tree_row::Column::Rid)
                .col(tree_row::Column::Hash)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uniq_objects_rid_hash")
                .table(object_row::Entity)
                .col(object_row::Column::Rid)
                .col(object_row::Column::Hash)
                .unique()
                .if_not_exists()
                .to_owned(),
        ];
        for idx in indexes {
            self.db.execute(backend.build(&idx)).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference CAS
    // ------------------------------------------------------------------

    /// Dispatch an update to the branch/tag/other path by name prefix.
    pub async fn update_reference(
        &self,
        rid: i64,
        update: &RefUpdate,
        default_branch: &str,
    ) -> Result<(), ZetaError> {
        let txn = self.db.begin().await?;
        self.update_reference_in(&txn, rid, update, default_branch)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Apply several updates inside one transaction: either all land or
    /// none do.
    pub async fn update_references(
        &self,
        rid: i64,
        updates: &[RefUpdate],
        default_branch: &str,
    ) -> Result<(), ZetaError> {
        let txn = self.db.begin().await?;
        for update in updates {
            self.update_reference_in(&txn, rid, update, default_branch)
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn update_reference_in(
        &self,
        txn: &DatabaseTransaction,
        rid: i64,
        update: &RefUpdate,
        default_branch: &str,
    ) -> Result<(), ZetaError> {
        match RefKind::parse(&update.name) {
            RefKind::Branch(name) => {
                if update.new.is_zero() && name == default_branch {
                    return Err(ZetaError::conflict(format!(
                        "refusing to delete default branch {name}"
                    )));
                }
                self.update_branch_in(txn, rid, &name, update.old, update.new)
                    .await
            }
            RefKind::Tag(name) => {
                let (subject, description) = update
                    .tag_meta
                    .clone()
                    .unwrap_or((String::new(), String::new()));
                self.update_tag_in(txn, rid, &name, update.old, update.new, subject, description)
                    .await
            }
            RefKind::Other(name) => {
                self.update_other_ref_in(txn, rid, &name, update.old, update.new)
                    .await
            }
        }
    }

    pub async fn update_branch(
        &self,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
    ) -> Result<(), ZetaError> {
        let txn = self.db.begin().await?;
        self.update_branch_in(&txn, rid, name, old, new).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn update_branch_in(
        &self,
        txn: &DatabaseTransaction,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
    ) -> Result<(), ZetaError> {
        if old.is_zero() {
            let now = Utc::now();
            let row = branch::ActiveModel {
                rid: Set(rid),
                name: Set(name.to_string()),
                hash: Set(new.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            return insert_cas(branch::Entity::insert(row), txn, name).await;
        }

        let current = branch::Entity::find()
            .filter(branch::Column::Rid.eq(rid))
            .filter(branch::Column::Name.eq(name))
            .one(txn)
            .await?;
        let Some(current) = current else {
            return Err(ZetaError::conflict(format!(
                "branch {name} vanished under CAS"
            )));
        };
        if current.hash != old.to_string() {
            // Report the race before writing anything.
            return Err(ZetaError::conflict(format!(
                "branch {name} moved to {}",
                current.hash
            )));
        }

        if new.is_zero() {
            let deleted = branch::Entity::delete_many()
                .filter(branch::Column::Rid.eq(rid))
                .filter(branch::Column::Name.eq(name))
                .filter(branch::Column::Hash.eq(old.to_string()))
                .exec(txn)
                .await?;
            if deleted.rows_affected == 0 {
                return Err(ZetaError::conflict(format!("branch {name} already locked")));
            }
            return Ok(());
        }

        let updated = branch::Entity::update_many()
            .col_expr(branch::Column::Hash, Expr::value(new.to_string()))
            .col_expr(branch::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(branch::Column::Rid.eq(rid))
            .filter(branch::Column::Name.eq(name))
            .filter(branch::Column::Hash.eq(old.to_string()))
            .exec(txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ZetaError::conflict(format!("branch {name} already locked")));
        }
        Ok(())
    }

    pub async fn update_tag(
        &self,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
        subject: String,
        description: String,
    ) -> Result<(), ZetaError> {
        let txn = self.db.begin().await?;
        self.update_tag_in(&txn, rid, name, old, new, subject, description)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn update_tag_in(
        &self,
        txn: &DatabaseTransaction,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
        subject: String,
        description: String,
    ) -> Result<(), ZetaError> {
        if old.is_zero() {
            let now = Utc::now();
            let row = tag::ActiveModel {
                rid: Set(rid),
                name: Set(name.to_string()),
                hash: Set(new.to_string()),
                subject: Set(subject),
                description: Set(description),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            return insert_cas(tag::Entity::insert(row), txn, name).await;
        }

        let current = tag::Entity::find()
            .filter(tag::Column::Rid.eq(rid))
            .filter(tag::Column::Name.eq(name))
            .one(txn)
            .await?;
        let Some(current) = current else {
            return Err(ZetaError::conflict(format!("tag {name} vanished under CAS")));
        };
        if current.hash != old.to_string() {
            return Err(ZetaError::conflict(format!(
                "tag {name} moved to {}",
                current.hash
            )));
        }

        if new.is_zero() {
            let deleted = tag::Entity::delete_many()
                .filter(tag::Column::Rid.eq(rid))
                .filter(tag::Column::Name.eq(name))
                .filter(tag::Column::Hash.eq(old.to_string()))
                .exec(txn)
                .await?;
            if deleted.rows_affected == 0 {
                return Err(ZetaError::conflict(format!("tag {name} already locked")));
            }
            return Ok(());
        }

        let updated = tag::Entity::update_many()
            .col_expr(tag::Column::Hash, Expr::value(new.to_string()))
            .col_expr(tag::Column::Subject, Expr::value(subject))
            .col_expr(tag::Column::Description, Expr::value(description))
            .col_expr(tag::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(tag::Column::Rid.eq(rid))
            .filter(tag::Column::Name.eq(name))
            .filter(tag::Column::Hash.eq(old.to_string()))
            .exec(txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ZetaError::conflict(format!("tag {name} already locked")));
        }
        Ok(())
    }

    pub async fn update_other_ref(
        &self,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
    ) -> Result<(), ZetaError> {
        let txn = self.db.begin().await?;
        self.update_other_ref_in(&txn, rid, name, old, new).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn update_other_ref_in(
        &self,
        txn: &DatabaseTransaction,
        rid: i64,
        name: &str,
        old: ObjectHash,
        new: ObjectHash,
    ) -> Result<(), ZetaError> {
        if old.is_zero() {
            let now = Utc::now();
            let row = refext::ActiveModel {
                rid: Set(rid),
                name: Set(name.to_string()),
                hash: Set(new.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            return insert_cas(refext::Entity::insert(row), txn, name).await;
        }

        let current = refext::Entity::find()
            .filter(refext::Column::Rid.eq(rid))
            .filter(refext::Column::Name.eq(name))
            .one(txn)
            .await?;
        let Some(current) = current else {
            return Err(ZetaError::conflict(format!("ref {name} vanished under CAS")));
        };
        if current.hash != old.to_string() {
            return Err(ZetaError::conflict(format!(
                "ref {name} moved to {}",
                current.hash
            )));
        }

        if new.is_zero() {
            let deleted = refext::Entity::delete_many()
                .filter(refext::Column::Rid.eq(rid))
                .filter(refext::Column::Name.eq(name))
                .filter(refext::Column::Hash.eq(old.to_string()))
                .exec(txn)
                .await?;
            if deleted.rows_affected == 0 {
                return Err(ZetaError::conflict(format!("ref {name} already locked")));
            }
            return Ok(());
        }

        let updated = refext::Entity::update_many()
            .col_expr(refext::Column::Hash, Expr::value(new.to_string()))
            .col_expr(refext::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(refext::Column::Rid.eq(rid))
            .filter(refext::Column::Name.eq(name))
            .filter(refext::Column::Hash.eq(old.to_string()))
            .exec(txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ZetaError::conflict(format!("ref {name} already locked")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference reads
    // ------------------------------------------------------------------

    /// Resolve a reference name to its stored hash. `HEAD` follows the
    /// default branch; bare names try `refs/heads/` then `refs/tags/`.
    pub async fn resolve_ref(
        &self,
        repo: &repository::Model,
        refname: &str,
    ) -> Result<(String, ObjectHash), ZetaError> {
        // HEAD is a symbolic pointer at the default branch.
        let target = if refname == "HEAD" {
            format!("refs/heads/{}", repo.default_branch)
        } else {
            refname.to_string()
        };
        let refname = target.as_str();
        match RefKind::parse(refname) {
            RefKind::Branch(name) => {
                let row = branch::Entity::find()
                    .filter(branch::Column::Rid.eq(repo.id))
                    .filter(branch::Column::Name.eq(&name))
                    .one(&self.db)
                    .await?;
                match row {
                    Some(row) => Ok((format!("refs/heads/{name}"), parse_hash(&row.hash)?)),
                    None => Err(ZetaError::not_found(format!("reference {refname}"))),
                }
            }
            RefKind::Tag(name) => {
                let row = tag::Entity::find()
                    .filter(tag::Column::Rid.eq(repo.id))
                    .filter(tag::Column::Name.eq(&name))
                    .one(&self.db)
                    .await?;
                match row {
                    Some(row) => Ok((format!("refs/tags/{name}"), parse_hash(&row.hash)?)),
                    None => Err(ZetaError::not_found(format!("reference {refname}"))),
                }
            }
            RefKind::Other(name) if name.starts_with("refs/") => {
                let row = refext::Entity::find()
                    .filter(refext::Column::Rid.eq(repo.id))
                    .filter(refext::Column::Name.eq(&name))
                    .one(&self.db)
                    .await?;
                match row {
                    Some(row) => Ok((name, parse_hash(&row.hash)?)),
                    None => Err(ZetaError::not_found(format!("reference {refname}"))),
                }
            }
            // Short name: branch first, then tag.
            RefKind::Other(name) => {
                let as_branch = format!("refs/heads/{name}");
                match Box::pin(self.resolve_ref(repo, &as_branch)).await {
                    Ok(found) => Ok(found),
                    Err(ZetaError::NotFound(_)) => {
                        let as_tag = format!("refs/tags/{name}");
                        Box::pin(self.resolve_ref(repo, &as_tag)).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// All references of a repository as `(full name, hash)` pairs.
    pub async fn list_refs(&self, rid: i64) -> Result<Vec<(String, ObjectHash)>, ZetaError> {
        let mut out = Vec::new();
        for row in branch::Entity::find()
            .filter(branch::Column::Rid.eq(rid))
            .all(&self.db)
            .await?
        {
            out.push((format!("refs/heads/{}", row.name), parse_hash(&row.hash)?));
        }
        for row in tag::Entity::find()
            .filter(tag::Column::Rid.eq(rid))
            .all(&self.db)
            .await?
        {
            out.push((format!("refs/tags/{}", row.name), parse_hash(&row.hash)?));
        }
        for row in refext::Entity::find()
            .filter(refext::Column::Rid.eq(rid))
            .all(&self.db)
            .await?
        {
            out.push((row.name, parse_hash(&row.hash)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Entity lookups
    // ------------------------------------------------------------------

    pub async fn repository_by_path(
        &self,
        ns_path: &str,
        repo_path: &str,
    ) -> Result<repository::Model, ZetaError> {
        let ns = namespace::Entity::find()
            .filter(namespace::Column::Path.eq(ns_path))
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found(format!("namespace {ns_path}")))?;
        repository::Entity::find()
            .filter(repository::Column::NamespaceId.eq(ns.id))
            .filter(repository::Column::Path.eq(repo_path))
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found(format!("repository {ns_path}/{repo_path}")))
    }

    pub async fn user_by_name(&self, username: &str) -> Result<user::Model, ZetaError> {
        user::Entity::find()
            .filter(user::Column::Username.eq(username))
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found(format!("user {username}")))
    }

    pub async fn user_by_ssh_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<user::Model, ZetaError> {
        let key = ssh_key::Entity::find()
            .filter(ssh_key::Column::Fingerprint.eq(fingerprint))
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found(format!("ssh key {fingerprint}")))?;
        user::Entity::find_by_id(key.user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found("ssh key owner"))
    }

    /// The effective access level: the greater of the namespace-scope and
    /// repository-scope grants, with `internal` visibility granting
    /// Reporter to every non-remote signed-in user and public/anonymous
    /// repositories readable by everyone.
    pub async fn access_level(
        &self,
        who: Option<&user::Model>,
        repo: &repository::Model,
    ) -> Result<AccessLevel, ZetaError> {
        let Some(who) = who else {
            return Ok(match repo.visibility {
                Visibility::Anonymous => AccessLevel::Reporter,
                _ => AccessLevel::None,
            });
        };
        if who.locked {
            return Ok(AccessLevel::None);
        }

        let ns = namespace::Entity::find_by_id(repo.namespace_id)
            .one(&self.db)
            .await?;
        let mut level = AccessLevel::None;
        if let Some(ns) = &ns {
            if ns.owner_id == who.id {
                level = AccessLevel::Owner;
            }
        }

        let grants = member::Entity::find()
            .filter(member::Column::UserId.eq(who.id))
            .all(&self.db)
            .await?;
        for grant in grants {
            let applies = match grant.source_type {
                member::SourceType::Namespace => grant.source_id == repo.namespace_id,
                member::SourceType::Repository => grant.source_id == repo.id,
            };
            if applies {
                level = level.max(AccessLevel::from_i32(grant.access_level));
            }
        }

        let implicit = match repo.visibility {
            Visibility::Public | Visibility::Anonymous => AccessLevel::Reporter,
            Visibility::Internal if !who.remote => AccessLevel::Reporter,
            _ => AccessLevel::None,
        };
        Ok(level.max(implicit))
    }

    // ------------------------------------------------------------------
    // Metadata bodies
    // ------------------------------------------------------------------

    /// Mirror one parsed object's canonical body into its table.
    pub async fn store_metadata(&self, rid: i64, object: &AnyObject) -> Result<(), ZetaError> {
        self.store_metadata_batch(rid, std::slice::from_ref(object))
            .await
    }

    /// Batched per-kind writes, run concurrently; a failure reports which
    /// kind broke so operators can tell the tables apart.
    pub async fn store_metadata_batch(
        &self,
        rid: i64,
        objects: &[AnyObject],
    ) -> Result<(), ZetaError> {
        let now = Utc::now();
        let mut commits = Vec::new();
        let mut trees = Vec::new();
        let mut others = Vec::new();
        for object in objects {
            let hash = object.id().to_string();
            match object {
                AnyObject::Commit(_) => commits.push(commit_row::ActiveModel {
                    rid: Set(rid),
                    hash: Set(hash),
                    data: Set(object.to_data()?),
                    created_at: Set(now),
                    ..Default::default()
                }),
                AnyObject::Tree(_) => trees.push(tree_row::ActiveModel {
                    rid: Set(rid),
                    hash: Set(hash),
                    data: Set(object.to_data()?),
                    created_at: Set(now),
                    ..Default::default()
                }),
                AnyObject::Tag(_) | AnyObject::Fragments(_) => {
                    let data = object.to_data()?;
                    others.push(object_row::ActiveModel {
                        rid: Set(rid),
                        hash: Set(hash),
                        kind: Set(object.kind().to_string()),
                        size: Set(data.len() as i64),
                        data: Set(Some(data)),
                        created_at: Set(now),
                        ..Default::default()
                    });
                }
                AnyObject::Blob(b) => others.push(object_row::ActiveModel {
                    rid: Set(rid),
                    hash: Set(hash),
                    kind: Set(ObjectType::Blob.to_string()),
                    size: Set(b.data.len() as i64),
                    data: Set(None),
                    created_at: Set(now),
                    ..Default::default()
                }),
            }
        }

        let write_commits = async {
            insert_ignore_dupes(commits, &self.db)
                .await
                .map_err(|e| ZetaError::Fatal(format!("commit batch failed: {e}")))
        };
        let write_trees = async {
            insert_ignore_dupes(trees, &self.db)
                .await
                .map_err(|e| ZetaError::Fatal(format!("tree batch failed: {e}")))
        };
        let write_others = async {
            insert_ignore_dupes(others, &self.db)
                .await
                .map_err(|e| ZetaError::Fatal(format!("object batch failed: {e}")))
        };
        let (c, t, o) = tokio::join!(write_commits, write_trees, write_others);
        c?;
        t?;
        o?;
        Ok(())
    }

    /// Record a blob's existence and size without a body.
    pub async fn record_blob(
        &self,
        rid: i64,
        hash: ObjectHash,
        size: u64,
    ) -> Result<(), ZetaError> {
        let row = object_row::ActiveModel {
            rid: Set(rid),
            hash: Set(hash.to_string()),
            kind: Set(ObjectType::Blob.to_string()),
            size: Set(size as i64),
            data: Set(None),
            created_at: Set(Utc::now()),
            ..Default::default()
        };
        insert_ignore_dupes(vec![row], &self.db).await?;
        Ok(())
    }

    pub async fn blob_size(&self, rid: i64, hash: ObjectHash) -> Result<u64, ZetaError> {
        let row = object_row::Entity::find()
            .filter(object_row::Column::Rid.eq(rid))
            .filter(object_row::Column::Hash.eq(hash.to_string()))
            .one(&self.db)
            .await?
            .ok_or_else(|| ZetaError::not_found(format!("object {hash}")))?;
        Ok(row.size as u64)
    }

    /// Load a metadata body by id, searching commits, trees, then the
    /// object table.
    pub async fn metadata_bytes(
        &self,
        rid: i64,
        hash: ObjectHash,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, ZetaError> {
        let hex = hash.to_string();
        if let Some(row) = commit_row::Entity::find()
            .filter(commit_row::Column::Rid.eq(rid))
            .filter(commit_row::Column::Hash.eq(&hex))
            .one(&self.db)
            .await?
        {
            return Ok(Some((ObjectType::Commit, row.data)));
        }
        if let Some(row) = tree_row::Entity::find()
            .filter(tree_row::Column::Rid.eq(rid))
            .filter(tree_row::Column::Hash.eq(&hex))
            .one(&self.db)
            .await?
        {
            return Ok(Some((ObjectType::Tree, row.data)));
        }
        if let Some(row) = object_row::Entity::find()
            .filter(object_row::Column::Rid.eq(rid))
            .filter(object_row::Column::Hash.eq(&hex))
            .one(&self.db)
            .await?
        {
            let kind = ObjectType::from_token(row.kind.as_bytes())?;
            if let Some(data) = row.data {
                return Ok(Some((kind, data)));
            }
        }
        Ok(None)
    }
}

/// Insert helper for CAS creates: a unique conflict is a lock, not an
/// internal error.
async fn insert_cas<A>(
    insert: sea_orm::Insert<A>,
    txn: &DatabaseTransaction,
    name: &str,
) -> Result<(), ZetaError>
where
    A: sea_orm::ActiveModelTrait + Send,
    <A::Entity as EntityTrait>::Model: sea_orm::IntoActiveModel<A> + Send,
{
    match insert.exec(txn).await {
        Ok(_) => Ok(()),
        Err(DbErr::RecordNotInserted) => {
            Err(ZetaError::conflict(format!("{name} already locked")))
        }
        Err(e) if is_unique_violation(&e) => {
            Err(ZetaError::conflict(format!("{name} already locked")))
        }
        Err(e) => Err(e.into()),
    }
}

/// Batch insert ignoring rows that already exist.
async fn insert_ignore_dupes<A>(rows: Vec<A>, db: &DatabaseConnection) -> Result<(), ZetaError>
where
    A: sea_orm::ActiveModelTrait + Send,
    <A::Entity as EntityTrait>::Model: sea_orm::IntoActiveModel<A> + Send,
{
    if rows.is_empty() {
        return Ok(());
    }
    match <A::Entity as EntityTrait>::insert_many(rows)
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec(db)
        .await
    {
        Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err, DbErr::Exec(runtime) if runtime.to_string().to_ascii_lowercase().contains("unique"))
}

fn parse_hash(hex: &str) -> Result<ObjectHash, ZetaError> {
    hex.parse::<ObjectHash>()
        .map_err(|e| ZetaError::Fatal(format!("stored hash `{hex}`: {e}")))
}
