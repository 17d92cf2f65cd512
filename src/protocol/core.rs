//! The transport-agnostic service both the HTTP and SSH adapters drive:
//! shared stores, per-repository ODB handles, and the revision resolver.

use std::str::FromStr;

use crate::config::ServerConfig;
use crate::db::MetaStore;
use crate::errors::ZetaError;
use crate::hash::ObjectHash;
use crate::model::repository;
use crate::odb::Odb;
use crate::protocol::auth::AuthService;
use crate::storage::cache::MetaCache;
use crate::storage::remote::RemoteStore;

#[derive(Clone)]
pub struct ZetaService {
    pub config: ServerConfig,
    pub meta: MetaStore,
    pub remote: RemoteStore,
    pub cache: MetaCache,
    pub auth: AuthService,
}

impl ZetaService {
    pub async fn new(config: ServerConfig) -> Result<ZetaService, ZetaError> {
        let meta = MetaStore::connect(&config.database).await?;
        let remote = RemoteStore::new(&config.remote);
        let cache = MetaCache::new(config.storage.cache_max_cost);
        let auth = AuthService::new(meta.clone(), &config.auth);
        Ok(ZetaService {
            config,
            meta,
            remote,
            cache,
            auth,
        })
    }

    /// Resolve `{ns}/{repo}` and open its object database.
    pub async fn open_repo(
        &self,
        ns_path: &str,
        repo_path: &str,
    ) -> Result<(repository::Model, Odb), ZetaError> {
        let repo = self.meta.repository_by_path(ns_path, repo_path).await?;
        let odb = Odb::open(
            repo.clone(),
            &self.config.storage,
            self.cache.clone(),
            self.remote.clone(),
            self.meta.clone(),
        )?;
        Ok((repo, odb))
    }

    /// Resolve a revision: a full hex id is used directly, anything else
    /// goes through the reference namespace; annotated tags peel to their
    /// commit.
    pub async fn resolve_rev(&self, odb: &Odb, rev: &str) -> Result<ObjectHash, ZetaError> {
        let id = match ObjectHash::from_str(rev) {
            Ok(id) => id,
            Err(_) => self.meta.resolve_ref(odb.repo(), rev).await?.1,
        };
        Ok(odb.parse_rev(id).await?.id)
    }
}
