//! Server configuration. Deserialized once at startup from a JSON file
//! (plus environment overrides in the binaries) and treated as immutable
//! afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::internal::pack::MAX_BATCH_BLOB_SIZE;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub listen: ListenConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    /// Root of the loose-object stores, one subdirectory per repository.
    pub root: PathBuf,
    /// Bound on the parsed-object cache, in bytes of decoded payload.
    pub cache_max_cost: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("zeta-objects"),
            cache_max_cost: 512 << 20,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    /// Endpoint of the S3/OSS-compatible blob store.
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// Multipart threshold and maximum single part size.
    pub max_part_size: u64,
    /// Smallest allowed trailing part.
    pub min_part_size: u64,
    /// Parallel part-upload workers.
    pub upload_workers: usize,
    /// Lifetime of presigned share URLs, seconds.
    pub share_ttl_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "zeta".to_string(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            max_part_size: 5 << 30,
            min_part_size: 100 << 10,
            upload_workers: 4,
            share_ttl_secs: 2 * 3600,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// sea-orm connection URL, e.g. `sqlite://zeta.db?mode=rwc`.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 16,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens.
    pub token_secret: String,
    /// Bearer token lifetime, seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "change-me".to_string(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferConfig {
    /// Blobs above this are omitted from batch object responses.
    pub max_batch_blob_size: u64,
    /// Subtree depth bound for metadata walks, -1 unbounded.
    pub tree_max_depth: i64,
    /// zstd level when the client negotiates compressed metadata.
    pub zstd_level: i32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_batch_blob_size: MAX_BATCH_BLOB_SIZE,
            tree_max_depth: -1,
            zstd_level: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenConfig {
    pub addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<ServerConfig, crate::errors::ZetaError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| crate::errors::ZetaError::malformed(format!("config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults are sane and partial files deserialize.
    #[test]
    fn partial_config_uses_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"listen": {"addr": "127.0.0.1:9418"}}"#).unwrap();
        assert_eq!(cfg.listen.addr, "127.0.0.1:9418");
        assert_eq!(cfg.remote.max_part_size, 5 << 30);
        assert_eq!(cfg.remote.min_part_size, 100 << 10);
        assert_eq!(cfg.transfer.tree_max_depth, -1);
    }
}
