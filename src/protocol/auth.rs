//! Authentication and authorization for both transports.
//!
//! Peers present either Basic credentials (username + password, verified
//! against the stored Argon2id hash) or a Bearer token previously issued
//! by the `authorization` endpoint. A token is scoped to one repository
//! and one operation; the token's operation must dominate the request's
//! operation, and the computed access level gates it on top of that.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::db::{AccessLevel, MetaStore};
use crate::errors::ZetaError;
use crate::model::{repository, user, Visibility};
use crate::protocol::types::{AuthorizationResult, Operation};

/// Bearer token claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub uid: i64,
    /// Repository id the token is scoped to.
    pub rid: i64,
    /// Operation the token grants.
    pub operation: Operation,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
}

/// Parsed client credentials.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credentials {
    /// Parse an `Authorization` header value.
    pub fn parse(header: &str) -> Result<Credentials, ZetaError> {
        if let Some(rest) = header.strip_prefix("Basic ") {
            let decoded = BASE64
                .decode(rest.trim())
                .map_err(|_| ZetaError::malformed("basic credentials are not base64"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| ZetaError::malformed("basic credentials are not UTF-8"))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| ZetaError::malformed("basic credentials missing `:`"))?;
            Ok(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            })
        } else if let Some(token) = header.strip_prefix("Bearer ") {
            Ok(Credentials::Bearer(token.trim().to_string()))
        } else {
            Err(ZetaError::malformed("unsupported authorization scheme"))
        }
    }
}

/// Who a request is acting as, after authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: Option<user::Model>,
    /// Operation granted by a bearer token; Basic credentials carry no
    /// pre-granted operation and rely on access level alone.
    pub granted: Option<Operation>,
}

impl AuthContext {
    pub fn anonymous() -> AuthContext {
        AuthContext {
            user: None,
            granted: None,
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    meta: MetaStore,
    secret: String,
    ttl_secs: u64,
}

impl AuthService {
    pub fn new(meta: MetaStore, cfg: &AuthConfig) -> AuthService {
        AuthService {
            meta,
            secret: cfg.token_secret.clone(),
            ttl_secs: cfg.token_ttl_secs,
        }
    }

    /// Authenticate a request against a repository. A missing header is
    /// anonymous, which only `anonymous`-visibility repositories accept.
    pub async fn authenticate(
        &self,
        repo: &repository::Model,
        authorization: Option<&str>,
    ) -> Result<AuthContext, ZetaError> {
        let Some(header) = authorization else {
            return Ok(AuthContext::anonymous());
        };
        match Credentials::parse(header)? {
            Credentials::Basic { username, password } => {
                let user = self
                    .meta
                    .user_by_name(&username)
                    .await
                    .map_err(|_| ZetaError::PermissionDenied("bad credentials".into()))?;
                if user.locked {
                    return Err(ZetaError::PermissionDenied(format!(
                        "user {username} is locked"
                    )));
                }
                verify_password(&user.password_hash, &password)?;
                Ok(AuthContext {
                    user: Some(user),
                    granted: None,
                })
            }
            Credentials::Bearer(token) => {
                let claims = self.decode_token(&token)?;
                if claims.rid != repo.id {
                    return Err(ZetaError::PermissionDenied(
                        "token is scoped to another repository".into(),
                    ));
                }
                let user = user_by_id(&self.meta, claims.uid).await?;
                Ok(AuthContext {
                    user: Some(user),
                    granted: Some(claims.operation),
                })
            }
        }
    }

    /// Gate one operation: token dominance first, then access level.
    pub async fn authorize(
        &self,
        ctx: &AuthContext,
        repo: &repository::Model,
        requested: Operation,
    ) -> Result<AccessLevel, ZetaError> {
        if let Some(granted) = ctx.granted {
            if !granted.dominates(requested) {
                return Err(ZetaError::PermissionDenied(format!(
                    "token grants {granted}, request needs {requested}"
                )));
            }
        }
        let level = self.meta.access_level(ctx.user.as_ref(), repo).await?;
        let allowed = match requested {
            Operation::Download => {
                level.can_read() || matches!(repo.visibility, Visibility::Anonymous)
            }
            Operation::Upload => level.can_write(),
            Operation::Pseudo => ctx.granted == Some(Operation::Pseudo),
        };
        if !allowed {
            return Err(ZetaError::PermissionDenied(format!(
                "{requested} requires a higher access level"
            )));
        }
        Ok(level)
    }

    /// Exchange authenticated Basic credentials for a bearer token.
    pub async fn issue_token(
        &self,
        ctx: &AuthContext,
        repo: &repository::Model,
        operation: Operation,
    ) -> Result<AuthorizationResult, ZetaError> {
        let user = ctx
            .user
            .as_ref()
            .ok_or_else(|| ZetaError::PermissionDenied("authorization requires credentials".into()))?;
        // The token must not grant more than the access level supports.
        self.authorize(ctx, repo, operation).await?;

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.ttl_secs as i64);
        let claims = Claims {
            uid: user.id,
            rid: repo.id,
            operation,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ZetaError::Fatal(format!("token encode: {e}")))?;
        Ok(AuthorizationResult { token, expires_at })
    }

    fn decode_token(&self, token: &str) -> Result<Claims, ZetaError> {
        let mut validation = Validation::default();
        validation.validate_nbf = true;
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| ZetaError::PermissionDenied(format!("invalid token: {e}")))
    }
}

/// Verify a password against its stored Argon2id PHC string.
pub fn verify_password(stored: &str, password: &str) -> Result<(), ZetaError> {
    let parsed = PasswordHash::new(stored)
        .map_err(|_| ZetaError::PermissionDenied("bad credentials".into()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ZetaError::PermissionDenied("bad credentials".into()))
}

/// Hash a password for storage. Used by provisioning tools and tests.
pub fn hash_password(password: &str) -> Result<String, ZetaError> {
    use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ZetaError::Fatal(format!("argon2: {e}")))
}

/// Look up a user by id through the metadata store's connection.
async fn user_by_id(meta: &MetaStore, uid: i64) -> Result<user::Model, ZetaError> {
    use sea_orm::EntityTrait;
    user::Entity::find_by_id(uid)
        .one(meta.connection())
        .await?
        .ok_or_else(|| ZetaError::PermissionDenied("token user no longer exists".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn repo(id: i64, visibility: Visibility) -> repository::Model {
        let now = Utc::now();
        repository::Model {
            id,
            namespace_id: 1,
            path: "core".into(),
            visibility,
            default_branch: "main".into(),
            hash_algo: "sha1".into(),
            compression_algo: "zstd".into(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn service_with_user(password: &str) -> (AuthService, user::Model) {
        let meta = MetaStore::connect(&DatabaseConfig::default()).await.unwrap();
        let hash = hash_password(password).unwrap();
        use sea_orm::{ActiveValue::Set, EntityTrait};
        user::Entity::insert(user::ActiveModel {
            id: Set(1),
            username: Set("ada".into()),
            password_hash: Set(hash),
            email: Set("ada@zeta.dev".into()),
            admin: Set(false),
            locked: Set(false),
            remote: Set(false),
            created_at: Set(Utc::now()),
        })
        .exec(meta.connection())
        .await
        .unwrap();
        let user = meta.user_by_name("ada").await.unwrap();
        let service = AuthService::new(
            meta,
            &AuthConfig {
                token_secret: "unit-test-secret".into(),
                token_ttl_secs: 3600,
            },
        );
        (service, user)
    }

    fn basic_header(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
    }

    /// Basic credentials verify against the Argon2id hash; wrong
    /// passwords are denied without leaking which part failed.
    #[tokio::test]
    async fn basic_auth_round_trip() {
        let (service, _) = service_with_user("s3cret").await;
        let repo = repo(1, Visibility::Public);

        let ctx = service
            .authenticate(&repo, Some(&basic_header("ada", "s3cret")))
            .await
            .unwrap();
        assert_eq!(ctx.user.as_ref().unwrap().username, "ada");
        assert!(ctx.granted.is_none());

        let err = service
            .authenticate(&repo, Some(&basic_header("ada", "wrong")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    /// Issued tokens decode, are repo-scoped, and dominance gates the
    /// request operation.
    #[tokio::test]
    async fn token_scope_and_dominance() {
        let (service, _) = service_with_user("pw").await;
        let repo_a = repo(1, Visibility::Public);
        let repo_b = repo(2, Visibility::Public);

        let ctx = service
            .authenticate(&repo_a, Some(&basic_header("ada", "pw")))
            .await
            .unwrap();
        let issued = service
            .issue_token(&ctx, &repo_a, Operation::Download)
            .await
            .unwrap();

        let bearer = format!("Bearer {}", issued.token);
        let token_ctx = service.authenticate(&repo_a, Some(&bearer)).await.unwrap();
        assert_eq!(token_ctx.granted, Some(Operation::Download));

        // Download token cannot authorize an upload.
        let err = service
            .authorize(&token_ctx, &repo_a, Operation::Upload)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);

        // The token does not open a different repository.
        let err = service.authenticate(&repo_b, Some(&bearer)).await.unwrap_err();
        assert_eq!(err.status(), 403);
    }

    /// Anonymous callers read anonymous-visibility repositories only.
    #[tokio::test]
    async fn anonymous_visibility_gate() {
        let (service, _) = service_with_user("pw").await;
        let ctx = AuthContext::anonymous();
        assert!(service
            .authorize(&ctx, &repo(1, Visibility::Anonymous), Operation::Download)
            .await
            .is_ok());
        let err = service
            .authorize(&ctx, &repo(1, Visibility::Public), Operation::Download)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
        let err = service
            .authorize(&ctx, &repo(1, Visibility::Anonymous), Operation::Upload)
            .await
            .unwrap_err();
        assert_eq!(err.status(), 403);
    }

    /// An upload token also covers downloads on a writable repo.
    #[tokio::test]
    async fn upload_token_covers_download() {
        let (service, user) = service_with_user("pw").await;
        let repo = repo(1, Visibility::Public);

        // Grant Developer on the repo so upload is issuable.
        use sea_orm::{ActiveValue::Set, EntityTrait};
        crate::model::member::Entity::insert(crate::model::member::ActiveModel {
            user_id: Set(user.id),
            source_id: Set(repo.id),
            source_type: Set(crate::model::member::SourceType::Repository),
            access_level: Set(AccessLevel::Developer as i32),
            created_at: Set(Utc::now()),
            ..Default::default()
        })
        .exec(service.meta.connection())
        .await
        .unwrap();

        let ctx = service
            .authenticate(&repo, Some(&basic_header("ada", "pw")))
            .await
            .unwrap();
        let issued = service
            .issue_token(&ctx, &repo, Operation::Upload)
            .await
            .unwrap();
        let token_ctx = service
            .authenticate(&repo, Some(&format!("Bearer {}", issued.token)))
            .await
            .unwrap();
        assert!(service
            .authorize(&token_ctx, &repo, Operation::Download)
            .await
            .is_ok());
        assert!(service
            .authorize(&token_ctx, &repo, Operation::Upload)
            .await
            .is_ok());
    }
}
