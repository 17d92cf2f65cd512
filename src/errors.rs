//! Error types for the zeta-server crate.
//!
//! One unified enumeration is used across object parsing, the pack
//! encoder/decoder, the object database, the replay engine and both
//! protocol transports. Lower layers return typed variants; the transport
//! layers classify with [`ZetaError::status`] / [`ZetaError::exit_code`]
//! instead of inspecting message strings.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the zeta-server library.
pub enum ZetaError {
    /// Revision, object, reference, repository or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// CAS mismatch, reference already locked, or a conflicting write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Access level insufficient or the account is locked.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Bad hash, bad header, bad request payload.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Pack references an unresolvable object, or a decoded object's type
    /// disagrees with the requested type.
    #[error("integrity: {0}")]
    Integrity(String),

    /// Network, timeout, or storage temporarily unavailable.
    #[error("transient: {0}")]
    Transient(String),

    /// Invariant violation; terminates the request.
    #[error("fatal: {0}")]
    Fatal(String),

    /// I/O error from an underlying reader or writer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata database error.
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// Remote blob store transport error.
    #[error("remote store error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ZetaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ZetaError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        ZetaError::Conflict(what.into())
    }

    pub fn malformed(what: impl Into<String>) -> Self {
        ZetaError::Malformed(what.into())
    }

    pub fn integrity(what: impl Into<String>) -> Self {
        ZetaError::Integrity(what.into())
    }

    /// True when the caller raced a concurrent reference update.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, ZetaError::Conflict(_))
    }

    /// Map to the HTTP status code the transport responds with.
    ///
    /// `Transient`, `Fatal` and the source-carrying variants collapse to
    /// 500 and their messages are never sent to the peer.
    pub fn status(&self) -> u16 {
        match self {
            ZetaError::NotFound(_) => 404,
            ZetaError::Conflict(_) | ZetaError::Integrity(_) => 409,
            ZetaError::PermissionDenied(_) => 403,
            ZetaError::Malformed(_) => 400,
            _ => 500,
        }
    }

    /// Map to the exit code of the `zeta-serve` SSH command.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZetaError::NotFound(_) => 404,
            ZetaError::Conflict(_) | ZetaError::Integrity(_) => 409,
            ZetaError::PermissionDenied(_) => 403,
            ZetaError::Malformed(_) => 400,
            _ => 500,
        }
    }

    /// The message shown to the peer. Internal failures are masked.
    pub fn public_message(&self) -> String {
        match self {
            ZetaError::NotFound(_)
            | ZetaError::Conflict(_)
            | ZetaError::PermissionDenied(_)
            | ZetaError::Malformed(_)
            | ZetaError::Integrity(_) => self.to_string(),
            _ => "internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each stable kind maps to its transport status without message parsing.
    #[test]
    fn classification_is_structural() {
        assert_eq!(ZetaError::not_found("ref").status(), 404);
        assert_eq!(ZetaError::conflict("cas").status(), 409);
        assert_eq!(ZetaError::PermissionDenied("level".into()).status(), 403);
        assert_eq!(ZetaError::malformed("hash").status(), 400);
        assert_eq!(ZetaError::integrity("missing blob").status(), 409);
        assert_eq!(ZetaError::Transient("net".into()).status(), 500);
        assert_eq!(ZetaError::Fatal("bug".into()).status(), 500);
    }

    /// Transient and fatal errors never leak their message to the peer.
    #[test]
    fn internal_messages_are_masked() {
        let e = ZetaError::Transient("endpoint 10.0.0.1 refused".into());
        assert_eq!(e.public_message(), "internal server error");
        let e = ZetaError::not_found("refs/heads/main");
        assert!(e.public_message().contains("refs/heads/main"));
    }
}
