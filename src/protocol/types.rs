//! Wire-level types shared by the HTTP and SSH transports: media types,
//! operations, fetch parameters, report sideband lines and response
//! bodies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::ObjectHash;

/// Media types of the protocol surface.
pub const MEDIA_JSON: &str = "application/vnd.zeta+json";
pub const MEDIA_BLOB: &str = "application/x-zeta-blob";
pub const MEDIA_BLOBS: &str = "application/x-zeta-blobs";
pub const MEDIA_METADATA: &str = "application/x-zeta-metadata";
pub const MEDIA_METADATA_COMPRESSED: &str = "application/x-zeta-metadata-compressed";
pub const MEDIA_REPORT: &str = "application/x-zeta-report-result";

/// Server agent string advertised in `ls-reference` replies.
pub const AGENT: &str = concat!("zeta-server/", env!("CARGO_PKG_VERSION"));

/// Protocol version advertised in `ls-reference` replies.
pub const PROTOCOL_VERSION: u32 = 1;

/// What a credential or token permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Download,
    Upload,
    /// Internal service operation; dominates everything.
    Pseudo,
}

impl Operation {
    /// `upload ⇒ download`, `pseudo ⇒ any`.
    pub fn dominates(&self, requested: Operation) -> bool {
        match self {
            Operation::Pseudo => true,
            Operation::Upload => {
                matches!(requested, Operation::Upload | Operation::Download)
            }
            Operation::Download => matches!(requested, Operation::Download),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Download => write!(f, "download"),
            Operation::Upload => write!(f, "upload"),
            Operation::Pseudo => write!(f, "pseudo"),
        }
    }
}

impl FromStr for Operation {
    type Err = ZetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Operation::Download),
            "upload" => Ok(Operation::Upload),
            "pseudo" => Ok(Operation::Pseudo),
            other => Err(ZetaError::malformed(format!("unknown operation `{other}`"))),
        }
    }
}

/// Shallow-cut and sparse parameters of a metadata fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchParams {
    /// Commit-count bound along each path; -1 unbounded.
    #[serde(default = "unbounded")]
    pub deepen: i64,
    /// Truncate the walk at this commit (exclusive).
    #[serde(default, alias = "deepen-from")]
    pub deepen_from: Option<String>,
    /// Commits the client already has, comma separated on the query.
    #[serde(default)]
    pub have: Option<String>,
    /// Subtree depth bound; -1 unbounded.
    #[serde(default = "unbounded")]
    pub depth: i64,
}

fn unbounded() -> i64 {
    -1
}

impl Default for FetchParams {
    fn default() -> Self {
        FetchParams {
            deepen: -1,
            deepen_from: None,
            have: None,
            depth: -1,
        }
    }
}

impl FetchParams {
    pub fn have_hashes(&self) -> Result<Vec<ObjectHash>, ZetaError> {
        match &self.have {
            None => Ok(Vec::new()),
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| ObjectHash::from_str(s).map_err(ZetaError::Malformed))
                .collect(),
        }
    }

    pub fn deepen_from_hash(&self) -> Result<Option<ObjectHash>, ZetaError> {
        match &self.deepen_from {
            None => Ok(None),
            Some(raw) => Ok(Some(
                ObjectHash::from_str(raw).map_err(ZetaError::Malformed)?,
            )),
        }
    }
}

/// `ls-reference` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsReferenceResult {
    pub remote: String,
    pub name: String,
    pub hash: String,
    /// Peeled commit hash when the reference points at an annotated tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peeled: Option<String>,
    #[serde(rename = "HEAD")]
    pub head: String,
    pub version: u32,
    pub agent: String,
    pub hash_algo: String,
    pub compression_algo: String,
}

/// One presigned URL in a `share-objects` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareEntry {
    pub oid: String,
    pub size: u64,
    pub href: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Per-id verdict of `batch-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCheckEntry {
    pub oid: String,
    /// `download` when the server already has the object, `upload` when
    /// the client must send it.
    pub action: Operation,
    pub size: u64,
}

/// Bearer token reply of `authorization`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResult {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Push statistics hint, packed as `m-<n>;b-<n>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    pub metadata: u64,
    pub blobs: u64,
}

impl FromStr for PushStats {
    type Err = ZetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut stats = PushStats::default();
        for part in s.split(';').filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some(("m", n)) => {
                    stats.metadata = n
                        .parse()
                        .map_err(|_| ZetaError::malformed(format!("stats `{s}`")))?;
                }
                Some(("b", n)) => {
                    stats.blobs = n
                        .parse()
                        .map_err(|_| ZetaError::malformed(format!("stats `{s}`")))?;
                }
                _ => return Err(ZetaError::malformed(format!("stats `{s}`"))),
            }
        }
        Ok(stats)
    }
}

/// Sideband lines of the push report stream.
pub mod report {
    use crate::hash::ObjectHash;

    pub fn unpack_ok() -> String {
        "unpack ok\n".to_string()
    }

    pub fn ng(refname: &str, reason: &str) -> String {
        format!("ng {refname} {reason}\n")
    }

    pub fn ok(refname: &str, new: &ObjectHash) -> String {
        format!("ok {refname} {new}\n")
    }

    pub fn rate_check(oid: &ObjectHash) -> String {
        format!("rate check '{oid}' integrity\n")
    }

    pub fn objects_verified() -> String {
        "status objects verified\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Operation dominance: upload covers download, pseudo covers all.
    #[test]
    fn operation_dominance() {
        assert!(Operation::Upload.dominates(Operation::Download));
        assert!(Operation::Upload.dominates(Operation::Upload));
        assert!(!Operation::Upload.dominates(Operation::Pseudo));
        assert!(!Operation::Download.dominates(Operation::Upload));
        assert!(Operation::Pseudo.dominates(Operation::Upload));
        assert!(Operation::Pseudo.dominates(Operation::Pseudo));
    }

    /// Push stats parse the packed `m-<n>;b-<n>` form.
    #[test]
    fn push_stats_parse() {
        let stats: PushStats = "m-12;b-3".parse().unwrap();
        assert_eq!(stats, PushStats { metadata: 12, blobs: 3 });
        assert!("m-x;b-1".parse::<PushStats>().is_err());
        assert_eq!("".parse::<PushStats>().unwrap(), PushStats::default());
    }

    /// Fetch params split their comma-joined have list.
    #[test]
    fn fetch_params_have_list() {
        let params = FetchParams {
            have: Some(format!(
                "{},{}",
                "8ab686eafeb1f44702738c8b0f24f2567c36da6d",
                "943a702d06f34599aee1f8da8ef9f7296031d699"
            )),
            ..FetchParams::default()
        };
        assert_eq!(params.have_hashes().unwrap().len(), 2);
        let bad = FetchParams {
            have: Some("zz".into()),
            ..FetchParams::default()
        };
        assert!(bad.have_hashes().is_err());
    }

    /// Report lines match the contract verbatim.
    #[test]
    fn report_lines() {
        use crate::hash::HashKind;
        let oid = ObjectHash::zero(HashKind::Sha1);
        assert_eq!(report::unpack_ok(), "unpack ok\n");
        assert_eq!(
            report::ng("refs/heads/main", "blob 'x' not exists"),
            "ng refs/heads/main blob 'x' not exists\n"
        );
        assert!(report::ok("refs/heads/main", &oid).starts_with("ok refs/heads/main 0000"));
        assert!(report::rate_check(&oid).starts_with("rate check '0000"));
        assert_eq!(report::objects_verified(), "status objects verified\n");
    }
}
