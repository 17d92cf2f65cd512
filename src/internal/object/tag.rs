//! Annotated tag objects: a named, signed pointer at another object.
//!
//! Lightweight tags are only reference rows and never materialize here; an
//! annotated tag has its own id, a tagger stamp and a message which may
//! embed a detached signature block introduced by a `-----BEGIN` line.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;
use crate::hash::{HashKind, ObjectHash};
use crate::internal::object::ObjectTrait;
use crate::internal::object::commit::{parse_headers, write_header};
use crate::internal::object::signature::Signature;
use crate::internal::object::types::ObjectType;

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: ObjectHash,
    /// The object this tag points at; chains of tags peel toward a commit
    /// or blob within a bounded depth.
    pub object: ObjectHash,
    pub target_type: ObjectType,
    pub name: String,
    pub tagger: Signature,
    pub message: String,
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tag {}", self.name)?;
        writeln!(f, "object {} ({})", self.object, self.target_type)?;
        writeln!(f, "tagger {}", self.tagger)?;
        writeln!(f)?;
        writeln!(f, "{}", self.message)
    }
}

impl Tag {
    pub fn new(
        kind: HashKind,
        object: ObjectHash,
        target_type: ObjectType,
        name: impl Into<String>,
        tagger: Signature,
        message: impl Into<String>,
    ) -> Result<Tag, ZetaError> {
        let mut tag = Tag {
            id: ObjectHash::zero(kind),
            object,
            target_type,
            name: name.into(),
            tagger,
            message: message.into(),
        };
        tag.id = tag.object_hash(kind)?;
        Ok(tag)
    }

    /// Subject/description split used by the reference metadata rows: the
    /// message up to the first newline, and everything after it.
    pub fn split_message(&self) -> (&str, &str) {
        match self.message.split_once('\n') {
            Some((subject, description)) => (subject, description),
            None => (self.message.as_str(), ""),
        }
    }

    /// True when the message embeds a detached signature block.
    pub fn is_signed(&self) -> bool {
        self.message.lines().any(|l| l.starts_with("-----BEGIN"))
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, ZetaError> {
        let (headers, message) = parse_headers(data)?;

        let mut object: Option<ObjectHash> = None;
        let mut target_type: Option<ObjectType> = None;
        let mut name: Option<String> = None;
        let mut tagger: Option<Signature> = None;

        for (field, value) in headers {
            match field.as_str() {
                "object" => {
                    let hex = std::str::from_utf8(&value)
                        .map_err(|_| ZetaError::malformed("tag object id is not UTF-8"))?;
                    object = Some(ObjectHash::from_str(hex).map_err(ZetaError::Malformed)?);
                }
                "type" => {
                    target_type = Some(ObjectType::from_token(&value)?);
                }
                "tag" => {
                    name = Some(String::from_utf8_lossy(&value).to_string());
                }
                "tagger" => {
                    tagger = Some(Signature::from_value(&value)?);
                }
                other => {
                    return Err(ZetaError::malformed(format!("unknown tag header `{other}`")));
                }
            }
        }

        Ok(Tag {
            id: hash,
            object: object.ok_or_else(|| ZetaError::malformed("tag is missing object"))?,
            target_type: target_type
                .ok_or_else(|| ZetaError::malformed("tag is missing type"))?,
            name: name.ok_or_else(|| ZetaError::malformed("tag is missing name"))?,
            tagger: tagger.ok_or_else(|| ZetaError::malformed("tag is missing tagger"))?,
            message: String::from_utf8_lossy(&message).to_string(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn get_size(&self) -> usize {
        self.message.len()
    }

    fn to_data(&self) -> Result<Vec<u8>, ZetaError> {
        let mut data = Vec::new();
        write_header(&mut data, "object", self.object.to_string().as_bytes());
        write_header(&mut data, "type", self.target_type.to_bytes());
        write_header(&mut data, "tag", self.name.as_bytes());
        write_header(&mut data, "tagger", &self.tagger.to_value());
        data.push(b'\n');
        data.extend(self.message.as_bytes());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ObjectHash {
        ObjectHash::new(HashKind::Sha1, b"some commit")
    }

    fn tagger() -> Signature {
        Signature::new("rel-bot", "bot@zeta.dev", 1699000000)
    }

    /// Round-trip keeps every field and the id stable.
    #[test]
    fn round_trip_is_identity() {
        let tag = Tag::new(
            HashKind::Sha1,
            target(),
            ObjectType::Commit,
            "v2.4.0",
            tagger(),
            "release 2.4.0\n\nnotes here\n",
        )
        .unwrap();
        let data = tag.to_data().unwrap();
        let back = Tag::from_bytes(&data, tag.id).unwrap();
        assert_eq!(back.to_data().unwrap(), data);
        assert_eq!(back.object_hash(HashKind::Sha1).unwrap(), tag.id);
        assert_eq!(back.name, "v2.4.0");
        assert_eq!(back.target_type, ObjectType::Commit);
    }

    /// A detached signature block in the message survives verbatim.
    #[test]
    fn signed_tag_message_preserved() {
        let message = "signed release\n-----BEGIN PGP SIGNATURE-----\nabcd\n-----END PGP SIGNATURE-----\n";
        let tag = Tag::new(
            HashKind::Sha256,
            target(),
            ObjectType::Commit,
            "v1.0.0",
            tagger(),
            message,
        )
        .unwrap();
        let back = Tag::from_bytes(&tag.to_data().unwrap(), tag.id).unwrap();
        assert!(back.is_signed());
        assert_eq!(back.message, message);
    }

    /// Subject/description split at the first newline.
    #[test]
    fn message_split() {
        let tag = Tag::new(
            HashKind::Sha1,
            target(),
            ObjectType::Commit,
            "v1",
            tagger(),
            "subject line\nrest of\nthe body",
        )
        .unwrap();
        let (subject, description) = tag.split_message();
        assert_eq!(subject, "subject line");
        assert_eq!(description, "rest of\nthe body");
    }

    /// Tags missing required headers are malformed.
    #[test]
    fn missing_headers_malformed() {
        let raw = b"object 341e54913a3a43069f2927cc0f703e5a9f730df1\ntype commit\n\nmsg";
        let err = Tag::from_bytes(raw, ObjectHash::zero(HashKind::Sha1)).unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
