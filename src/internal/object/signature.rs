//! Author/committer/tagger signatures: name, email, timestamp and zone.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::ZetaError;

/// A person stamp as it appears in commit and tag headers:
/// `Name <email> <unix-seconds> <±zzzz>`.
///
/// An entirely empty value is tolerated on decode; it round-trips back to
/// an empty value so hashes stay stable.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: i64,
    pub zone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.when, self.zone
        )
    }
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: i64) -> Self {
        Signature {
            name: name.into(),
            email: email.into(),
            when,
            zone: "+0000".to_string(),
        }
    }

    /// True for the empty signature produced by an empty header value.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.email.is_empty() && self.when == 0
    }

    /// Parse a signature header value. The empty value is accepted.
    pub fn from_value(value: &[u8]) -> Result<Signature, ZetaError> {
        if value.is_empty() {
            return Ok(Signature {
                name: String::new(),
                email: String::new(),
                when: 0,
                zone: "+0000".to_string(),
            });
        }
        let lt = value
            .find_byte(b'<')
            .ok_or_else(|| ZetaError::malformed("signature missing `<`"))?;
        let gt = value[lt..]
            .find_byte(b'>')
            .map(|p| p + lt)
            .ok_or_else(|| ZetaError::malformed("signature missing `>`"))?;

        let name = String::from_utf8_lossy(&value[..lt])
            .trim_end()
            .to_string();
        let email = String::from_utf8_lossy(&value[lt + 1..gt]).to_string();

        let rest = String::from_utf8_lossy(&value[gt + 1..]).trim().to_string();
        let mut parts = rest.split_ascii_whitespace();
        let when = parts
            .next()
            .unwrap_or("0")
            .parse::<i64>()
            .map_err(|e| ZetaError::malformed(format!("signature timestamp: {e}")))?;
        let zone = parts.next().unwrap_or("+0000").to_string();

        Ok(Signature {
            name,
            email,
            when,
            zone,
        })
    }

    /// Serialize the header value. Inverse of [`Signature::from_value`].
    pub fn to_value(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A regular signature parses into its four parts and round-trips.
    #[test]
    fn parse_and_round_trip() {
        let raw = b"Nan Xiao <nan@zeta.dev> 1699000000 +0800";
        let sig = Signature::from_value(raw).unwrap();
        assert_eq!(sig.name, "Nan Xiao");
        assert_eq!(sig.email, "nan@zeta.dev");
        assert_eq!(sig.when, 1699000000);
        assert_eq!(sig.zone, "+0800");
        assert_eq!(sig.to_value(), raw.to_vec());
    }

    /// An empty value is accepted and round-trips to empty bytes.
    #[test]
    fn empty_value_is_accepted() {
        let sig = Signature::from_value(b"").unwrap();
        assert!(sig.is_empty());
        assert!(sig.to_value().is_empty());
    }

    /// Empty name and email still parse (anonymized history).
    #[test]
    fn anonymous_signature() {
        let sig = Signature::from_value(b" <> 42 -0500").unwrap();
        assert_eq!(sig.name, "");
        assert_eq!(sig.email, "");
        assert_eq!(sig.when, 42);
        assert_eq!(sig.zone, "-0500");
    }

    /// Garbage timestamps are a malformed error, not a panic.
    #[test]
    fn bad_timestamp_is_malformed() {
        let err = Signature::from_value(b"A <a@b> soon +0000").unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
