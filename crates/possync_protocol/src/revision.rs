//! Revision tokens.

use crate::document::Payload;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Maximum number of ancestor revisions carried with a document.
pub const REVS_LIMIT: usize = 100;

/// An opaque version token assigned by a store on every write.
///
/// Rendered as `<generation>-<digest>`. Revisions are totally ordered by
/// generation and then digest, so every store that holds the same set of
/// leaves picks the same winner without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Creates a revision from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Derives the revision of an edit made on top of `parent`.
    ///
    /// The digest covers the parent token, the deletion marker and the
    /// payload, so two stores applying the same edit to the same parent
    /// produce the same revision.
    pub fn derive(parent: Option<&Revision>, deleted: bool, payload: &Payload) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        // serde_json maps are key-sorted, which keeps this canonical.
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
        let hash = hasher.finalize();

        let digest = hash[..16].iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Returns the generation (edit depth) of this revision.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part of this revision.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for Revision {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| ProtocolError::InvalidRevision(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidRevision(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(ProtocolError::InvalidRevision(s.to_string()));
        }
        Ok(Self::new(generation, digest))
    }
}

impl TryFrom<String> for Revision {
    type Error = ProtocolError;

    fn try_from(value: String) -> ProtocolResult<Self> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parse_and_display() {
        let rev: Revision = "3-abcdef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "abcdef");
        assert_eq!(rev.to_string(), "3-abcdef");
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!("abc".parse::<Revision>().is_err());
        assert!("x-abc".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("2-".parse::<Revision>().is_err());
    }

    #[test]
    fn derive_is_deterministic() {
        let p = payload(json!({"name": "Aspirin", "stock": 10}));
        let a = Revision::derive(None, false, &p);
        let b = Revision::derive(None, false, &p);
        assert_eq!(a, b);
        assert_eq!(a.generation(), 1);

        let child = Revision::derive(Some(&a), false, &p);
        assert_eq!(child.generation(), 2);
        assert_ne!(child.digest(), a.digest());
    }

    #[test]
    fn deletion_changes_digest() {
        let p = payload(json!({}));
        assert_ne!(
            Revision::derive(None, false, &p),
            Revision::derive(None, true, &p)
        );
    }

    #[test]
    fn ordering_by_generation_then_digest() {
        let a = Revision::new(2, "aaa");
        let b = Revision::new(2, "bbb");
        let c = Revision::new(10, "000");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn serde_as_string() {
        let rev = Revision::new(4, "ff00");
        let encoded = serde_json::to_string(&rev).unwrap();
        assert_eq!(encoded, "\"4-ff00\"");
        let decoded: Revision = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, rev);
    }
}
