//! Opaque peer identifiers.
//!
//! The engine never interprets peer identifiers beyond equality and hashing.
//! They are whatever the underlying transport hands us: a base58 key hash, a
//! hex-encoded public key, a hostname. Everything downstream (mesh tables,
//! scoring, backoff records) keys on this newtype.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque peer identifier.
///
/// Cheap to clone (`Arc`-backed) since identifiers fan out into every
/// per-peer table the engine keeps.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty identifier, which no valid message may carry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short prefix for log fields.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_and_hashing() {
        let a = PeerId::from("peer-a");
        let b = PeerId::from("peer-a");
        let c = PeerId::from("peer-c");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn short_prefix_bounded() {
        let long = PeerId::from("QmYwAPJzv5CZsnAzt8auVZRn2E6vCFXxwjJfB1T3yQXswL");
        assert_eq!(long.short().len(), 12);

        let tiny = PeerId::from("ab");
        assert_eq!(tiny.short(), "ab");
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let peer = PeerId::from("peer-x");
        let bytes = bincode::serialize(&peer).unwrap();
        let back: PeerId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(peer, back);

        // Transparent representation: identical to a bare string.
        let raw = bincode::serialize(&"peer-x".to_string()).unwrap();
        assert_eq!(bytes, raw);
    }
}
