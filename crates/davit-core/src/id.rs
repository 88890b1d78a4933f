use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{DavitError, Result};

/// A 256-bit content address: the SHA-256 of a blob's plaintext, or of a
/// stored file's bytes for top-level objects (packs, indexes, snapshots).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub [u8; 32]);

impl Id {
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Id(out)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| DavitError::Other(format!("invalid id '{s}': {e}")))?;
        if bytes.len() != 32 {
            return Err(DavitError::Other(format!(
                "invalid id '{s}': expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short printable form: the first 8 hex characters.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }

    /// First byte as a two-char hex string, used for `data/<xx>/` sharding.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Whether `s` is a hex prefix of this id (for user-supplied short ids).
    pub fn has_prefix(&self, s: &str) -> bool {
        self.to_hex().starts_with(&s.to_ascii_lowercase())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

// Ids appear in JSON as lowercase hex strings.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_hex_roundtrip() {
        let id = Id::hash(b"hello");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Id::from_hex(&hex).unwrap(), id);
        assert_eq!(id.short().len(), 8);
        assert_eq!(id.shard_prefix(), &hex[..2]);
    }

    #[test]
    fn known_digest() {
        // SHA-256 of the empty string.
        let id = Id::hash(b"");
        assert_eq!(
            id.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn json_is_hex_string() {
        let id = Id::hash(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(Id::from_hex("zz").is_err());
        assert!(Id::from_hex("abcd").is_err());
    }
}
