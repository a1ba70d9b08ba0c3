// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SHA-512 content-address digest. This is the sole identifier of file
//! content everywhere in the system: the object store's key, the scanner's
//! per-inode fingerprint and the unit of transfer during fetches.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

/// A SHA-512 digest identifying one immutable object.
///
/// Rendered as 128 lowercase hex characters in logs, on the wire and in
/// object-store paths.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHash(pub [u8; 64]);

impl ObjectHash {
    /// Hash a complete in-memory buffer.
    pub fn of(data: &[u8]) -> ObjectHash {
        let mut hasher = Sha512::new();
        hasher.update(data);
        ObjectHash::from_hasher(hasher)
    }

    /// Finalize an incrementally-fed hasher.
    pub fn from_hasher(hasher: Sha512) -> ObjectHash {
        let digest = hasher.finalize();
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&digest);
        ObjectHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("object hash must be 128 hex characters")]
pub struct ParseHashError;

impl FromStr for ObjectHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<ObjectHash, ParseHashError> {
        if s.len() != 128 {
            return Err(ParseHashError);
        }
        let decoded = hex::decode(s).map_err(|_| ParseHashError)?;
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&decoded);
        Ok(ObjectHash(bytes))
    }
}

// Serialized as the hex string so both wire codecs stay self-describing and
// values remain legible in JSON captures.
impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ObjectHash, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::ObjectHash;

    // SHA-512 of the empty string.
    const EMPTY: [u8; 64] = hex!(
        "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce"
        "47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
    );

    #[test]
    fn hash_of_empty() {
        assert_eq!(ObjectHash::of(b""), ObjectHash(EMPTY));
    }

    #[test]
    fn hex_round_trip() {
        let hash = ObjectHash::of(b"hello");
        let rendered = hash.to_string();
        assert_eq!(rendered.len(), 128);
        assert_eq!(rendered.parse::<ObjectHash>().unwrap(), hash);
    }

    #[test]
    fn rejects_malformed() {
        assert!("abcd".parse::<ObjectHash>().is_err());
        assert!("zz".repeat(64).parse::<ObjectHash>().is_err());
    }

    #[test]
    fn serde_is_hex_string() {
        let hash = ObjectHash::of(b"hello");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: ObjectHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
