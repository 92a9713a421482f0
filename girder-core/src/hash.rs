//! Cryptographic digests for content addressing

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a digest (SHA-256).
pub const DIGEST_LENGTH: usize = 32;

/// SHA-256 digest identifying a piece of content.
///
/// Serialized as a lowercase hex string wherever it appears in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Error type for parsing a digest from its hex rendering.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Invalid digest '{input}': {reason}")]
pub struct DigestParseError {
    pub input: String,
    pub reason: String,
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| DigestParseError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        let bytes: [u8; DIGEST_LENGTH] =
            bytes.try_into().map_err(|_| DigestParseError {
                input: s.to_string(),
                reason: format!("expected {} bytes", DIGEST_LENGTH),
            })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming hasher. Movable, single-use: feed bytes with [`Hasher::update`]
/// and consume with [`Hasher::finalize`].
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> Digest {
        let result = self.inner.finalize();
        let mut bytes = [0u8; DIGEST_LENGTH];
        bytes.copy_from_slice(&result);
        Digest(bytes)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the digest of a byte slice in one call.
pub fn compute_hash(content: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_stable() {
        assert_eq!(compute_hash(b"girder"), compute_hash(b"girder"));
        assert_ne!(compute_hash(b"girder"), compute_hash(b"girder2"));
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"gir");
        hasher.update(b"der");
        assert_eq!(hasher.finalize(), compute_hash(b"girder"));
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = compute_hash(b"content");
        let parsed: Digest = digest.hex().parse().expect("hex must parse");
        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_hex_parse_rejects_bad_input() {
        assert!("zz".parse::<Digest>().is_err());
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let digest = compute_hash(b"x");
        let json = serde_json::to_string(&digest).expect("serialize");
        assert_eq!(json, format!("\"{}\"", digest.hex()));
        let back: Digest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(digest, back);
    }
}
