//! Content digests and cache-key derivation.
//!
//! A [`Digest`] is an opaque content hash in the canonical `algorithm:hex`
//! form. Digests compare lexicographically on that string, which is the
//! total order used for all deterministic sorting in this crate.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// Identifies which output of a multi-output computation a key refers to.
pub type Index = usize;

/// Errors produced when validating a digest string.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid digest '{0}': missing ':' separator")]
    MissingSeparator(String),

    #[error("invalid digest '{0}': empty algorithm")]
    EmptyAlgorithm(String),

    #[error("invalid digest '{0}': malformed encoded part")]
    InvalidEncoded(String),
}

/// A content digest in canonical `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    /// Compute the sha-256 digest of the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Parse and validate a digest in `algorithm:hex` form.
    ///
    /// The encoded part must be non-empty lowercase hex; sha-256 digests
    /// must carry exactly 64 hex characters.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_string()))?;
        if algorithm.is_empty() {
            return Err(DigestError::EmptyAlgorithm(s.to_string()));
        }
        let hex_ok = !encoded.is_empty()
            && encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !hex_ok || (algorithm == "sha256" && encoded.len() != 64) {
            return Err(DigestError::InvalidEncoded(s.to_string()));
        }
        Ok(Digest(s.to_string()))
    }

    /// The algorithm part of the digest.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The encoded (hex) part of the digest.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or("")
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(D::Error::custom)
    }
}

/// Derive the identity key for a specific output of a computation.
///
/// Two records sharing an underlying digest but produced at different
/// output indices get distinct keys.
pub fn output_key(digest: &Digest, index: Index) -> Digest {
    Digest::from_bytes(format!("{}@{}", digest, index).as_bytes())
}
