//! File checksums.
//!
//! A checksum is an algorithm name plus a lower-case hex digest. Digests
//! produced by other tiers may have lost their leading zeros (they were
//! rendered from a big integer), so every digest is normalized by
//! left-padding with `0` to the algorithm's full width before comparison.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    /// 128-bit MD5, the default on every tier.
    #[serde(rename = "md5", alias = "MD5")]
    Md5,
    /// 256-bit Blake3.
    #[serde(rename = "blake3", alias = "BLAKE3")]
    Blake3,
}

impl ChecksumAlgorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }

    /// Width of the hex digest in characters.
    pub const fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Blake3 => 64,
        }
    }
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Md5
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "blake3" => Ok(ChecksumAlgorithm::Blake3),
            other => Err(CoreError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// A normalized, algorithm-tagged digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl Checksum {
    /// Parse a hex digest, normalizing case and restoring leading zeros.
    pub fn parse(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, CoreError> {
        let digest = digest.trim().to_ascii_lowercase();
        let width = algorithm.hex_len();

        if digest.is_empty()
            || digest.len() > width
            || !digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(CoreError::InvalidField {
                field: "checksum",
                reason: format!("'{digest}' is not a {algorithm} digest"),
            });
        }

        Ok(Self {
            algorithm,
            hex: format!("{digest:0>width$}"),
        })
    }

    /// Compute the checksum of an in-memory buffer.
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        let mut hasher = ChecksumHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// The full-width lower-case hex digest.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Compare against a digest string as declared by a record.
    ///
    /// Returns `false` when the declared digest does not parse.
    pub fn matches(&self, declared: &str) -> bool {
        Checksum::parse(self.algorithm, declared)
            .map(|other| other == *self)
            .unwrap_or(false)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({}:{})", self.algorithm, self.hex)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// Incremental hasher for streaming file contents.
pub enum ChecksumHasher {
    Md5(Md5),
    Blake3(Box<blake3::Hasher>),
}

impl ChecksumHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => ChecksumHasher::Md5(Md5::new()),
            ChecksumAlgorithm::Blake3 => ChecksumHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::Md5(h) => h.update(data),
            ChecksumHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            ChecksumHasher::Md5(h) => Checksum {
                algorithm: ChecksumAlgorithm::Md5,
                hex: hex::encode(h.finalize()),
            },
            ChecksumHasher::Blake3(h) => Checksum {
                algorithm: ChecksumAlgorithm::Blake3,
                hex: h.finalize().to_hex().to_string(),
            },
        }
    }
}
