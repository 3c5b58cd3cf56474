//! Content digests and integrity verification.
//!
//! A [`Digest`] is written `<algorithm>:<lowercase hex>`, e.g.
//! `sha256:b94d27b9...`. A bare 64-character hex string is read as SHA-256.
//! Verification failure is always fatal: it signals corruption or tampering,
//! never a transient condition.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::ErrorKind;
use crate::fetch::FetchResult;

/// Supported content hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  Sha256,
  Sha512,
}

impl HashAlgorithm {
  pub fn name(self) -> &'static str {
    match self {
      HashAlgorithm::Sha256 => "sha256",
      HashAlgorithm::Sha512 => "sha512",
    }
  }

  /// Length of the lowercase hex encoding.
  pub fn hex_len(self) -> usize {
    match self {
      HashAlgorithm::Sha256 => 64,
      HashAlgorithm::Sha512 => 128,
    }
  }

  pub fn hasher(self) -> Hasher {
    match self {
      HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
      HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
    }
  }
}

impl FromStr for HashAlgorithm {
  type Err = IntegrityError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "sha256" => Ok(HashAlgorithm::Sha256),
      "sha512" => Ok(HashAlgorithm::Sha512),
      other => Err(IntegrityError::UnsupportedAlgorithm(other.to_string())),
    }
  }
}

impl fmt::Display for HashAlgorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Incremental hasher, so downloads can be hashed while streaming.
pub enum Hasher {
  Sha256(Sha256),
  Sha512(Sha512),
}

impl Hasher {
  pub fn update(&mut self, data: &[u8]) {
    match self {
      Hasher::Sha256(h) => h.update(data),
      Hasher::Sha512(h) => h.update(data),
    }
  }

  pub fn finalize(self) -> Digest {
    match self {
      Hasher::Sha256(h) => Digest {
        algorithm: HashAlgorithm::Sha256,
        hex: hex::encode(h.finalize()),
      },
      Hasher::Sha512(h) => Digest {
        algorithm: HashAlgorithm::Sha512,
        hex: hex::encode(h.finalize()),
      },
    }
  }
}

/// A fixed-length content hash. Never empty: the only constructors parse or compute one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
  algorithm: HashAlgorithm,
  hex: String,
}

impl Digest {
  pub fn algorithm(&self) -> HashAlgorithm {
    self.algorithm
  }

  pub fn hex(&self) -> &str {
    &self.hex
  }
}

impl FromStr for Digest {
  type Err = IntegrityError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
      return Err(IntegrityError::Malformed {
        value: s.to_string(),
        reason: "digest is empty".to_string(),
      });
    }

    let (algorithm, hex) = match trimmed.split_once(':') {
      Some((algo, hex)) => (algo.parse::<HashAlgorithm>()?, hex),
      None => (HashAlgorithm::Sha256, trimmed),
    };

    if hex.len() != algorithm.hex_len() {
      return Err(IntegrityError::Malformed {
        value: s.to_string(),
        reason: format!(
          "{} digest must be {} hex characters, got {}",
          algorithm,
          algorithm.hex_len(),
          hex.len()
        ),
      });
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(IntegrityError::Malformed {
        value: s.to_string(),
        reason: "digest contains non-hex characters".to_string(),
      });
    }

    Ok(Digest {
      algorithm,
      hex: hex.to_ascii_lowercase(),
    })
  }
}

impl TryFrom<String> for Digest {
  type Error = IntegrityError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Digest> for String {
  fn from(value: Digest) -> Self {
    value.to_string()
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algorithm, self.hex)
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
  #[error("digest mismatch: expected {expected}, got {actual}")]
  Mismatch { expected: String, actual: String },

  #[error("malformed digest {value:?}: {reason}")]
  Malformed { value: String, reason: String },

  #[error("unsupported digest algorithm: {0} (supported: sha256, sha512)")]
  UnsupportedAlgorithm(String),
}

impl IntegrityError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      IntegrityError::Mismatch { .. } => ErrorKind::IntegrityMismatch,
      IntegrityError::Malformed { .. } | IntegrityError::UnsupportedAlgorithm(_) => ErrorKind::InvalidRecipe,
    }
  }
}

/// Hash arbitrary bytes with the given algorithm.
pub fn digest_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Digest {
  let mut hasher = algorithm.hasher();
  hasher.update(data);
  hasher.finalize()
}

/// Hash a file's contents.
pub fn digest_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<Digest> {
  let mut file = fs::File::open(path)?;
  let mut hasher = algorithm.hasher();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hasher.finalize())
}

/// Compare a fetched source's digest against the expected one.
pub fn verify(fetched: &FetchResult, expected: &Digest) -> Result<(), IntegrityError> {
  compare(&fetched.actual_digest, expected)
}

/// Hash `bytes` with the expected digest's algorithm and compare.
///
/// Returns the computed digest on success.
pub fn verify_bytes(bytes: &[u8], expected: &Digest) -> Result<Digest, IntegrityError> {
  let actual = digest_bytes(expected.algorithm(), bytes);
  compare(&actual, expected)?;
  Ok(actual)
}

fn compare(actual: &Digest, expected: &Digest) -> Result<(), IntegrityError> {
  if actual != expected {
    error!(expected = %expected, actual = %actual, "integrity check failed");
    return Err(IntegrityError::Mismatch {
      expected: expected.to_string(),
      actual: actual.to_string(),
    });
  }
  debug!(digest = %expected, "integrity verified");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

  #[test]
  fn parse_prefixed_digest() {
    let digest: Digest = format!("sha256:{}", HELLO_SHA256).parse().unwrap();
    assert_eq!(digest.algorithm(), HashAlgorithm::Sha256);
    assert_eq!(digest.hex(), HELLO_SHA256);
  }

  #[test]
  fn bare_hex_is_sha256() {
    let digest: Digest = HELLO_SHA256.to_uppercase().parse().unwrap();
    assert_eq!(digest.algorithm(), HashAlgorithm::Sha256);
    assert_eq!(digest.to_string(), format!("sha256:{}", HELLO_SHA256));
  }

  #[test]
  fn empty_digest_rejected() {
    assert!(matches!("".parse::<Digest>(), Err(IntegrityError::Malformed { .. })));
    assert!(matches!("   ".parse::<Digest>(), Err(IntegrityError::Malformed { .. })));
  }

  #[test]
  fn wrong_length_rejected() {
    let err = "sha256:abc123".parse::<Digest>().unwrap_err();
    assert!(matches!(err, IntegrityError::Malformed { .. }));
  }

  #[test]
  fn non_hex_rejected() {
    let bad = "z".repeat(64);
    assert!(matches!(bad.parse::<Digest>(), Err(IntegrityError::Malformed { .. })));
  }

  #[test]
  fn unknown_algorithm_rejected() {
    let err = format!("md5:{}", HELLO_SHA256).parse::<Digest>().unwrap_err();
    assert_eq!(err, IntegrityError::UnsupportedAlgorithm("md5".to_string()));
  }

  #[test]
  fn digest_known_value() {
    let digest = digest_bytes(HashAlgorithm::Sha256, b"hello world");
    assert_eq!(digest.hex(), HELLO_SHA256);
  }

  #[test]
  fn sha512_digest_length() {
    let digest = digest_bytes(HashAlgorithm::Sha512, b"hello world");
    assert_eq!(digest.hex().len(), 128);
    let reparsed: Digest = digest.to_string().parse().unwrap();
    assert_eq!(reparsed, digest);
  }

  #[test]
  fn verify_bytes_accepts_match() {
    let expected: Digest = HELLO_SHA256.parse().unwrap();
    let actual = verify_bytes(b"hello world", &expected).unwrap();
    assert_eq!(actual, expected);
  }

  #[test]
  fn verify_bytes_rejects_mismatch() {
    let expected: Digest = HELLO_SHA256.parse().unwrap();
    let err = verify_bytes(b"hello world!", &expected).unwrap_err();
    match err {
      IntegrityError::Mismatch { expected: e, actual } => {
        assert_eq!(e, format!("sha256:{}", HELLO_SHA256));
        assert_ne!(actual, e);
      }
      other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
      IntegrityError::Mismatch {
        expected: String::new(),
        actual: String::new()
      }
      .kind(),
      ErrorKind::IntegrityMismatch
    );
  }

  #[test]
  fn digest_file_matches_bytes() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("src.txt");
    fs::write(&path, "hello world").unwrap();

    let digest = digest_file(&path, HashAlgorithm::Sha256).unwrap();
    assert_eq!(digest.hex(), HELLO_SHA256);
  }

  #[test]
  fn serde_round_trips_as_string() {
    let digest: Digest = HELLO_SHA256.parse().unwrap();
    let json = serde_json::to_string(&digest).unwrap();
    assert_eq!(json, format!("\"sha256:{}\"", HELLO_SHA256));

    let bad: Result<Digest, _> = serde_json::from_str("\"\"");
    assert!(bad.is_err());
  }
}
