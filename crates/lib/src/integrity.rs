//! Content integrity checks.
//!
//! Every archive is hashed and compared against its pinned SHA-256 before a
//! single byte of it is unpacked. The comparison runs in constant time.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::consts::SHA256_HEX_LEN;

/// A full 64-character lowercase SHA-256 hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
  #[error("digest mismatch: expected {expected}, got {actual}")]
  Mismatch { expected: String, actual: String },

  #[error("pinned digest is not a 64-character hex string: {0:?}")]
  MalformedDigest(String),

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Verify `content` against the pinned `expected` digest.
///
/// The expected digest is accepted in either case; the comparison itself is
/// done on normalised lowercase hex.
pub fn verify(content: &[u8], expected: &str) -> Result<(), IntegrityError> {
  let expected = normalize_digest(expected)?;
  let actual = hash_bytes(content);

  if !digests_equal(&expected, &actual.0) {
    return Err(IntegrityError::Mismatch {
      expected,
      actual: actual.0,
    });
  }

  Ok(())
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}

/// Hash a file's contents without loading it all into memory.
pub fn hash_file(path: &Path) -> Result<ContentHash, IntegrityError> {
  let read_err = |source| IntegrityError::Read {
    path: path.display().to_string(),
    source,
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

fn normalize_digest(digest: &str) -> Result<String, IntegrityError> {
  let trimmed = digest.trim();
  if trimmed.len() != SHA256_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(IntegrityError::MalformedDigest(digest.to_string()));
  }
  Ok(trimmed.to_ascii_lowercase())
}

fn digests_equal(a: &str, b: &str) -> bool {
  a.as_bytes().ct_eq(b.as_bytes()).into()
}
