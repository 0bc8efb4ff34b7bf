use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Lowercase hex SHA-256 digest of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for ContentHash {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
      Ok(Self(s.to_ascii_lowercase()))
    } else {
      Err(CacheError::InvalidHash {
        value: s.to_string(),
      })
    }
  }
}

impl TryFrom<String> for ContentHash {
  type Error = CacheError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<ContentHash> for String {
  fn from(hash: ContentHash) -> Self {
    hash.0
  }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  ContentHash(format!("{:x}", hasher.finalize()))
}

/// Hash a file without loading it into memory.
pub fn hash_file(path: impl AsRef<Path>) -> Result<ContentHash, CacheError> {
  let path = path.as_ref();
  let mut file = File::open(path).map_err(|e| CacheError::io(path, e))?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(|e| CacheError::io(path, e))?;
  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}
