//! Cache errors.

use std::path::PathBuf;

use crate::dataset::DatasetId;
use crate::cache::RecordId;

/// Errors that can occur while hashing files or maintaining the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// Reading or removing a file failed.
  #[error("i/o error on '{}': {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// A string is not a SHA-256 hex digest.
  #[error("invalid content hash '{value}'")]
  InvalidHash { value: String },

  #[error("unknown dataset {id}")]
  UnknownDataset { id: DatasetId },

  #[error("unknown exec record {id}")]
  UnknownRecord { id: RecordId },

  /// The record has already been completed or failed.
  #[error("exec record {id} is already finished")]
  RecordFinished { id: RecordId },
}

impl CacheError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}
