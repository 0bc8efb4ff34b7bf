//! Container runner errors.

use std::path::PathBuf;

use sluice_cache::{CacheError, ContentHash};

/// Errors that can occur while preparing or launching a task.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
  #[error("i/o error on '{}': {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// An input's bytes no longer match the recorded hash.
  #[error("input '{name}' is corrupt: expected {expected}, found {actual}")]
  IntegrityFailure {
    name: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("input '{name}' not found at '{}'", path.display())]
  MissingInput { name: String, path: PathBuf },

  #[error("failed to start '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid task: {message}")]
  InvalidTask { message: String },

  #[error("failed to hash input: {0}")]
  Hash(#[from] CacheError),

  #[error("failed to (de)serialize: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl ContainerError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}
