use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CacheError;
use crate::hash::{ContentHash, hash_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

impl fmt::Display for DatasetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ds{}", self.0)
  }
}

/// Metadata for one file of data. Metadata outlives the bytes: a purged
/// dataset keeps its hash and size but has no path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
  pub id: DatasetId,
  pub hash: ContentHash,
  pub size: u64,
  pub path: Option<PathBuf>,
}

impl Dataset {
  /// Whether the bytes are still on disk.
  pub fn is_retained(&self) -> bool {
    self.path.is_some()
  }
}

#[derive(Debug, Default)]
struct Registry {
  next_id: u64,
  datasets: HashMap<DatasetId, Dataset>,
}

/// Shared registry of known datasets.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
  inner: Arc<RwLock<Registry>>,
}

impl DatasetRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Hash a file and register it.
  pub fn register_file(&self, path: impl AsRef<Path>) -> Result<Dataset, CacheError> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)
      .map_err(|e| CacheError::io(path, e))?
      .len();
    let hash = hash_file(path)?;
    Ok(self.register(hash, size, Some(path.to_path_buf())))
  }

  /// Register a dataset whose hash is already known.
  pub fn register(&self, hash: ContentHash, size: u64, path: Option<PathBuf>) -> Dataset {
    let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let id = DatasetId(registry.next_id);
    registry.next_id += 1;
    let dataset = Dataset {
      id,
      hash,
      size,
      path,
    };
    registry.datasets.insert(id, dataset.clone());
    dataset
  }

  pub fn get(&self, id: DatasetId) -> Result<Dataset, CacheError> {
    let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    registry
      .datasets
      .get(&id)
      .cloned()
      .ok_or(CacheError::UnknownDataset { id })
  }

  /// Whether every dataset in `ids` still has its bytes.
  pub fn all_retained(&self, ids: &[DatasetId]) -> bool {
    let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    ids.iter().all(|id| {
      registry
        .datasets
        .get(id)
        .is_some_and(Dataset::is_retained)
    })
  }

  /// Datasets whose bytes live somewhere below `dir`.
  pub fn retained_under(&self, dir: &Path) -> Vec<DatasetId> {
    let registry = self.inner.read().unwrap_or_else(PoisonError::into_inner);
    let mut ids: Vec<DatasetId> = registry
      .datasets
      .values()
      .filter(|d| d.path.as_deref().is_some_and(|p| p.starts_with(dir)))
      .map(|d| d.id)
      .collect();
    ids.sort();
    ids
  }

  /// Point a dataset at freshly regenerated bytes.
  pub fn restore(&self, id: DatasetId, path: PathBuf) -> Result<(), CacheError> {
    let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    let dataset = registry
      .datasets
      .get_mut(&id)
      .ok_or(CacheError::UnknownDataset { id })?;
    dataset.path = Some(path);
    Ok(())
  }

  /// Delete a dataset's bytes, keeping its metadata.
  pub fn purge(&self, id: DatasetId) -> Result<(), CacheError> {
    let path = {
      let mut registry = self.inner.write().unwrap_or_else(PoisonError::into_inner);
      let dataset = registry
        .datasets
        .get_mut(&id)
        .ok_or(CacheError::UnknownDataset { id })?;
      dataset.path.take()
    };

    if let Some(path) = path {
      match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::io(path, e)),
      }
      info!(dataset = %id, path = %path.display(), "dataset_purged");
    }
    Ok(())
  }
}
