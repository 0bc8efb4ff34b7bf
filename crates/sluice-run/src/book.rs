use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::TransitionError;
use crate::tree::{RunId, RunTree};

/// Live run trees, each behind its own lock.
///
/// Every mutation goes through [`RunBook::transact`], which holds the tree's
/// lock for the whole closure and applies the changes only if the closure
/// succeeds.
#[derive(Debug, Clone, Default)]
pub struct RunBook {
  trees: Arc<RwLock<HashMap<RunId, Arc<Mutex<RunTree>>>>>,
}

impl RunBook {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, tree: RunTree) -> RunId {
    let run_id = tree.run_id();
    let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
    trees.insert(run_id, Arc::new(Mutex::new(tree)));
    run_id
  }

  /// Drop a run, returning its final tree.
  pub fn remove(&self, run_id: RunId) -> Option<RunTree> {
    let entry = {
      let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
      trees.remove(&run_id)?
    };
    let tree = entry.lock().unwrap_or_else(PoisonError::into_inner);
    Some(tree.clone())
  }

  pub fn contains(&self, run_id: RunId) -> bool {
    let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
    trees.contains_key(&run_id)
  }

  fn entry(&self, run_id: RunId) -> Result<Arc<Mutex<RunTree>>, TransitionError> {
    let trees = self.trees.read().unwrap_or_else(PoisonError::into_inner);
    trees
      .get(&run_id)
      .cloned()
      .ok_or(TransitionError::UnknownRun { run_id })
  }

  /// A copy of the current tree.
  pub fn snapshot(&self, run_id: RunId) -> Result<RunTree, TransitionError> {
    let entry = self.entry(run_id)?;
    let tree = entry.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(tree.clone())
  }

  /// Run `f` against the tree under its lock. Changes are committed only
  /// when `f` returns `Ok`.
  pub fn transact<R>(
    &self,
    run_id: RunId,
    f: impl FnOnce(&mut RunTree) -> Result<R, TransitionError>,
  ) -> Result<R, TransitionError> {
    let entry = self.entry(run_id)?;
    let mut tree = entry.lock().unwrap_or_else(PoisonError::into_inner);
    let mut draft = tree.clone();
    let out = f(&mut draft)?;
    *tree = draft;
    Ok(out)
  }
}
