use std::path::{Path, PathBuf};

use crate::error::ContainerError;

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const LOGS_DIR: &str = "logs";
pub const OUTCOME_FILE: &str = "outcome.json";
pub const TASK_FILE: &str = "task.json";

/// Working directory of one task.
///
/// ```text
/// <root>/
/// ├── input/
/// ├── output/
/// ├── logs/       stdout.txt, stderr.txt, outcome.json
/// └── step_01/    per internal step, same layout
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
  root: PathBuf,
}

impl Sandbox {
  /// Create the directory layout under `root`.
  pub fn create(root: impl Into<PathBuf>) -> Result<Self, ContainerError> {
    let sandbox = Self { root: root.into() };
    for dir in [sandbox.input_dir(), sandbox.output_dir(), sandbox.logs_dir()] {
      std::fs::create_dir_all(&dir).map_err(|e| ContainerError::io(&dir, e))?;
    }
    Ok(sandbox)
  }

  /// Refer to an existing sandbox without touching the filesystem.
  pub fn at(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn input_dir(&self) -> PathBuf {
    self.root.join(INPUT_DIR)
  }

  pub fn output_dir(&self) -> PathBuf {
    self.root.join(OUTPUT_DIR)
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.root.join(LOGS_DIR)
  }

  pub fn stdout_path(&self) -> PathBuf {
    self.logs_dir().join("stdout.txt")
  }

  pub fn stderr_path(&self) -> PathBuf {
    self.logs_dir().join("stderr.txt")
  }

  pub fn outcome_path(&self) -> PathBuf {
    self.logs_dir().join(OUTCOME_FILE)
  }

  pub fn task_path(&self) -> PathBuf {
    self.root.join(TASK_FILE)
  }

  /// Sandbox of internal step `index` (zero based), created on demand.
  pub fn step(&self, index: usize) -> Result<Sandbox, ContainerError> {
    Sandbox::create(self.root.join(format!("step_{:02}", index + 1)))
  }
}

/// Hard-link `src` to `dst`, copying when linking is not possible (e.g.
/// across filesystems).
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<(), ContainerError> {
  if dst.exists() {
    std::fs::remove_file(dst).map_err(|e| ContainerError::io(dst, e))?;
  }
  if std::fs::hard_link(src, dst).is_ok() {
    return Ok(());
  }
  std::fs::copy(src, dst)
    .map(|_| ())
    .map_err(|e| ContainerError::io(src, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_layout_created() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Sandbox::create(dir.path().join("task")).unwrap();
    assert!(sandbox.input_dir().is_dir());
    assert!(sandbox.output_dir().is_dir());
    assert!(sandbox.logs_dir().is_dir());

    let step = sandbox.step(0).unwrap();
    assert!(step.root().ends_with("step_01"));
    assert!(step.input_dir().is_dir());
  }

  #[test]
  fn test_link_replaces_existing() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    std::fs::write(&src, b"new").unwrap();
    std::fs::write(&dst, b"old").unwrap();
    link_or_copy(&src, &dst).unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), b"new");
  }
}
