use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sluice_cache::ContentHash;
use sluice_pipeline::InternalStep;

use crate::error::ContainerError;

/// One file the task reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
  /// File name inside the sandbox `input/` directory.
  pub name: String,
  /// Where the bytes live on the host.
  pub source: PathBuf,
  /// Recorded hash, checked before launch when present.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expected_hash: Option<ContentHash>,
}

/// Everything the runner needs to execute one task in a sandbox.
///
/// The driver is invoked as `driver <args...> <inputs...> <outputs...>`,
/// with input and output names rewritten to their paths as seen by the
/// driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerTask {
  pub task_id: String,
  pub image: PathBuf,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub app: Option<String>,
  pub driver: String,
  #[serde(default)]
  pub args: Vec<String>,
  pub inputs: Vec<TaskInput>,
  pub outputs: Vec<String>,
  /// Internal steps of a multi-step image, run in order.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub steps: Vec<InternalStep>,
}

impl ContainerTask {
  pub fn is_multi_step(&self) -> bool {
    !self.steps.is_empty()
  }

  pub fn read(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ContainerError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
  }

  pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ContainerError> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(self)?;
    std::fs::write(path, content).map_err(|e| ContainerError::io(path, e))
  }

  pub(crate) fn validate(&self) -> Result<(), ContainerError> {
    let invalid = |message: String| ContainerError::InvalidTask { message };
    if self.driver.trim().is_empty() && !self.is_multi_step() && self.app.is_none() {
      return Err(invalid("driver must not be empty".to_string()));
    }
    for name in self
      .inputs
      .iter()
      .map(|i| i.name.as_str())
      .chain(self.outputs.iter().map(String::as_str))
    {
      if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(invalid(format!("'{}' is not a plain file name", name)));
      }
    }
    Ok(())
  }
}
