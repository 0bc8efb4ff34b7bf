use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Identity of a method revision. Two executions share cached results only
/// when their method identities are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId {
  pub family: String,
  pub revision: u32,
}

impl MethodId {
  pub fn new(family: impl Into<String>, revision: u32) -> Self {
    Self {
      family: family.into(),
      revision,
    }
  }
}

impl fmt::Display for MethodId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@r{}", self.family, self.revision)
  }
}

/// Whether results of a method may satisfy later executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reusability {
  /// Same inputs always produce bit-identical outputs.
  #[default]
  Deterministic,
  /// Outputs may differ between executions but are interchangeable.
  Reusable,
  /// Always re-execute.
  NonReusable,
}

/// One internal step of a multi-step container image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalStep {
  pub driver: String,
  /// Names consumed by this step: task inputs or outputs of earlier steps.
  pub inputs: Vec<String>,
  pub outputs: Vec<String>,
}

/// Container image a method runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
  pub path: PathBuf,
  /// Sub-application inside the image (`--app`).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub app: Option<String>,
  /// Non-empty for multi-step images.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub steps: Vec<InternalStep>,
}

impl ImageRef {
  pub fn is_multi_step(&self) -> bool {
    !self.steps.is_empty()
  }
}

/// A containerised program with declared inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
  pub id: MethodId,
  /// Driver program, relative to the image.
  pub driver: String,
  pub image: ImageRef,
  pub inputs: Vec<String>,
  pub outputs: Vec<String>,
  #[serde(default = "default_threads")]
  pub threads: u32,
  #[serde(default)]
  pub memory_mb: u64,
  #[serde(default)]
  pub reusable: Reusability,
}

fn default_threads() -> u32 {
  1
}

impl Method {
  pub(crate) fn validate(&self) -> Result<(), PipelineError> {
    let invalid = |message: &str| PipelineError::InvalidMethod {
      method: self.id.to_string(),
      message: message.to_string(),
    };

    if self.driver.trim().is_empty() && !self.image.is_multi_step() {
      return Err(invalid("driver must not be empty"));
    }
    if self.threads == 0 {
      return Err(invalid("threads must be at least 1"));
    }
    if self.outputs.is_empty() {
      return Err(invalid("a method must declare at least one output"));
    }
    if has_duplicates(&self.inputs) || has_duplicates(&self.outputs) {
      return Err(invalid("input and output names must be unique"));
    }

    // Every internal step must consume something already available.
    let mut available: Vec<&str> = self.inputs.iter().map(String::as_str).collect();
    for (i, step) in self.image.steps.iter().enumerate() {
      if let Some(missing) = step.inputs.iter().find(|n| !available.contains(&n.as_str())) {
        return Err(invalid(&format!(
          "internal step {} consumes '{}' before it is produced",
          i + 1,
          missing
        )));
      }
      available.extend(step.outputs.iter().map(String::as_str));
    }
    if self.image.is_multi_step()
      && let Some(missing) = self.outputs.iter().find(|n| !available.contains(&n.as_str()))
    {
      return Err(invalid(&format!(
        "output '{}' is not produced by any internal step",
        missing
      )));
    }

    Ok(())
  }

  /// Whether a cached result may satisfy this method.
  pub fn is_reusable(&self) -> bool {
    self.reusable != Reusability::NonReusable
  }
}

fn has_duplicates(names: &[String]) -> bool {
  names
    .iter()
    .enumerate()
    .any(|(i, n)| names[..i].contains(n))
}
