use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::env::{ConfigError, EnvLookup, parse_or};

/// How a driver is isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
  /// Launch inside a Singularity/Apptainer container with bind mounts.
  #[default]
  Singularity,
  /// Run the driver directly inside the sandbox directory. Development only.
  Host,
}

impl FromStr for Isolation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "singularity" | "apptainer" => Ok(Self::Singularity),
      "host" => Ok(Self::Host),
      other => Err(format!("unknown isolation mode '{}'", other)),
    }
  }
}

/// Container runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
  /// Container command, e.g. `singularity` or `apptainer`.
  pub program: String,
  pub isolation: Isolation,
  /// Mount point of the sandbox `input/` directory inside the container.
  pub input_mount: String,
  /// Mount point of the sandbox `output/` directory inside the container.
  pub output_mount: String,
  /// Extra arguments placed after `exec`.
  pub extra_args: Vec<String>,
}

impl Default for ContainerConfig {
  fn default() -> Self {
    Self {
      program: "singularity".to_string(),
      isolation: Isolation::Singularity,
      input_mount: "/mnt/input".to_string(),
      output_mount: "/mnt/output".to_string(),
      extra_args: Vec::new(),
    }
  }
}

impl ContainerConfig {
  pub(crate) fn from_lookup(lookup: &dyn EnvLookup) -> Result<Self, ConfigError> {
    let defaults = Self::default();
    Ok(Self {
      program: lookup
        .get("SLUICE_CONTAINER_PROGRAM")
        .unwrap_or(defaults.program),
      isolation: parse_or(lookup, "SLUICE_CONTAINER_ISOLATION", defaults.isolation)?,
      input_mount: defaults.input_mount,
      output_mount: defaults.output_mount,
      extra_args: lookup
        .get("SLUICE_CONTAINER_EXTRA_ARGS")
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default(),
    })
  }
}
