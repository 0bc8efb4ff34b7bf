use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sluice_container::{ContainerTask, Sandbox};

use crate::error::FleetError;

/// Where a task executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
  /// In a sandbox on the manager's host.
  #[default]
  Local,
  /// As a job of the batch scheduler.
  Cluster,
}

/// Account and resources a task runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
  pub owner_uid: Option<u32>,
  pub owner_gid: Option<u32>,
  pub priority: u32,
  pub cpu_count: u32,
  pub memory_mb: u64,
}

impl Default for Resources {
  fn default() -> Self {
    Self {
      owner_uid: None,
      owner_gid: None,
      priority: 0,
      cpu_count: 1,
      memory_mb: 0,
    }
  }
}

/// The unit of work handed to a worker.
///
/// Paths are derived from the sandbox and container task, so a descriptor
/// built through [`TaskDescriptor::new`] always agrees with what the
/// container runner will create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
  pub run_component_id: String,
  pub driver_path: String,
  pub args: Vec<String>,
  pub input_paths: Vec<PathBuf>,
  pub output_paths: Vec<PathBuf>,
  pub stdout_path: PathBuf,
  pub stderr_path: PathBuf,
  pub owner_uid: Option<u32>,
  pub owner_gid: Option<u32>,
  pub priority: u32,
  pub cpu_count: u32,
  pub memory_mb: u64,
  pub target: Target,
  pub container: ContainerTask,
  pub sandbox: PathBuf,
}

impl TaskDescriptor {
  pub fn new(
    run_component_id: impl Into<String>,
    container: ContainerTask,
    sandbox: impl Into<PathBuf>,
    resources: Resources,
    target: Target,
  ) -> Result<Self, FleetError> {
    let run_component_id = run_component_id.into();
    let sandbox = sandbox.into();
    let invalid = |message: &str| FleetError::InvalidDescriptor {
      component: run_component_id.clone(),
      message: message.to_string(),
    };

    if run_component_id.trim().is_empty() {
      return Err(invalid("component id must not be empty"));
    }
    if container.driver.trim().is_empty() && !container.is_multi_step() && container.app.is_none() {
      return Err(invalid("driver must not be empty"));
    }
    if container.outputs.is_empty() {
      return Err(invalid("a task must declare at least one output"));
    }
    if resources.cpu_count == 0 {
      return Err(invalid("cpu_count must be at least 1"));
    }
    if !sandbox.is_absolute() {
      return Err(invalid("sandbox path must be absolute"));
    }

    let layout = Sandbox::at(&sandbox);
    Ok(Self {
      driver_path: container.driver.clone(),
      args: container.args.clone(),
      input_paths: container.inputs.iter().map(|i| i.source.clone()).collect(),
      output_paths: container
        .outputs
        .iter()
        .map(|name| layout.output_dir().join(name))
        .collect(),
      stdout_path: layout.stdout_path(),
      stderr_path: layout.stderr_path(),
      owner_uid: resources.owner_uid,
      owner_gid: resources.owner_gid,
      priority: resources.priority,
      cpu_count: resources.cpu_count,
      memory_mb: resources.memory_mb,
      run_component_id,
      target,
      container,
      sandbox,
    })
  }
}
