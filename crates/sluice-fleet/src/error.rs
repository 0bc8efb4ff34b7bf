use sluice_cache::CacheError;
use sluice_container::ContainerError;
use sluice_pipeline::PipelineError;
use sluice_run::{NodeId, RunId, TransitionError};
use sluice_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
  #[error("batch scheduler '{scheduler}' is unreachable: {source}")]
  SchedulerUnreachable {
    scheduler: String,
    #[source]
    source: SchedulerError,
  },

  #[error("invalid task descriptor for {component}: {message}")]
  InvalidDescriptor { component: String, message: String },

  #[error("invalid run request: {message}")]
  InvalidRequest { message: String },

  #[error("run {run_id} component {node}: {message}")]
  Wiring {
    run_id: RunId,
    node: NodeId,
    message: String,
  },

  #[error("manager stopped before run {run_id} finished")]
  ManagerStopped { run_id: RunId },

  #[error("pipeline rejected: {0}")]
  Pipeline(#[from] PipelineError),

  #[error(transparent)]
  Transition(#[from] TransitionError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Container(#[from] ContainerError),
}
