//! Execution backends: the two ways a worker can run a task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sluice_container::{ContainerRunner, OutcomeKind, Sandbox, TaskOutcome};
use sluice_scheduler::{BatchScheduler, JobHandle, JobState, SchedulerError, SubmitRequest};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::descriptor::{Target, TaskDescriptor};
use crate::error::FleetError;

/// Runs one task to completion and classifies how it ended.
///
/// Implementations report every failure as an outcome; the worker relies on
/// `execute` returning exactly once per task.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
  fn name(&self) -> &'static str;

  /// Startup check. A backend that cannot work at all fails here.
  async fn check(&self) -> Result<(), FleetError> {
    Ok(())
  }

  async fn execute(&self, task: &TaskDescriptor, cancel: &CancellationToken) -> TaskOutcome;
}

/// Runs tasks in a sandbox on this host.
#[derive(Debug, Clone, Default)]
pub struct ContainerBackend {
  runner: ContainerRunner,
}

impl ContainerBackend {
  pub fn new(runner: ContainerRunner) -> Self {
    Self { runner }
  }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
  fn name(&self) -> &'static str {
    "container"
  }

  async fn execute(&self, task: &TaskDescriptor, cancel: &CancellationToken) -> TaskOutcome {
    let started_at = Utc::now();
    match self.runner.run(&task.container, &task.sandbox, cancel).await {
      Ok(outcome) => outcome,
      Err(e) => TaskOutcome::without_return_code(
        &task.container.task_id,
        OutcomeKind::Failed,
        started_at,
        e.to_string(),
      ),
    }
  }
}

/// Runs tasks as batch jobs.
///
/// The task is written to `task.json` in its sandbox and the helper program
/// (`sluice exec-task task.json`) is submitted as the job. The helper runs
/// the container task on the compute node and leaves `logs/outcome.json`
/// behind, which is read once the job stops.
pub struct SchedulerBackend {
  scheduler: Arc<dyn BatchScheduler>,
  helper: PathBuf,
  poll_interval: Duration,
}

impl SchedulerBackend {
  pub fn new(
    scheduler: Arc<dyn BatchScheduler>,
    helper: impl Into<PathBuf>,
    poll_interval: Duration,
  ) -> Self {
    Self {
      scheduler,
      helper: helper.into(),
      poll_interval,
    }
  }

  fn request(&self, task: &TaskDescriptor, sandbox: &Sandbox) -> SubmitRequest {
    SubmitRequest {
      job_name: task.run_component_id.clone(),
      workdir: task.sandbox.clone(),
      driver: self.helper.clone(),
      args: vec![
        "exec-task".to_string(),
        sandbox.task_path().display().to_string(),
      ],
      uid: task.owner_uid,
      gid: task.owner_gid,
      priority: task.priority,
      cpu_count: task.cpu_count,
      memory_mb: task.memory_mb,
      stdout: sandbox.root().join("job.out"),
      stderr: sandbox.root().join("job.err"),
      after_ok: Vec::new(),
      after_any: Vec::new(),
    }
  }

  /// Poll until the job stops. Cancellation issues an explicit cancel and
  /// reports the job as cancelled without waiting further.
  async fn wait(
    &self,
    job: &JobHandle,
    cancel: &CancellationToken,
  ) -> Result<JobState, SchedulerError> {
    let mut interval = tokio::time::interval(self.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          let cancelled = self.scheduler.cancel(job).await?;
          info!(job = %job, cascaded = cancelled.len().saturating_sub(1), "batch_job_cancelled");
          return Ok(JobState::Cancelled);
        }
        _ = interval.tick() => {
          let state = self.scheduler.get_state(job).await?;
          if state.is_stopped() {
            return Ok(state);
          }
        }
      }
    }
  }
}

#[async_trait]
impl ExecutionBackend for SchedulerBackend {
  fn name(&self) -> &'static str {
    self.scheduler.name()
  }

  async fn check(&self) -> Result<(), FleetError> {
    self
      .scheduler
      .is_alive()
      .await
      .map_err(|source| FleetError::SchedulerUnreachable {
        scheduler: self.scheduler.name().to_string(),
        source,
      })
  }

  #[instrument(
    name = "batch_execute",
    skip(self, task, cancel),
    fields(component = %task.run_component_id, scheduler = self.scheduler.name())
  )]
  async fn execute(&self, task: &TaskDescriptor, cancel: &CancellationToken) -> TaskOutcome {
    let started_at = Utc::now();
    let task_id = task.container.task_id.as_str();
    let submission_failure = |message: String| {
      TaskOutcome::without_return_code(task_id, OutcomeKind::SubmissionFailure, started_at, message)
    };

    let sandbox = match Sandbox::create(&task.sandbox) {
      Ok(sandbox) => sandbox,
      Err(e) => return submission_failure(e.to_string()),
    };
    if let Err(e) = task.container.write(sandbox.task_path()) {
      return submission_failure(e.to_string());
    }

    let job = match self.scheduler.submit(self.request(task, &sandbox)).await {
      Ok(job) => job,
      Err(e) => {
        warn!(error = %e, "batch_submit_failed");
        return submission_failure(e.to_string());
      }
    };
    info!(job = %job, "batch_job_submitted");

    let state = match self.wait(&job, cancel).await {
      Ok(state) => state,
      Err(e) => {
        warn!(job = %job, error = %e, "batch_poll_failed");
        return submission_failure(e.to_string());
      }
    };

    if state == JobState::Cancelled {
      return TaskOutcome::without_return_code(
        task_id,
        OutcomeKind::Cancelled,
        started_at,
        format!("batch job {} was cancelled", job),
      );
    }

    match TaskOutcome::read(sandbox.outcome_path()) {
      Ok(outcome) => outcome,
      Err(e) => TaskOutcome::without_return_code(
        task_id,
        OutcomeKind::Failed,
        started_at,
        format!("batch job {} ended {} without an outcome: {}", job, state, e),
      ),
    }
  }
}

/// The backends available to workers, chosen per task by its target.
#[derive(Clone)]
pub struct Backends {
  local: Arc<dyn ExecutionBackend>,
  cluster: Option<Arc<dyn ExecutionBackend>>,
}

impl Backends {
  pub fn local(backend: Arc<dyn ExecutionBackend>) -> Self {
    Self {
      local: backend,
      cluster: None,
    }
  }

  pub fn with_cluster(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
    self.cluster = Some(backend);
    self
  }

  /// Target new tasks are sent to.
  pub fn preferred_target(&self) -> Target {
    if self.cluster.is_some() {
      Target::Cluster
    } else {
      Target::Local
    }
  }

  pub fn for_target(&self, target: Target) -> Option<&Arc<dyn ExecutionBackend>> {
    match target {
      Target::Local => Some(&self.local),
      Target::Cluster => self.cluster.as_ref(),
    }
  }

  pub(crate) async fn check(&self) -> Result<(), FleetError> {
    self.local.check().await?;
    if let Some(cluster) = &self.cluster {
      cluster.check().await?;
    }
    Ok(())
  }
}
