//! Manager tests driving real runs through host-isolated shell drivers.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sluice_cache::{DatasetRegistry, ResultCache, hash_bytes};
use sluice_config::{ContainerConfig, FleetConfig, Isolation};
use sluice_container::{ContainerRunner, ContainerTask, OutcomeKind, TaskOutcome};
use sluice_fleet::{
  Backends, ChannelNotifier, ContainerBackend, ExecutionBackend, FleetError, FleetEvent, Manager,
  ManagerHandle, RunRequest, RunSummary, SchedulerBackend, TaskDescriptor,
};
use sluice_pipeline::{
  CableSource, ImageRef, InputCable, Method, MethodId, OutputCable, Pipeline, PipelineStep,
  Reusability, Transformation,
};
use sluice_run::RunState;
use sluice_scheduler::{
  AccountingRecord, BatchScheduler, JobHandle, JobState, SchedulerError, SubmitRequest,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const RUN_TIMEOUT: Duration = Duration::from_secs(20);

/// Write an executable shell script.
fn script(dir: &Path, name: &str, body: &str) -> String {
  let path = dir.join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
  path.display().to_string()
}

fn method(family: &str, revision: u32, driver: String, inputs: &[&str], outputs: &[&str]) -> Method {
  Method {
    id: MethodId::new(family, revision),
    driver,
    image: ImageRef {
      path: PathBuf::from("/images/unused.simg"),
      app: None,
      steps: Vec::new(),
    },
    inputs: inputs.iter().map(|s| s.to_string()).collect(),
    outputs: outputs.iter().map(|s| s.to_string()).collect(),
    threads: 1,
    memory_mb: 0,
    reusable: Reusability::Deterministic,
  }
}

fn step(name: &str, transformation: Transformation, sources: &[CableSource]) -> PipelineStep {
  PipelineStep {
    name: name.to_string(),
    transformation,
    cables: sources
      .iter()
      .enumerate()
      .map(|(dest, source)| InputCable {
        source: *source,
        dest,
      })
      .collect(),
  }
}

fn input(index: usize) -> CableSource {
  CableSource::PipelineInput { index }
}

fn from_step(step: usize, output: usize) -> CableSource {
  CableSource::StepOutput { step, output }
}

/// `upper` then `count`: uppercases the input and counts its lines.
fn two_step(dir: &Path, upper_revision: u32) -> Pipeline {
  let upper = script(dir, "upper.sh", "tr a-z A-Z < \"$1\" > \"$2\"");
  let count = script(dir, "count.sh", "wc -l < \"$1\" | tr -d ' ' > \"$2\"");
  Pipeline {
    pipeline_id: "upper-count".to_string(),
    name: "upper and count".to_string(),
    inputs: vec!["text".to_string()],
    steps: vec![
      step(
        "upper",
        Transformation::Method(method("upper", upper_revision, upper, &["text"], &["upper"])),
        &[input(0)],
      ),
      step(
        "count",
        Transformation::Method(method("count", 1, count, &["text"], &["lines"])),
        &[from_step(0, 0)],
      ),
    ],
    outputs: vec![
      OutputCable {
        name: "upper".to_string(),
        source: from_step(0, 0),
      },
      OutputCable {
        name: "lines".to_string(),
        source: from_step(1, 0),
      },
    ],
  }
}

fn single_step(id: &str, driver: String) -> Pipeline {
  Pipeline {
    pipeline_id: id.to_string(),
    name: id.to_string(),
    inputs: vec!["text".to_string()],
    steps: vec![
      step(
        "first",
        Transformation::Method(method(id, 1, driver, &["text"], &["out"])),
        &[input(0)],
      ),
      step(
        "second",
        Transformation::Method(method("copy", 1, "/bin/cp".to_string(), &["text"], &["out"])),
        &[from_step(0, 0)],
      ),
    ],
    outputs: vec![OutputCable {
      name: "out".to_string(),
      source: from_step(1, 0),
    }],
  }
}

fn write_input(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
  let inputs = dir.join("inputs");
  std::fs::create_dir_all(&inputs).expect("inputs dir");
  let path = inputs.join(name);
  std::fs::write(&path, content).expect("write input");
  path
}

fn fleet_config(dir: &Path) -> FleetConfig {
  FleetConfig {
    worker_count: 2,
    poll_interval_ms: 10,
    sandbox_root: dir.join("sandboxes"),
    ..FleetConfig::default()
  }
}

fn host_backends() -> Backends {
  Backends::local(Arc::new(ContainerBackend::new(host_runner())))
}

fn host_runner() -> ContainerRunner {
  ContainerRunner::new(ContainerConfig {
    isolation: Isolation::Host,
    ..Default::default()
  })
}

/// Batch scheduler whose jobs do what `sluice exec-task` does on a compute
/// node: read `task.json` and run it in its sandbox. Jobs sit in the queue
/// for `queue_delay` before they start.
struct InProcessCluster {
  runner: ContainerRunner,
  queue_delay: Duration,
  next_id: AtomicU64,
  jobs: Mutex<HashMap<JobHandle, (watch::Receiver<JobState>, CancellationToken)>>,
  submitted: Mutex<Vec<(JobHandle, SubmitRequest)>>,
  cancelled: Mutex<Vec<JobHandle>>,
}

impl InProcessCluster {
  fn new(queue_delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      runner: host_runner(),
      queue_delay,
      next_id: AtomicU64::new(1),
      jobs: Mutex::new(HashMap::new()),
      submitted: Mutex::new(Vec::new()),
      cancelled: Mutex::new(Vec::new()),
    })
  }

  fn submitted(&self) -> Vec<(JobHandle, SubmitRequest)> {
    self.submitted.lock().expect("submitted").clone()
  }

  fn cancelled(&self) -> Vec<JobHandle> {
    self.cancelled.lock().expect("cancelled").clone()
  }
}

#[async_trait]
impl BatchScheduler for InProcessCluster {
  fn name(&self) -> &'static str {
    "in-process"
  }

  async fn is_alive(&self) -> Result<(), SchedulerError> {
    Ok(())
  }

  async fn submit(&self, request: SubmitRequest) -> Result<JobHandle, SchedulerError> {
    let job = JobHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
    let (tx, rx) = watch::channel(JobState::Pending);
    let cancel = CancellationToken::new();

    let runner = self.runner.clone();
    let delay = self.queue_delay;
    let task_file = PathBuf::from(&request.args[1]);
    let workdir = request.workdir.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = token.cancelled() => {
          tx.send_replace(JobState::Cancelled);
          return;
        }
      }
      tx.send_replace(JobState::Running);
      let state = match ContainerTask::read(&task_file) {
        Ok(task) => match runner.run(&task, &workdir, &token).await {
          Ok(outcome) if outcome.kind.is_success() => JobState::Completed,
          Ok(outcome) if outcome.kind == OutcomeKind::Cancelled => JobState::Cancelled,
          _ => JobState::Failed,
        },
        Err(_) => JobState::Failed,
      };
      tx.send_replace(state);
    });

    self.jobs.lock().expect("jobs").insert(job.clone(), (rx, cancel));
    self.submitted.lock().expect("submitted").push((job.clone(), request));
    Ok(job)
  }

  async fn get_state(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
    let jobs = self.jobs.lock().expect("jobs");
    jobs
      .get(job)
      .map(|(state, _)| *state.borrow())
      .ok_or_else(|| SchedulerError::UnknownJob { job: job.clone() })
  }

  async fn cancel(&self, job: &JobHandle) -> Result<Vec<JobHandle>, SchedulerError> {
    if let Some((_, token)) = self.jobs.lock().expect("jobs").get(job) {
      token.cancel();
    }
    self.cancelled.lock().expect("cancelled").push(job.clone());
    Ok(vec![job.clone()])
  }

  async fn set_priority(&self, _jobs: &[JobHandle], _priority: u32) -> Result<(), SchedulerError> {
    Ok(())
  }

  async fn accounting(
    &self,
    _jobs: &[JobHandle],
  ) -> Result<HashMap<JobHandle, AccountingRecord>, SchedulerError> {
    Ok(HashMap::new())
  }
}

fn cluster_backends(cluster: Arc<InProcessCluster>) -> Backends {
  let batch = SchedulerBackend::new(cluster, "/usr/local/bin/sluice", Duration::from_millis(10));
  host_backends().with_cluster(Arc::new(batch))
}

struct Fleet {
  handle: ManagerHandle,
  datasets: DatasetRegistry,
  events: mpsc::UnboundedReceiver<FleetEvent>,
  cancel: CancellationToken,
}

impl Fleet {
  fn start(config: FleetConfig, backends: Backends) -> Self {
    let datasets = DatasetRegistry::new();
    let (tx, events) = mpsc::unbounded_channel();
    let manager = Manager::with_notifier(
      config,
      backends,
      ResultCache::new(),
      datasets.clone(),
      ChannelNotifier::new(tx),
    );
    let handle = manager.handle();
    let cancel = CancellationToken::new();
    tokio::spawn(manager.start(cancel.clone()));
    Self {
      handle,
      datasets,
      events,
      cancel,
    }
  }

  async fn run(&self, pipeline: Pipeline, inputs: Vec<PathBuf>) -> RunSummary {
    let ticket = self
      .handle
      .submit_run(RunRequest::new(pipeline, inputs))
      .expect("submit");
    tokio::time::timeout(RUN_TIMEOUT, ticket.wait())
      .await
      .expect("run finished in time")
      .expect("summary")
  }
}

impl Drop for Fleet {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

fn step_summary<'a>(summary: &'a RunSummary, name: &str) -> &'a sluice_fleet::StepSummary {
  summary
    .steps
    .iter()
    .find(|s| s.name == name)
    .unwrap_or_else(|| panic!("no step '{}' in {:?}", name, summary.steps))
}

#[tokio::test]
async fn test_run_succeeds_and_reports_outputs() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());
  let text = write_input(dir.path(), "text", b"a\nb\nc\n");

  let summary = fleet.run(two_step(dir.path(), 1), vec![text]).await;

  assert_eq!(summary.state, RunState::Successful, "{:?}", summary);
  assert_eq!(summary.outputs.len(), 2);
  assert_eq!(summary.outputs[0].name, "upper");
  assert_eq!(summary.outputs[0].hash, hash_bytes(b"A\nB\nC\n"));
  assert_eq!(summary.outputs[1].hash, hash_bytes(b"3\n"));
  assert!(summary.first_failure.is_none());
  for name in ["upper", "count"] {
    let step = step_summary(&summary, name);
    assert_eq!(step.state, RunState::Successful);
    assert!(step.reused.is_none());
    assert!(step.log_id.is_some());
    assert_eq!(step.return_code, Some(0));
  }
}

#[tokio::test]
async fn test_second_run_reuses_every_step() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());

  let first = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "one", b"x\ny\n")])
    .await;
  assert_eq!(first.state, RunState::Successful);

  // Same bytes under a different name hash the same.
  let second = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "two", b"x\ny\n")])
    .await;
  assert_eq!(second.state, RunState::Successful);
  for name in ["upper", "count"] {
    let step = step_summary(&second, name);
    assert!(step.reused.is_some(), "{} was not reused", name);
    assert!(step.log_id.is_none());
  }
  assert_eq!(second.outputs[1].hash, first.outputs[1].hash);
}

#[tokio::test]
async fn test_changed_input_is_not_reused() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());

  fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "one", b"x\n")])
    .await;
  let second = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "two", b"X\n")])
    .await;

  assert_eq!(second.state, RunState::Successful);
  assert!(step_summary(&second, "upper").reused.is_none());
  // Both inputs uppercase to the same bytes, so the second step matches.
  assert!(step_summary(&second, "count").reused.is_some());
}

#[tokio::test]
async fn test_failed_step_reports_first_failure() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());
  let failing = script(dir.path(), "fail.sh", "echo first >&2\necho boom >&2\nexit 3");

  let summary = fleet
    .run(
      single_step("failing", failing),
      vec![write_input(dir.path(), "text", b"a\n")],
    )
    .await;

  assert_eq!(summary.state, RunState::Failed);
  assert_eq!(summary.first_failure.as_deref(), Some("first"));
  assert_eq!(summary.failure_kind, Some(OutcomeKind::Failed));
  assert_eq!(summary.return_code, Some(3));
  assert_eq!(summary.stderr_tail.as_deref(), Some("first\nboom"));
  assert_eq!(step_summary(&summary, "second").state, RunState::Cancelled);
  assert!(summary.outputs.is_empty());
}

#[tokio::test]
async fn test_cancel_stops_running_step() {
  let dir = tempfile::tempdir().expect("temp dir");
  let mut fleet = Fleet::start(fleet_config(dir.path()), host_backends());
  let slow = script(dir.path(), "slow.sh", "sleep 30\ncp \"$1\" \"$2\"");

  let ticket = fleet
    .handle
    .submit_run(RunRequest::new(
      single_step("slow", slow),
      vec![write_input(dir.path(), "text", b"a\n")],
    ))
    .expect("submit");

  loop {
    let event = tokio::time::timeout(RUN_TIMEOUT, fleet.events.recv())
      .await
      .expect("event in time")
      .expect("event");
    if matches!(event, FleetEvent::ComponentDispatched { .. }) {
      break;
    }
  }
  fleet.handle.cancel_run(ticket.run_id()).expect("cancel");

  let summary = tokio::time::timeout(RUN_TIMEOUT, ticket.wait())
    .await
    .expect("cancelled in time")
    .expect("summary");
  assert_eq!(summary.state, RunState::Cancelled);
  assert_eq!(step_summary(&summary, "first").state, RunState::Cancelled);
  assert_eq!(step_summary(&summary, "second").state, RunState::Cancelled);
  assert!(summary.first_failure.is_none());
}

struct Panicking;

#[async_trait]
impl ExecutionBackend for Panicking {
  fn name(&self) -> &'static str {
    "panicking"
  }

  async fn execute(&self, _task: &TaskDescriptor, _cancel: &CancellationToken) -> TaskOutcome {
    panic!("backend exploded")
  }
}

#[tokio::test]
async fn test_worker_panic_fails_component() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), Backends::local(Arc::new(Panicking)));

  let summary = fleet
    .run(
      single_step("panics", "/bin/cp".to_string()),
      vec![write_input(dir.path(), "text", b"a\n")],
    )
    .await;

  assert_eq!(summary.state, RunState::Failed);
  assert_eq!(summary.failure_kind, Some(OutcomeKind::WorkerFailure));
  assert!(
    summary
      .message
      .as_deref()
      .is_some_and(|m| m.contains("backend exploded"))
  );
}

struct Hanging;

#[async_trait]
impl ExecutionBackend for Hanging {
  fn name(&self) -> &'static str {
    "hanging"
  }

  async fn execute(&self, _task: &TaskDescriptor, _cancel: &CancellationToken) -> TaskOutcome {
    std::future::pending().await
  }
}

#[tokio::test]
async fn test_silent_worker_is_reclaimed_after_deadline() {
  let dir = tempfile::tempdir().expect("temp dir");
  let config = FleetConfig {
    dispatch_deadline_secs: 1,
    ..fleet_config(dir.path())
  };
  let fleet = Fleet::start(config, Backends::local(Arc::new(Hanging)));

  let summary = fleet
    .run(
      single_step("hangs", "/bin/cp".to_string()),
      vec![write_input(dir.path(), "text", b"a\n")],
    )
    .await;

  assert_eq!(summary.state, RunState::Failed);
  assert_eq!(summary.failure_kind, Some(OutcomeKind::WorkerFailure));
  assert_eq!(summary.first_failure.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_purged_intermediate_is_regenerated() {
  let dir = tempfile::tempdir().expect("temp dir");
  let config = fleet_config(dir.path());
  let sandbox_root = config.sandbox_root.clone();
  let fleet = Fleet::start(config, host_backends());

  let first = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "one", b"q\nr\n")])
    .await;
  assert_eq!(first.state, RunState::Successful);

  for id in fleet.datasets.retained_under(&sandbox_root) {
    fleet.datasets.purge(id).expect("purge");
  }

  // `upper` is reused but its output bytes are gone; `count` must read them.
  let mut pipeline = two_step(dir.path(), 1);
  if let Transformation::Method(m) = &mut pipeline.steps[1].transformation {
    m.id.revision = 2;
  }
  let second = fleet
    .run(pipeline, vec![write_input(dir.path(), "two", b"q\nr\n")])
    .await;

  assert_eq!(second.state, RunState::Successful, "{:?}", second);
  let upper = step_summary(&second, "upper");
  assert!(upper.reused.is_some());
  assert!(upper.log_id.is_none());
  assert_eq!(upper.recoveries, 1);
  let count = step_summary(&second, "count");
  assert!(count.reused.is_none());
  assert_eq!(count.return_code, Some(0));
  assert_eq!(second.outputs[1].hash, hash_bytes(b"2\n"));
}

#[tokio::test]
async fn test_nested_pipeline_runs_as_sub_run() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());
  let upper = script(dir.path(), "upper.sh", "tr a-z A-Z < \"$1\" > \"$2\"");
  let mark = script(dir.path(), "mark.sh", "sed 's/$/!/' < \"$1\" > \"$2\"");

  let inner = Pipeline {
    pipeline_id: "inner".to_string(),
    name: "inner".to_string(),
    inputs: vec!["text".to_string()],
    steps: vec![step(
      "upper",
      Transformation::Method(method("upper", 1, upper, &["text"], &["upper"])),
      &[input(0)],
    )],
    outputs: vec![OutputCable {
      name: "upper".to_string(),
      source: from_step(0, 0),
    }],
  };
  let outer = Pipeline {
    pipeline_id: "outer".to_string(),
    name: "outer".to_string(),
    inputs: vec!["text".to_string()],
    steps: vec![
      step("prep", Transformation::Pipeline(Box::new(inner)), &[input(0)]),
      step(
        "mark",
        Transformation::Method(method("mark", 1, mark, &["text"], &["marked"])),
        &[from_step(0, 0)],
      ),
    ],
    outputs: vec![OutputCable {
      name: "marked".to_string(),
      source: from_step(1, 0),
    }],
  };

  let summary = fleet
    .run(outer, vec![write_input(dir.path(), "text", b"abc\n")])
    .await;

  assert_eq!(summary.state, RunState::Successful, "{:?}", summary);
  assert_eq!(summary.outputs[0].hash, hash_bytes(b"ABC!\n"));
  assert_eq!(step_summary(&summary, "prep/upper").state, RunState::Successful);
  assert_eq!(step_summary(&summary, "mark").return_code, Some(0));
}

#[tokio::test]
async fn test_unreadable_input_fails_run_without_dispatch() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());

  let summary = fleet
    .run(two_step(dir.path(), 1), vec![dir.path().join("missing")])
    .await;

  assert_eq!(summary.state, RunState::Failed);
  assert!(summary.steps.is_empty());
  assert!(summary.message.is_some());
}

#[tokio::test]
async fn test_submit_rejects_wrong_input_count() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fleet = Fleet::start(fleet_config(dir.path()), host_backends());

  let result = fleet
    .handle
    .submit_run(RunRequest::new(two_step(dir.path(), 1), Vec::new()));
  assert!(matches!(result, Err(FleetError::InvalidRequest { .. })));
}

#[tokio::test]
async fn test_rerun_after_purge_regenerates_delivered_outputs() {
  let dir = tempfile::tempdir().expect("temp dir");
  let config = fleet_config(dir.path());
  let sandbox_root = config.sandbox_root.clone();
  let fleet = Fleet::start(config, host_backends());

  let first = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "one", b"u\nv\n")])
    .await;
  assert_eq!(first.state, RunState::Successful);

  for id in fleet.datasets.retained_under(&sandbox_root) {
    fleet.datasets.purge(id).expect("purge");
  }
  std::fs::remove_dir_all(&sandbox_root).expect("remove sandboxes");

  let second = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "two", b"u\nv\n")])
    .await;

  assert_eq!(second.state, RunState::Successful, "{:?}", second);
  for name in ["upper", "count"] {
    let step = step_summary(&second, name);
    assert!(step.reused.is_some(), "{} was not reused", name);
    assert_eq!(step.recoveries, 1);
  }
  assert_eq!(second.outputs.len(), 2);
  for output in &second.outputs {
    let path = output.path.as_ref().expect("delivered output has bytes");
    assert!(path.is_file(), "{} is missing", path.display());
  }
  let upper = second.outputs[0].path.as_ref().expect("upper path");
  assert_eq!(std::fs::read(upper).expect("read upper"), b"U\nV\n");
  assert_eq!(second.outputs[1].hash, first.outputs[1].hash);
}

#[tokio::test]
async fn test_cluster_run_round_trips_through_batch_jobs() {
  let dir = tempfile::tempdir().expect("temp dir");
  let cluster = InProcessCluster::new(Duration::ZERO);
  let fleet = Fleet::start(fleet_config(dir.path()), cluster_backends(cluster.clone()));

  let summary = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "text", b"a\nb\n")])
    .await;

  assert_eq!(summary.state, RunState::Successful, "{:?}", summary);
  assert_eq!(summary.outputs[0].hash, hash_bytes(b"A\nB\n"));
  assert_eq!(summary.outputs[1].hash, hash_bytes(b"2\n"));
  assert_eq!(step_summary(&summary, "count").return_code, Some(0));

  let submitted = cluster.submitted();
  assert_eq!(submitted.len(), 2);
  for (_, request) in &submitted {
    assert_eq!(request.driver, PathBuf::from("/usr/local/bin/sluice"));
    assert_eq!(request.args[0], "exec-task");
    assert!(Path::new(&request.args[1]).is_file());
    assert!(request.workdir.join("logs").join("outcome.json").is_file());
  }
  assert!(cluster.cancelled().is_empty());
}

#[tokio::test]
async fn test_cancel_run_cancels_batch_job() {
  let dir = tempfile::tempdir().expect("temp dir");
  let cluster = InProcessCluster::new(Duration::ZERO);
  let fleet = Fleet::start(fleet_config(dir.path()), cluster_backends(cluster.clone()));
  let slow = script(dir.path(), "slow.sh", "sleep 30\ncp \"$1\" \"$2\"");

  let ticket = fleet
    .handle
    .submit_run(RunRequest::new(
      single_step("slow", slow),
      vec![write_input(dir.path(), "text", b"a\n")],
    ))
    .expect("submit");

  tokio::time::timeout(RUN_TIMEOUT, async {
    while cluster.submitted().is_empty() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("job submitted in time");
  fleet.handle.cancel_run(ticket.run_id()).expect("cancel");

  let summary = tokio::time::timeout(RUN_TIMEOUT, ticket.wait())
    .await
    .expect("cancelled in time")
    .expect("summary");
  assert_eq!(summary.state, RunState::Cancelled);
  assert_eq!(step_summary(&summary, "first").state, RunState::Cancelled);

  let jobs: Vec<JobHandle> = cluster.submitted().into_iter().map(|(job, _)| job).collect();
  assert_eq!(cluster.cancelled(), jobs);
}

#[tokio::test]
async fn test_queued_batch_job_keeps_its_input_sandbox() {
  let dir = tempfile::tempdir().expect("temp dir");
  let config = FleetConfig {
    idle_factor: 1,
    sandbox_retention_secs: 0,
    ..fleet_config(dir.path())
  };
  // Long enough for many idle sweeps while `count` waits in the queue.
  let cluster = InProcessCluster::new(Duration::from_millis(500));
  let fleet = Fleet::start(config, cluster_backends(cluster));

  let summary = fleet
    .run(two_step(dir.path(), 1), vec![write_input(dir.path(), "text", b"a\nb\nc\n")])
    .await;

  assert_eq!(summary.state, RunState::Successful, "{:?}", summary);
  let count = step_summary(&summary, "count");
  assert_eq!(count.state, RunState::Successful);
  assert_eq!(count.return_code, Some(0));
  assert_eq!(summary.outputs[1].hash, hash_bytes(b"3\n"));
}
