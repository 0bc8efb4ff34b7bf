//! The fleet manager: one control loop that owns the run queue, the worker
//! slots and every run tree.
//!
//! Each tick it (a) expands newly queued runs, (b) settles or dispatches
//! ready components, (c) drains worker reports without blocking, reclaims
//! slots past their dispatch deadline and winds down finished runs, and
//! (d) every `idle_factor` ticks, when nothing is waiting for a slot, sweeps
//! old sandboxes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sluice_cache::{
  ContentHash, Dataset, DatasetId, DatasetRegistry, ExecLog, RecordId, ResultCache, ReuseDecision,
};
use sluice_config::FleetConfig;
use sluice_container::{ContainerTask, OutcomeKind, TaskInput, TaskOutcome};
use sluice_pipeline::{ComponentKey, Method, Pipeline};
use sluice_run::{NodeId, RunBook, RunId, RunState, RunTree, TransitionError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::Backends;
use crate::context::{Plan, RunContext, qualified_name};
use crate::descriptor::{Resources, TaskDescriptor};
use crate::error::FleetError;
use crate::events::{EventNotifier, FleetEvent, NoopNotifier};
use crate::janitor::SandboxJanitor;
use crate::worker::{Dispatch, SlotStatus, Worker, WorkerMessage};

/// Lines of stderr carried in a failure summary.
const STDERR_TAIL_LINES: usize = 20;

/// A request to execute a pipeline on a set of input files.
#[derive(Debug, Clone)]
pub struct RunRequest {
  pub pipeline: Pipeline,
  pub inputs: Vec<PathBuf>,
  pub priority: u32,
  pub owner_uid: Option<u32>,
  pub owner_gid: Option<u32>,
}

impl RunRequest {
  pub fn new(pipeline: Pipeline, inputs: Vec<PathBuf>) -> Self {
    Self {
      pipeline,
      inputs,
      priority: 0,
      owner_uid: None,
      owner_gid: None,
    }
  }

  pub fn with_priority(mut self, priority: u32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
    self.owner_uid = Some(uid);
    self.owner_gid = Some(gid);
    self
  }
}

/// A named output of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
  pub name: String,
  pub dataset: DatasetId,
  pub hash: ContentHash,
  pub path: Option<PathBuf>,
}

/// How one method step of a run was satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
  pub name: String,
  pub state: RunState,
  pub reused: Option<RecordId>,
  pub log_id: Option<Uuid>,
  pub return_code: Option<i32>,
  pub recoveries: usize,
}

/// The caller-visible result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
  pub run_id: RunId,
  pub pipeline_id: String,
  pub state: RunState,
  pub outputs: Vec<RunOutput>,
  pub steps: Vec<StepSummary>,
  /// Earliest-started component that failed.
  pub first_failure: Option<String>,
  pub failure_kind: Option<OutcomeKind>,
  pub return_code: Option<i32>,
  pub stderr_tail: Option<String>,
  pub message: Option<String>,
}

impl RunSummary {
  /// Summary of a run that never started.
  fn unstarted(run_id: RunId, pipeline_id: String, state: RunState, message: String) -> Self {
    Self {
      run_id,
      pipeline_id,
      state,
      outputs: Vec::new(),
      steps: Vec::new(),
      first_failure: None,
      failure_kind: None,
      return_code: None,
      stderr_tail: None,
      message: Some(message),
    }
  }

  pub fn is_success(&self) -> bool {
    self.state == RunState::Successful
  }
}

enum Request {
  Submit {
    run_id: RunId,
    request: Box<RunRequest>,
    done: oneshot::Sender<RunSummary>,
  },
  Cancel {
    run_id: RunId,
  },
}

/// Cloneable handle for talking to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
  sender: mpsc::UnboundedSender<Request>,
}

impl ManagerHandle {
  /// Queue a run. The pipeline and input arity are checked here; everything
  /// else is reported through the ticket.
  pub fn submit_run(&self, request: RunRequest) -> Result<RunTicket, FleetError> {
    request.pipeline.validate()?;
    if request.inputs.len() != request.pipeline.inputs.len() {
      return Err(FleetError::InvalidRequest {
        message: format!(
          "pipeline '{}' takes {} inputs, {} given",
          request.pipeline.pipeline_id,
          request.pipeline.inputs.len(),
          request.inputs.len()
        ),
      });
    }

    let run_id = RunId::new();
    let (done, receiver) = oneshot::channel();
    self
      .sender
      .send(Request::Submit {
        run_id,
        request: Box::new(request),
        done,
      })
      .map_err(|_| FleetError::ManagerStopped { run_id })?;
    Ok(RunTicket { run_id, receiver })
  }

  /// Ask the manager to cancel a run. Cancellation is cooperative: running
  /// tasks are told to stop and the run settles as Cancelled.
  pub fn cancel_run(&self, run_id: RunId) -> Result<(), FleetError> {
    self
      .sender
      .send(Request::Cancel { run_id })
      .map_err(|_| FleetError::ManagerStopped { run_id })
  }
}

/// Awaitable result of a submitted run.
pub struct RunTicket {
  run_id: RunId,
  receiver: oneshot::Receiver<RunSummary>,
}

impl RunTicket {
  pub fn run_id(&self) -> RunId {
    self.run_id
  }

  pub async fn wait(self) -> Result<RunSummary, FleetError> {
    self
      .receiver
      .await
      .map_err(|_| FleetError::ManagerStopped {
        run_id: self.run_id,
      })
  }
}

/// The fleet manager.
///
/// Generic over `N: EventNotifier` so callers can observe progress. Use
/// `Manager::new()` for no-op notifications or `Manager::with_notifier()`.
///
/// # Usage
///
/// ```ignore
/// let manager = Manager::new(config.fleet, backends, ResultCache::new(), DatasetRegistry::new());
/// let handle = manager.handle();
///
/// let cancel = CancellationToken::new();
/// tokio::spawn(manager.start(cancel.clone()));
///
/// let ticket = handle.submit_run(RunRequest::new(pipeline, inputs))?;
/// let summary = ticket.wait().await?;
/// ```
pub struct Manager<N: EventNotifier = NoopNotifier> {
  config: FleetConfig,
  backends: Backends,
  cache: ResultCache,
  datasets: DatasetRegistry,
  book: RunBook,
  notifier: N,
  sender: mpsc::UnboundedSender<Request>,
  receiver: mpsc::UnboundedReceiver<Request>,
}

impl Manager<NoopNotifier> {
  pub fn new(
    config: FleetConfig,
    backends: Backends,
    cache: ResultCache,
    datasets: DatasetRegistry,
  ) -> Self {
    Self::with_notifier(config, backends, cache, datasets, NoopNotifier)
  }
}

impl<N: EventNotifier> Manager<N> {
  pub fn with_notifier(
    config: FleetConfig,
    backends: Backends,
    cache: ResultCache,
    datasets: DatasetRegistry,
    notifier: N,
  ) -> Self {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      config,
      backends,
      cache,
      datasets,
      book: RunBook::new(),
      notifier,
      sender,
      receiver,
    }
  }

  pub fn handle(&self) -> ManagerHandle {
    ManagerHandle {
      sender: self.sender.clone(),
    }
  }

  /// Live run trees, for inspection while the manager runs.
  pub fn book(&self) -> RunBook {
    self.book.clone()
  }

  /// Run the control loop.
  ///
  /// Returns when `cancel` fires, or once every handle is dropped and no
  /// run remains. A backend that fails its startup check (an unreachable
  /// batch scheduler) aborts before any worker starts.
  #[instrument(name = "fleet_manager", skip_all, fields(workers = self.config.worker_count))]
  pub async fn start(self, cancel: CancellationToken) -> Result<(), FleetError> {
    let Manager {
      mut config,
      backends,
      cache,
      datasets,
      book,
      notifier,
      sender,
      mut receiver,
    } = self;
    drop(sender);
    backends.check().await?;

    if let Ok(root) = std::path::absolute(&config.sandbox_root) {
      config.sandbox_root = root;
    }
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut control = Control::new(config, backends, cache, datasets, book, notifier);
    info!(
      poll_interval_ms = control.config.poll_interval_ms,
      sandbox_root = %control.config.sandbox_root.display(),
      "fleet_manager_started"
    );

    let mut closed = false;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("fleet_manager_cancelled");
          break;
        }
        request = receiver.recv(), if !closed => match request {
          Some(request) => control.accept(request),
          None => closed = true,
        },
        _ = interval.tick() => {
          control.poll();
          if closed && control.is_idle() {
            break;
          }
        }
      }
    }

    control.shutdown();
    info!("fleet_manager_stopped");
    Ok(())
  }
}

struct Queued {
  run_id: RunId,
  request: Box<RunRequest>,
  done: oneshot::Sender<RunSummary>,
}

enum Purpose {
  /// First execution; completes the record.
  Execute { record: RecordId },
  /// Regenerate purged outputs of an already successful component.
  Recover { outputs: Vec<DatasetId> },
}

struct InFlight {
  dispatch_id: u64,
  run_id: RunId,
  node: NodeId,
  task_id: String,
  purpose: Purpose,
  log: ExecLog,
  cancel: CancellationToken,
  dispatched_at: Instant,
  sandbox: PathBuf,
  /// Sandboxes holding this task's input files.
  input_sandboxes: Vec<PathBuf>,
}

struct Slot {
  status: SlotStatus,
  sender: mpsc::Sender<Dispatch>,
  handle: JoinHandle<()>,
  current: Option<InFlight>,
}

/// What happened to one ready component.
enum Progress {
  Settled,
  Dispatched,
  /// Waiting for a slot or for an input to be regenerated.
  Blocked,
}

/// State owned by the control loop.
struct Control<N: EventNotifier> {
  config: FleetConfig,
  backends: Backends,
  cache: ResultCache,
  datasets: DatasetRegistry,
  book: RunBook,
  notifier: N,
  janitor: SandboxJanitor,
  slots: Vec<Slot>,
  reports_tx: mpsc::UnboundedSender<WorkerMessage>,
  reports: mpsc::UnboundedReceiver<WorkerMessage>,
  queue: VecDeque<Queued>,
  runs: HashMap<RunId, RunContext>,
  /// Runs in acceptance order.
  order: Vec<RunId>,
  /// Record that produced each dataset, for `derived_from` chains.
  origins: HashMap<DatasetId, RecordId>,
  recovering: HashSet<(RunId, NodeId)>,
  next_dispatch: u64,
  ticks: u64,
}

impl<N: EventNotifier> Control<N> {
  fn new(
    config: FleetConfig,
    backends: Backends,
    cache: ResultCache,
    datasets: DatasetRegistry,
    book: RunBook,
    notifier: N,
  ) -> Self {
    let (reports_tx, reports) = mpsc::unbounded_channel();
    let slots = (0..config.worker_count.max(1))
      .map(|slot| {
        let (sender, handle) = Worker::spawn(slot, backends.clone(), reports_tx.clone());
        Slot {
          status: SlotStatus::Free,
          sender,
          handle,
          current: None,
        }
      })
      .collect();

    Self {
      janitor: SandboxJanitor::new(&config, datasets.clone()),
      config,
      backends,
      cache,
      datasets,
      book,
      notifier,
      slots,
      reports_tx,
      reports,
      queue: VecDeque::new(),
      runs: HashMap::new(),
      order: Vec::new(),
      origins: HashMap::new(),
      recovering: HashSet::new(),
      next_dispatch: 1,
      ticks: 0,
    }
  }

  fn is_idle(&self) -> bool {
    self.queue.is_empty() && self.runs.is_empty()
  }

  fn accept(&mut self, request: Request) {
    match request {
      Request::Submit {
        run_id,
        request,
        done,
      } => {
        debug!(run_id = %run_id, pipeline_id = %request.pipeline.pipeline_id, "run_queued");
        self.queue.push_back(Queued {
          run_id,
          request,
          done,
        });
      }
      Request::Cancel { run_id } => self.cancel_run(run_id),
    }
  }

  fn poll(&mut self) {
    self.ticks += 1;
    self.ingest();
    let waiting = self.dispatch_ready();
    self.drain_reports();
    self.enforce_deadlines();
    self.settle_runs();

    let idle_every = u64::from(self.config.idle_factor.max(1));
    if self.ticks % idle_every == 0 && !waiting && self.queue.is_empty() {
      // Batch jobs link their inputs only once they start on a node, so the
      // producers' sandboxes stay until the consumer reports.
      let active: HashSet<PathBuf> = self
        .slots
        .iter()
        .filter_map(|s| s.current.as_ref())
        .flat_map(|f| std::iter::once(f.sandbox.clone()).chain(f.input_sandboxes.iter().cloned()))
        .collect();
      self.janitor.sweep(&active);
    }
  }

  // (a) intake

  fn ingest(&mut self) {
    while let Some(queued) = self.queue.pop_front() {
      self.start_run(queued);
    }
  }

  fn start_run(&mut self, queued: Queued) {
    let Queued {
      run_id,
      request,
      done,
    } = queued;
    let RunRequest {
      pipeline,
      inputs,
      priority,
      owner_uid,
      owner_gid,
    } = *request;
    let pipeline_id = pipeline.pipeline_id.clone();

    let registered: Result<Vec<DatasetId>, _> = inputs
      .iter()
      .map(|path| self.datasets.register_file(path).map(|d| d.id))
      .collect();
    let inputs = match registered {
      Ok(inputs) => inputs,
      Err(e) => {
        warn!(run_id = %run_id, error = %e, "run_inputs_unreadable");
        let _ = done.send(RunSummary::unstarted(
          run_id,
          pipeline_id,
          RunState::Failed,
          e.to_string(),
        ));
        return;
      }
    };

    let tree = RunTree::new(run_id, &pipeline);
    let resources = Resources {
      owner_uid,
      owner_gid,
      priority,
      ..Resources::default()
    };
    let mut context = match RunContext::new(&tree, pipeline, inputs, resources) {
      Ok(context) => context,
      Err(e) => {
        error!(run_id = %run_id, error = %e, "run_expansion_failed");
        let _ = done.send(RunSummary::unstarted(
          run_id,
          pipeline_id,
          RunState::Failed,
          e.to_string(),
        ));
        return;
      }
    };
    context.waiter = Some(done);

    let components = tree.nodes().len();
    self.book.insert(tree);
    if let Err(e) = self.book.transact(run_id, |t| t.start(t.root())) {
      error!(run_id = %run_id, error = %e, "run_start_failed");
    }
    self.runs.insert(run_id, context);
    self.order.push(run_id);

    info!(run_id = %run_id, pipeline_id = %pipeline_id, nodes = components, "run_started");
    self.notifier.notify(FleetEvent::RunStarted {
      run_id,
      pipeline_id,
    });
  }

  fn cancel_run(&mut self, run_id: RunId) {
    if let Some(pos) = self.queue.iter().position(|q| q.run_id == run_id) {
      if let Some(queued) = self.queue.remove(pos) {
        info!(run_id = %run_id, "queued_run_cancelled");
        let _ = queued.done.send(RunSummary::unstarted(
          run_id,
          queued.request.pipeline.pipeline_id.clone(),
          RunState::Cancelled,
          "cancelled before it started".to_string(),
        ));
      }
      return;
    }
    if !self.runs.contains_key(&run_id) {
      warn!(run_id = %run_id, "cancel_unknown_run");
      return;
    }

    match self.book.transact(run_id, |t| {
      let root = t.root();
      wind_down(t, root)
    }) {
      Ok(cancelled) => info!(run_id = %run_id, nodes = cancelled.len(), "run_cancelled"),
      Err(e) => warn!(run_id = %run_id, error = %e, "run_cancel_rejected"),
    }
    self.signal_cancellations(run_id);
  }

  // (b) dispatch

  /// Move every ready component forward. Returns whether anything is left
  /// waiting for a slot or an input.
  fn dispatch_ready(&mut self) -> bool {
    let mut waiting = false;
    for run_id in self.order.clone() {
      let mut skip: HashSet<NodeId> = HashSet::new();
      loop {
        let Ok(tree) = self.book.snapshot(run_id) else {
          break;
        };
        let Some(node) = tree
          .ready_components()
          .into_iter()
          .find(|n| !skip.contains(n))
        else {
          break;
        };

        match self.advance(run_id, &tree, node) {
          Ok(Progress::Settled) | Ok(Progress::Dispatched) => {}
          Ok(Progress::Blocked) => {
            waiting = true;
            skip.insert(node);
          }
          Err(e) => {
            error!(run_id = %run_id, node = %node, error = %e, "component_error");
            skip.insert(node);
            let outcome = TaskOutcome::without_return_code(
              task_id(run_id, node),
              OutcomeKind::Failed,
              Utc::now(),
              e.to_string(),
            );
            self.fail_component(run_id, node, None, outcome);
          }
        }
      }
    }
    waiting
  }

  fn advance(&mut self, run_id: RunId, tree: &RunTree, node: NodeId) -> Result<Progress, FleetError> {
    let context = self
      .runs
      .get(&run_id)
      .ok_or(TransitionError::UnknownRun { run_id })?;
    match context.plan(tree, node)? {
      Plan::Cable { dataset, delivered } => {
        if delivered && !self.datasets.get(dataset)?.is_retained() {
          self.request_recovery(run_id, tree, dataset)?;
          return Ok(Progress::Blocked);
        }
        self.book.transact(run_id, |t| {
          t.start(node)?;
          let mut log = ExecLog::start();
          log.finish(Some(0));
          t.attach_log(node, log)?;
          t.stop(node)
        })?;
        if let Some(context) = self.runs.get_mut(&run_id) {
          context.set_values(node, vec![dataset]);
        }
        Ok(Progress::Settled)
      }
      Plan::SubRun { sub, inputs } => {
        self.book.transact(run_id, |t| {
          t.start(node)?;
          t.start(sub)
        })?;
        if let Some(context) = self.runs.get_mut(&run_id) {
          context.set_values(sub, inputs);
        }
        debug!(run_id = %run_id, node = %node, sub_run = %sub, "sub_run_started");
        Ok(Progress::Settled)
      }
      Plan::Method { method, inputs } => self.run_method(run_id, tree, node, &method, &inputs),
    }
  }

  fn run_method(
    &mut self,
    run_id: RunId,
    tree: &RunTree,
    node: NodeId,
    method: &Method,
    inputs: &[DatasetId],
  ) -> Result<Progress, FleetError> {
    let datasets: Vec<Dataset> = inputs
      .iter()
      .map(|id| self.datasets.get(*id))
      .collect::<Result<_, _>>()?;
    let hashes: Vec<ContentHash> = datasets.iter().map(|d| d.hash.clone()).collect();
    let name = qualified_name(tree, node);

    match self.cache.decide(method, &hashes, &self.datasets) {
      ReuseDecision::Reuse(record) | ReuseDecision::Recover(record) => {
        self.book.transact(run_id, |t| {
          t.start(node)?;
          t.attach_reuse(node, record.id)?;
          t.stop(node)
        })?;
        if let Some(context) = self.runs.get_mut(&run_id) {
          context.record_producer(node, &record.outputs);
          context.set_values(node, record.outputs.clone());
        }
        info!(
          run_id = %run_id,
          component = %name,
          record = %record.id,
          retained = self.datasets.all_retained(&record.outputs),
          "component_reused"
        );
        self.notifier.notify(FleetEvent::ComponentReused {
          run_id,
          node,
          name,
          record: record.id,
        });
        Ok(Progress::Settled)
      }
      ReuseDecision::Miss => {
        if let Some(missing) = datasets.iter().find(|d| !d.is_retained()) {
          self.request_recovery(run_id, tree, missing.id)?;
          return Ok(Progress::Blocked);
        }
        let Some(slot) = self.free_slot() else {
          return Ok(Progress::Blocked);
        };

        let descriptor = self.describe(run_id, node, method, &datasets)?;
        self.book.transact(run_id, |t| t.start(node))?;
        let mut derived_from: Vec<RecordId> = inputs
          .iter()
          .filter_map(|id| self.origins.get(id))
          .copied()
          .collect();
        derived_from.sort();
        derived_from.dedup();
        let record = self.cache.insert(method.id.clone(), hashes, derived_from);

        self.send(slot, run_id, node, descriptor, Purpose::Execute { record: record.id });
        Ok(Progress::Dispatched)
      }
    }
  }

  /// Start regenerating the bytes of `dataset`, first recovering whatever
  /// its producer itself is missing.
  fn request_recovery(
    &mut self,
    run_id: RunId,
    tree: &RunTree,
    dataset: DatasetId,
  ) -> Result<(), FleetError> {
    let context = self
      .runs
      .get(&run_id)
      .ok_or(TransitionError::UnknownRun { run_id })?;
    let wiring = |node: NodeId, message: &str| FleetError::Wiring {
      run_id,
      node,
      message: message.to_string(),
    };

    let producer = context
      .producer(dataset)
      .ok_or_else(|| wiring(tree.root(), "purged dataset has no producer in this run"))?;
    if self.recovering.contains(&(run_id, producer)) {
      return Ok(());
    }
    let method = context
      .step_def(tree, producer)?
      .transformation
      .as_method()
      .cloned()
      .ok_or_else(|| wiring(producer, "producer is not a method step"))?;
    let outputs = context
      .values(producer)
      .map(<[DatasetId]>::to_vec)
      .ok_or_else(|| wiring(producer, "producer has no outputs"))?;
    let inputs: Vec<Dataset> = context
      .step_inputs(tree, producer)?
      .into_iter()
      .map(|id| self.datasets.get(id))
      .collect::<Result<_, _>>()?;

    if let Some(missing) = inputs.iter().find(|d| !d.is_retained()) {
      return self.request_recovery(run_id, tree, missing.id);
    }
    let Some(slot) = self.free_slot() else {
      return Ok(());
    };

    let descriptor = self.describe(run_id, producer, &method, &inputs)?;
    self
      .book
      .transact(run_id, |t| t.begin_recovery(producer, true))?;
    self.recovering.insert((run_id, producer));
    info!(run_id = %run_id, node = %producer, dataset = %dataset, "component_recovering");
    self.notifier.notify(FleetEvent::ComponentRecovering {
      run_id,
      node: producer,
    });
    self.send(slot, run_id, producer, descriptor, Purpose::Recover { outputs });
    Ok(())
  }

  fn free_slot(&self) -> Option<usize> {
    self.slots.iter().position(|s| s.status == SlotStatus::Free)
  }

  fn describe(
    &self,
    run_id: RunId,
    node: NodeId,
    method: &Method,
    inputs: &[Dataset],
  ) -> Result<TaskDescriptor, FleetError> {
    let context = self
      .runs
      .get(&run_id)
      .ok_or(TransitionError::UnknownRun { run_id })?;
    let task_inputs = method
      .inputs
      .iter()
      .zip(inputs)
      .map(|(name, dataset)| {
        let source = dataset.path.clone().ok_or_else(|| FleetError::Wiring {
          run_id,
          node,
          message: format!("input '{}' has no bytes", name),
        })?;
        Ok(TaskInput {
          name: name.clone(),
          source,
          expected_hash: Some(dataset.hash.clone()),
        })
      })
      .collect::<Result<Vec<_>, FleetError>>()?;

    let dispatch_id = self.next_dispatch;
    let container = ContainerTask {
      task_id: task_id(run_id, node),
      image: method.image.path.clone(),
      app: method.image.app.clone(),
      driver: method.driver.clone(),
      args: Vec::new(),
      inputs: task_inputs,
      outputs: method.outputs.clone(),
      steps: method.image.steps.clone(),
    };
    let resources = Resources {
      cpu_count: method.threads,
      memory_mb: method.memory_mb,
      ..context.resources
    };
    let sandbox = self
      .config
      .sandbox_root
      .join(format!("{}-{}-d{}", run_id, node, dispatch_id));

    TaskDescriptor::new(
      format!("{}/{}", run_id, node),
      container,
      sandbox,
      resources,
      self.backends.preferred_target(),
    )
  }

  fn send(
    &mut self,
    slot: usize,
    run_id: RunId,
    node: NodeId,
    descriptor: TaskDescriptor,
    purpose: Purpose,
  ) {
    let dispatch_id = self.next_dispatch;
    self.next_dispatch += 1;
    let cancel = CancellationToken::new();
    let in_flight = InFlight {
      dispatch_id,
      run_id,
      node,
      task_id: descriptor.container.task_id.clone(),
      purpose,
      log: ExecLog::start(),
      cancel: cancel.clone(),
      dispatched_at: Instant::now(),
      sandbox: descriptor.sandbox.clone(),
      input_sandboxes: descriptor
        .container
        .inputs
        .iter()
        .filter_map(|input| self.janitor.sandbox_of(&input.source))
        .collect(),
    };
    let dispatch = Dispatch {
      dispatch_id,
      descriptor,
      cancel,
    };

    if self.slots[slot].sender.try_send(dispatch).is_err() {
      warn!(slot, "worker_unavailable");
      self.replace_worker(slot);
      self.complete(
        in_flight,
        TaskOutcome::without_return_code(
          task_id(run_id, node),
          OutcomeKind::WorkerFailure,
          Utc::now(),
          format!("worker slot {} did not accept the task", slot),
        ),
      );
      return;
    }

    let entry = &mut self.slots[slot];
    entry.status = SlotStatus::Staged;
    entry.current = Some(in_flight);

    let name = self
      .book
      .snapshot(run_id)
      .map(|t| qualified_name(&t, node))
      .unwrap_or_default();
    info!(run_id = %run_id, component = %name, slot, dispatch_id, "component_dispatched");
    self.notifier.notify(FleetEvent::ComponentDispatched {
      run_id,
      node,
      name,
      slot,
    });
  }

  fn replace_worker(&mut self, slot: usize) {
    let (sender, handle) = Worker::spawn(slot, self.backends.clone(), self.reports_tx.clone());
    let entry = &mut self.slots[slot];
    entry.handle.abort();
    entry.sender = sender;
    entry.handle = handle;
    entry.status = SlotStatus::Free;
    entry.current = None;
  }

  // (c) reaping

  fn drain_reports(&mut self) {
    while let Ok(message) = self.reports.try_recv() {
      match message {
        WorkerMessage::Started { slot, dispatch_id } => {
          if let Some(entry) = self.slots.get_mut(slot)
            && entry.current.as_ref().is_some_and(|f| f.dispatch_id == dispatch_id)
          {
            entry.status = SlotStatus::Working;
          }
        }
        WorkerMessage::Finished {
          slot,
          dispatch_id,
          outcome,
        } => {
          let Some(entry) = self.slots.get_mut(slot) else {
            continue;
          };
          if !entry.current.as_ref().is_some_and(|f| f.dispatch_id == dispatch_id) {
            debug!(slot, dispatch_id, "stale_worker_report");
            continue;
          }
          entry.status = SlotStatus::Done;
          let in_flight = entry.current.take();
          if let Some(in_flight) = in_flight {
            self.complete(in_flight, outcome);
          }
          self.slots[slot].status = SlotStatus::Free;
        }
      }
    }
  }

  /// Reclaim slots whose worker has not reported within the dispatch
  /// deadline. The worker is replaced and the component fails.
  fn enforce_deadlines(&mut self) {
    let deadline = self.config.dispatch_deadline();
    for slot in 0..self.slots.len() {
      let expired = self.slots[slot]
        .current
        .as_ref()
        .is_some_and(|f| f.dispatched_at.elapsed() >= deadline);
      if !expired {
        continue;
      }
      let Some(in_flight) = self.slots[slot].current.take() else {
        continue;
      };
      warn!(
        slot,
        run_id = %in_flight.run_id,
        node = %in_flight.node,
        deadline_secs = deadline.as_secs(),
        "dispatch_deadline_exceeded"
      );
      in_flight.cancel.cancel();
      self.replace_worker(slot);
      let outcome = TaskOutcome::without_return_code(
        in_flight.task_id.clone(),
        OutcomeKind::WorkerFailure,
        in_flight.log.started_at,
        format!("no report from worker {} within {:?}", slot, deadline),
      );
      self.complete(in_flight, outcome);
    }
  }

  fn complete(&mut self, in_flight: InFlight, outcome: TaskOutcome) {
    let InFlight {
      run_id,
      node,
      purpose,
      mut log,
      ..
    } = in_flight;
    log.finish(outcome.return_code);
    log.stdout = outcome.stdout.clone();
    log.stderr = outcome.stderr.clone();

    let result = match purpose {
      Purpose::Execute { record } => self.finish_execution(run_id, node, record, log, outcome),
      Purpose::Recover { outputs } => self.finish_recovery(run_id, node, outputs, log, outcome),
    };
    if let Err(e) = result {
      error!(run_id = %run_id, node = %node, error = %e, "completion_failed");
    }
  }

  fn finish_execution(
    &mut self,
    run_id: RunId,
    node: NodeId,
    record: RecordId,
    log: ExecLog,
    outcome: TaskOutcome,
  ) -> Result<(), FleetError> {
    if !outcome.kind.is_success() {
      self.cache.fail(record, Some(log.log_id))?;
      self.fail_component(run_id, node, Some(log), outcome);
      return Ok(());
    }

    let outputs: Vec<DatasetId> = outcome
      .outputs
      .iter()
      .map(|out| {
        self
          .datasets
          .register(out.hash.clone(), out.size, Some(out.path.clone()))
          .id
      })
      .collect();
    self.cache.complete(record, outputs.clone(), log.log_id)?;
    for id in &outputs {
      self.origins.insert(*id, record);
    }
    if let Some(context) = self.runs.get_mut(&run_id) {
      context.record_producer(node, &outputs);
      context.set_values(node, outputs);
    }

    let state = self.book.transact(run_id, |t| {
      t.attach_log(node, log)?;
      t.stop(node)
    })?;
    info!(run_id = %run_id, node = %node, record = %record, state = %state, "component_succeeded");
    self
      .notifier
      .notify(FleetEvent::ComponentSucceeded { run_id, node });
    Ok(())
  }

  fn finish_recovery(
    &mut self,
    run_id: RunId,
    node: NodeId,
    outputs: Vec<DatasetId>,
    log: ExecLog,
    mut outcome: TaskOutcome,
  ) -> Result<(), FleetError> {
    self.recovering.remove(&(run_id, node));

    if outcome.kind.is_success() {
      match self.verify_regenerated(&outputs, &outcome) {
        Ok(()) => {
          for (id, out) in outputs.iter().zip(&outcome.outputs) {
            self.datasets.restore(*id, out.path.clone())?;
          }
          self.book.transact(run_id, |t| {
            t.record_recovery_log(node, log)?;
            t.finish_recovery(node, true)
          })?;
          info!(run_id = %run_id, node = %node, restored = outputs.len(), "component_recovered");
          self
            .notifier
            .notify(FleetEvent::ComponentSucceeded { run_id, node });
          return Ok(());
        }
        Err(message) => {
          if let Some(record) = outputs.first().and_then(|id| self.origins.get(id)).copied() {
            let redacted = self.cache.redact(record)?;
            warn!(record = %record, redacted = redacted.len(), "irreproducible_record_redacted");
          }
          outcome.kind = OutcomeKind::IntegrityFailure;
          outcome.message = Some(message);
        }
      }
    }

    let kind = outcome.kind;
    let state = self.book.transact(run_id, |t| {
      t.record_recovery_log(node, log)?;
      match (kind, t.state(node)?) {
        (OutcomeKind::Cancelled, RunState::Running) => t.cancel(node)?,
        (_, RunState::Running) => t.mark_failure(node, true)?,
        _ => {}
      }
      t.finish_recovery(node, true)?;
      t.state(node)
    })?;
    self.note_failure(run_id, node, state, outcome);
    Ok(())
  }

  /// Regenerated outputs must hash to what was recorded.
  fn verify_regenerated(&self, outputs: &[DatasetId], outcome: &TaskOutcome) -> Result<(), String> {
    if outputs.len() != outcome.outputs.len() {
      return Err(format!(
        "recovery produced {} outputs, {} recorded",
        outcome.outputs.len(),
        outputs.len()
      ));
    }
    for (id, out) in outputs.iter().zip(&outcome.outputs) {
      let recorded = self.datasets.get(*id).map_err(|e| e.to_string())?;
      if recorded.hash != out.hash {
        return Err(format!(
          "regenerated output '{}' hashes to {}, recorded {}",
          out.name, out.hash, recorded.hash
        ));
      }
    }
    Ok(())
  }

  /// Settle a component that did not succeed. Failure propagates up through
  /// enclosing runs; a cancelled task on a running component cancels the
  /// whole run.
  fn fail_component(
    &mut self,
    run_id: RunId,
    node: NodeId,
    log: Option<ExecLog>,
    outcome: TaskOutcome,
  ) {
    let kind = outcome.kind;
    let result = self.book.transact(run_id, |t| {
      if let Some(log) = log {
        t.attach_log(node, log)?;
      }
      if t.state(node)? == RunState::Pending {
        t.start(node)?;
      }
      match (kind, t.state(node)?) {
        (OutcomeKind::Cancelled, RunState::Running) => {
          let root = t.root();
          wind_down(t, root)?;
        }
        (_, RunState::Running) => t.mark_failure(node, true)?,
        _ => {}
      }
      if t.state(node)?.is_active() {
        t.stop(node)?;
      }
      t.state(node)
    });

    match result {
      Ok(state) => self.note_failure(run_id, node, state, outcome),
      Err(e) => error!(run_id = %run_id, node = %node, error = %e, "component_fail_rejected"),
    }
    self.signal_cancellations(run_id);
  }

  fn note_failure(&mut self, run_id: RunId, node: NodeId, state: RunState, outcome: TaskOutcome) {
    warn!(
      run_id = %run_id,
      node = %node,
      kind = %outcome.kind,
      return_code = ?outcome.return_code,
      state = %state,
      message = ?outcome.message,
      "component_failed"
    );
    self.notifier.notify(FleetEvent::ComponentFailed {
      run_id,
      node,
      kind: outcome.kind,
      message: outcome.message.clone(),
    });
    if let Some(context) = self.runs.get_mut(&run_id) {
      context.failures.insert(node, outcome);
    }
  }

  /// Tell in-flight tasks of `run_id` whose components are Cancelling to stop.
  fn signal_cancellations(&self, run_id: RunId) {
    let Ok(tree) = self.book.snapshot(run_id) else {
      return;
    };
    for in_flight in self.slots.iter().filter_map(|s| s.current.as_ref()) {
      if in_flight.run_id == run_id
        && tree.state(in_flight.node).ok() == Some(RunState::Cancelling)
        && !in_flight.cancel.is_cancelled()
      {
        debug!(run_id = %run_id, node = %in_flight.node, "in_flight_cancel_signalled");
        in_flight.cancel.cancel();
      }
    }
  }

  // winding down

  fn settle_runs(&mut self) {
    for run_id in self.order.clone() {
      let in_flight: HashSet<NodeId> = self
        .slots
        .iter()
        .filter_map(|s| s.current.as_ref())
        .filter(|f| f.run_id == run_id)
        .map(|f| f.node)
        .collect();

      let settled = match self.book.transact(run_id, |t| settle(t, &in_flight)) {
        Ok(settled) => settled,
        Err(e) => {
          error!(run_id = %run_id, error = %e, "run_settle_failed");
          continue;
        }
      };
      self.signal_cancellations(run_id);

      let Ok(tree) = self.book.snapshot(run_id) else {
        continue;
      };
      if let Some(context) = self.runs.get_mut(&run_id) {
        for (step, sub) in settled {
          match context.run_outputs(&tree, sub) {
            Ok(outputs) => context.set_values(step, outputs),
            Err(e) => error!(run_id = %run_id, node = %step, error = %e, "sub_run_outputs_missing"),
          }
        }
      }
      if tree.state(tree.root()).is_ok_and(RunState::is_terminal) {
        self.finish_run(run_id);
      }
    }
  }

  fn finish_run(&mut self, run_id: RunId) {
    self.order.retain(|id| *id != run_id);
    let Some(tree) = self.book.remove(run_id) else {
      return;
    };
    let Some(mut context) = self.runs.remove(&run_id) else {
      return;
    };
    self.recovering.retain(|(id, _)| *id != run_id);

    let summary = summarize(&tree, &context, &self.datasets);
    info!(
      run_id = %run_id,
      state = %summary.state,
      first_failure = ?summary.first_failure,
      "run_finished"
    );
    self.notifier.notify(FleetEvent::RunFinished {
      run_id,
      state: summary.state,
    });
    if let Some(waiter) = context.waiter.take() {
      let _ = waiter.send(summary);
    }
  }

  fn shutdown(&mut self) {
    for slot in &mut self.slots {
      if let Some(in_flight) = slot.current.take() {
        in_flight.cancel.cancel();
      }
      slot.handle.abort();
    }
    if !self.runs.is_empty() {
      warn!(runs = self.runs.len(), "fleet_manager_stopped_with_active_runs");
    }
  }
}

fn task_id(run_id: RunId, node: NodeId) -> String {
  format!("{}-{}", run_id, node)
}

/// Cancel `run` and its active descendants. A run that is already failing
/// keeps its state while its remaining components are cancelled.
fn wind_down(tree: &mut RunTree, run: NodeId) -> Result<Vec<NodeId>, TransitionError> {
  match tree.state(run)? {
    RunState::Pending | RunState::Running | RunState::Cancelling => tree.cancel_tree(run),
    RunState::Failing => tree.cancel_descendants(run),
    _ => Ok(Vec::new()),
  }
}

/// Wind down finished work bottom-up. Returns `(step, sub-run)` for every
/// pipeline step that just succeeded through its sub-run.
fn settle(
  tree: &mut RunTree,
  in_flight: &HashSet<NodeId>,
) -> Result<Vec<(NodeId, NodeId)>, TransitionError> {
  let mut settled = Vec::new();
  // Sub-runs sit after their owners in the arena, so reverse order visits
  // inner runs first.
  let runs: Vec<NodeId> = tree
    .nodes()
    .iter()
    .rev()
    .filter(|n| n.is_run())
    .map(|n| n.id)
    .collect();

  for run in runs {
    let state = tree.state(run)?;
    if state == RunState::Pending || state.is_terminal() {
      continue;
    }
    if matches!(state, RunState::Failing | RunState::Cancelling) {
      tree.cancel_descendants(run)?;
    }

    for child in tree.get(run)?.children.clone() {
      let child_state = tree.state(child)?;
      if child_state == RunState::Pending || child_state.is_terminal() || in_flight.contains(&child) {
        continue;
      }

      if let Some(sub) = tree.sub_run(child) {
        let sub_state = tree.state(sub)?;
        if sub_state.is_active() {
          continue;
        }
        match (child_state, sub_state) {
          (RunState::Running, RunState::Successful) => {
            // A recovering step has its log already.
            if tree.get(child)?.log.is_none() {
              let mut log = ExecLog::start();
              log.finish(Some(0));
              tree.attach_log(child, log)?;
            }
            tree.stop(child)?;
            settled.push((child, sub));
          }
          (RunState::Running, RunState::Cancelled) => {
            tree.cancel(child)?;
            tree.stop(child)?;
          }
          (RunState::Running, _) => {
            tree.mark_failure(child, true)?;
            tree.stop(child)?;
          }
          _ => {
            tree.stop(child)?;
          }
        }
        continue;
      }

      if child_state == RunState::Cancelling {
        tree.stop(child)?;
      }
    }

    let busy = tree
      .get(run)?
      .children
      .iter()
      .any(|c| tree.state(*c).is_ok_and(RunState::is_active));
    if !busy {
      tree.stop(run)?;
    }
  }
  Ok(settled)
}

fn summarize(tree: &RunTree, context: &RunContext, datasets: &DatasetRegistry) -> RunSummary {
  let root = tree.root();
  let state = tree.state(root).unwrap_or_default();

  let outputs: Vec<RunOutput> = context
    .pipeline_of(root)
    .map(|p| {
      p.outputs
        .iter()
        .enumerate()
        .filter_map(|(i, cable)| {
          let node = tree.component(root, ComponentKey::OutputCable { output: i })?;
          let id = *context.values(node)?.first()?;
          let dataset = datasets.get(id).ok()?;
          Some(RunOutput {
            name: cable.name.clone(),
            dataset: id,
            hash: dataset.hash,
            path: dataset.path,
          })
        })
        .collect()
    })
    .unwrap_or_default();

  let steps: Vec<StepSummary> = tree
    .nodes()
    .iter()
    .filter(|n| matches!(n.component_key(), Some(ComponentKey::Step { .. })))
    .filter(|n| tree.sub_run(n.id).is_none())
    .map(|n| StepSummary {
      name: qualified_name(tree, n.id),
      state: n.state,
      reused: n.reused,
      log_id: n.log.as_ref().map(|l| l.log_id),
      return_code: n.log.as_ref().and_then(|l| l.return_code),
      recoveries: n.recovery_logs.len(),
    })
    .collect();

  let failed = tree.first_failure(root);
  let outcome = failed.and_then(|n| context.failures.get(&n));
  RunSummary {
    run_id: tree.run_id(),
    pipeline_id: context.pipeline_id.clone(),
    state,
    outputs,
    steps,
    first_failure: failed.map(|n| qualified_name(tree, n)),
    failure_kind: outcome.map(|o| o.kind),
    return_code: outcome.and_then(|o| o.return_code),
    stderr_tail: outcome.and_then(|o| o.stderr_tail(STDERR_TAIL_LINES)),
    message: outcome.and_then(|o| o.message.clone()),
  }
}
