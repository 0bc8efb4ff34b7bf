//! In-process batch scheduler.
//!
//! Jobs run as child processes of the current process. Dependencies,
//! priorities, cancellation cascades and accounting behave like a cluster
//! scheduler, so a single host can run cluster-targeted tasks unchanged.
//!
//! ```text
//! submit ──► Pending ──(dependencies stopped)──► ResourceWait ──(slot)──► Running
//!                                                    │
//!                                  highest priority first, then submit order
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::SchedulerError;
use crate::scheduler::BatchScheduler;
use crate::types::{AccountingRecord, Dependents, JobHandle, JobState, SubmitRequest};

struct LocalJob {
  state: watch::Receiver<JobState>,
  cancel: CancellationToken,
  record: Arc<Mutex<AccountingRecord>>,
}

/// A job waiting for a slot.
struct Waiter {
  job: JobHandle,
  priority: u32,
  seq: u64,
  wake: oneshot::Sender<Permit>,
}

impl Waiter {
  fn key(&self) -> (u32, std::cmp::Reverse<u64>) {
    (self.priority, std::cmp::Reverse(self.seq))
  }
}

impl PartialEq for Waiter {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for Waiter {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.key().cmp(&other.key())
  }
}

struct GateState {
  free: usize,
  next_seq: u64,
  waiting: BinaryHeap<Waiter>,
}

/// Job slots handed out by priority. A free slot implies nobody is waiting.
struct Gate {
  state: Mutex<GateState>,
}

impl Gate {
  fn new(slots: usize) -> Self {
    Self {
      state: Mutex::new(GateState {
        free: slots,
        next_seq: 0,
        waiting: BinaryHeap::new(),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, GateState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Wait for a slot. Returns `None` only if the gate went away.
  ///
  /// The priority is read from the job's record under the gate lock, so a
  /// concurrent `set_priority` either lands before the read or finds the
  /// queued waiter.
  async fn acquire(
    self: &Arc<Self>,
    job: &JobHandle,
    record: &Mutex<AccountingRecord>,
  ) -> Option<Permit> {
    let wake = {
      let mut state = self.lock();
      if state.free > 0 {
        state.free -= 1;
        return Some(Permit::new(self.clone()));
      }
      let priority = record
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .priority
        .unwrap_or_default();
      let (tx, rx) = oneshot::channel();
      let seq = state.next_seq;
      state.next_seq += 1;
      state.waiting.push(Waiter {
        job: job.clone(),
        priority,
        seq,
        wake: tx,
      });
      rx
    };
    wake.await.ok()
  }

  /// Hand a released slot to the best waiter still listening.
  fn release(self: &Arc<Self>) {
    loop {
      let waiter = {
        let mut state = self.lock();
        match state.waiting.pop() {
          Some(waiter) => waiter,
          None => {
            state.free += 1;
            return;
          }
        }
      };
      match waiter.wake.send(Permit::new(self.clone())) {
        Ok(()) => return,
        // Cancelled while queued.
        Err(mut permit) => permit.disarm(),
      }
    }
  }

  /// Re-rank queued jobs.
  fn reprioritize(&self, jobs: &[JobHandle], priority: u32) {
    let mut state = self.lock();
    let waiting = std::mem::take(&mut state.waiting);
    state.waiting = waiting
      .into_iter()
      .map(|mut w| {
        if jobs.contains(&w.job) {
          w.priority = priority;
        }
        w
      })
      .collect();
  }
}

/// A held job slot, returned to the gate on drop.
struct Permit {
  gate: Option<Arc<Gate>>,
}

impl Permit {
  fn new(gate: Arc<Gate>) -> Self {
    Self { gate: Some(gate) }
  }

  fn disarm(&mut self) {
    self.gate = None;
  }
}

impl Drop for Permit {
  fn drop(&mut self) {
    if let Some(gate) = self.gate.take() {
      gate.release();
    }
  }
}

struct Inner {
  next_id: AtomicU64,
  jobs: Mutex<HashMap<JobHandle, LocalJob>>,
  dependents: Dependents,
  gate: Arc<Gate>,
  retention: Duration,
}

/// Runs jobs on this host, at most `max_jobs` at a time.
///
/// Stopped jobs are forgotten once they have been finished for longer than
/// the retention window (an hour unless set with [`Self::with_retention`]).
#[derive(Clone)]
pub struct LocalScheduler {
  inner: Arc<Inner>,
}

impl LocalScheduler {
  pub fn new(max_jobs: usize) -> Self {
    Self::build(max_jobs, Duration::from_secs(3600))
  }

  pub fn with_retention(max_jobs: usize, retention: Duration) -> Self {
    Self::build(max_jobs, retention)
  }

  fn build(max_jobs: usize, retention: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        next_id: AtomicU64::new(1),
        jobs: Mutex::new(HashMap::new()),
        dependents: Dependents::default(),
        gate: Arc::new(Gate::new(max_jobs.max(1))),
        retention,
      }),
    }
  }

  /// Drop stopped jobs that ended before the retention window.
  fn prune(&self) {
    let now = Utc::now();
    let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    let before = jobs.len();
    jobs.retain(|_, job| {
      let record = job.record.lock().unwrap_or_else(PoisonError::into_inner);
      let expired = record.state.is_stopped()
        && record
          .end
          .and_then(|end| (now - end).to_std().ok())
          .is_some_and(|age| age >= self.inner.retention);
      !expired
    });
    let removed = before - jobs.len();
    if removed > 0 {
      self.inner.dependents.retain(|job| jobs.contains_key(job));
      debug!(removed, "finished_jobs_pruned");
    }
  }

  fn receiver(&self, job: &JobHandle) -> Result<watch::Receiver<JobState>, SchedulerError> {
    let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    jobs
      .get(job)
      .map(|j| j.state.clone())
      .ok_or_else(|| SchedulerError::UnknownJob { job: job.clone() })
  }
}

/// Wait until a job stops and return its final state.
async fn stopped(mut rx: watch::Receiver<JobState>) -> JobState {
  loop {
    let state = *rx.borrow_and_update();
    if state.is_stopped() {
      return state;
    }
    if rx.changed().await.is_err() {
      return *rx.borrow();
    }
  }
}

fn update(
  tx: &watch::Sender<JobState>,
  record: &Mutex<AccountingRecord>,
  state: JobState,
  exit_code: Option<i32>,
) {
  {
    let mut record = record.lock().unwrap_or_else(PoisonError::into_inner);
    record.state = state;
    match state {
      JobState::Running => record.start = Some(Utc::now()),
      s if s.is_stopped() => {
        record.end = Some(Utc::now());
        record.exit_code = exit_code;
      }
      _ => {}
    }
  }
  tx.send_replace(state);
}

struct JobRun {
  job: JobHandle,
  request: SubmitRequest,
  after_ok: Vec<watch::Receiver<JobState>>,
  after_any: Vec<watch::Receiver<JobState>>,
  gate: Arc<Gate>,
  cancel: CancellationToken,
  tx: watch::Sender<JobState>,
  record: Arc<Mutex<AccountingRecord>>,
}

impl JobRun {
  async fn run(self) {
    let (state, exit_code) = tokio::select! {
      result = self.execute() => result,
      _ = self.cancel.cancelled() => (JobState::Cancelled, None),
    };
    info!(job = %self.job, state = %state, exit_code = ?exit_code, "job_finished");
    update(&self.tx, &self.record, state, exit_code);
  }

  async fn execute(&self) -> (JobState, Option<i32>) {
    for dep in &self.after_ok {
      if stopped(dep.clone()).await != JobState::Completed {
        debug!(job = %self.job, "dependency_never_satisfied");
        return (JobState::Cancelled, None);
      }
    }
    for dep in &self.after_any {
      stopped(dep.clone()).await;
    }

    update(&self.tx, &self.record, JobState::ResourceWait, None);
    let Some(_permit) = self.gate.acquire(&self.job, &self.record).await else {
      return (JobState::Failed, None);
    };
    update(&self.tx, &self.record, JobState::Running, None);

    match self.spawn().await {
      Ok(status) if status == Some(0) => (JobState::Completed, status),
      Ok(status) => (JobState::Failed, status),
      Err(e) => {
        warn!(job = %self.job, error = %e, "job_launch_failed");
        (JobState::Failed, None)
      }
    }
  }

  async fn spawn(&self) -> Result<Option<i32>, SchedulerError> {
    let launch = |source| SchedulerError::Launch {
      job: self.job.clone(),
      source,
    };
    let stdout = File::create(&self.request.stdout).map_err(launch)?;
    let stderr = File::create(&self.request.stderr).map_err(launch)?;

    let mut child = Command::new(&self.request.driver)
      .args(&self.request.args)
      .current_dir(&self.request.workdir)
      .stdin(Stdio::null())
      .stdout(Stdio::from(stdout))
      .stderr(Stdio::from(stderr))
      .kill_on_drop(true)
      .spawn()
      .map_err(launch)?;

    let status = child.wait().await.map_err(launch)?;
    Ok(status.code())
  }
}

#[async_trait]
impl BatchScheduler for LocalScheduler {
  fn name(&self) -> &'static str {
    "local"
  }

  async fn is_alive(&self) -> Result<(), SchedulerError> {
    Ok(())
  }

  #[instrument(name = "local_submit", skip(self, request), fields(job_name = %request.job_name))]
  async fn submit(&self, request: SubmitRequest) -> Result<JobHandle, SchedulerError> {
    self.prune();
    let after_ok = request
      .after_ok
      .iter()
      .map(|j| self.receiver(j))
      .collect::<Result<Vec<_>, _>>()?;
    let after_any = request
      .after_any
      .iter()
      .map(|j| self.receiver(j))
      .collect::<Result<Vec<_>, _>>()?;

    let job = JobHandle::new(
      self
        .inner
        .next_id
        .fetch_add(1, Ordering::Relaxed)
        .to_string(),
    );
    let (tx, rx) = watch::channel(JobState::Pending);
    let cancel = CancellationToken::new();
    let record = Arc::new(Mutex::new(AccountingRecord {
      job_id: job.clone(),
      state: JobState::Pending,
      priority: Some(request.priority),
      submit: Some(Utc::now()),
      start: None,
      end: None,
      exit_code: None,
    }));

    self.inner.dependents.register(&job, &request);
    {
      let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
      jobs.insert(
        job.clone(),
        LocalJob {
          state: rx,
          cancel: cancel.clone(),
          record: record.clone(),
        },
      );
    }

    let run = JobRun {
      job: job.clone(),
      request,
      after_ok,
      after_any,
      gate: self.inner.gate.clone(),
      cancel,
      tx,
      record,
    };
    tokio::spawn(run.run());

    info!(job = %job, "job_submitted");
    Ok(job)
  }

  async fn get_state(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
    Ok(*self.receiver(job)?.borrow())
  }

  async fn cancel(&self, job: &JobHandle) -> Result<Vec<JobHandle>, SchedulerError> {
    let targets = self.inner.dependents.closure(job);
    let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    if !jobs.contains_key(job) {
      return Err(SchedulerError::UnknownJob { job: job.clone() });
    }
    for target in &targets {
      if let Some(local) = jobs.get(target) {
        local.cancel.cancel();
      }
    }
    info!(job = %job, cascaded = targets.len() - 1, "job_cancelled");
    Ok(targets)
  }

  async fn set_priority(&self, jobs: &[JobHandle], priority: u32) -> Result<(), SchedulerError> {
    let table = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    for job in jobs {
      let local = table
        .get(job)
        .ok_or_else(|| SchedulerError::UnknownJob { job: job.clone() })?;
      local
        .record
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .priority = Some(priority);
    }
    self.inner.gate.reprioritize(jobs, priority);
    Ok(())
  }

  async fn accounting(
    &self,
    jobs: &[JobHandle],
  ) -> Result<HashMap<JobHandle, AccountingRecord>, SchedulerError> {
    let table = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(
      jobs
        .iter()
        .filter_map(|job| {
          let local = table.get(job)?;
          let record = local
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
          Some((job.clone(), record))
        })
        .collect(),
    )
  }
}
