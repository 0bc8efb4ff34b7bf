use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Pending,
  /// Queued but held back by resources, a requeue or a suspected node fault.
  ResourceWait,
  Running,
  Completed,
  Failed,
  Cancelled,
  /// The scheduler reported something unrecognised, or nothing at all.
  Unknown,
}

impl JobState {
  /// Whether the job will not change state again.
  pub fn is_stopped(self) -> bool {
    matches!(
      self,
      JobState::Completed | JobState::Failed | JobState::Cancelled
    )
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      JobState::Pending => "pending",
      JobState::ResourceWait => "resource_wait",
      JobState::Running => "running",
      JobState::Completed => "completed",
      JobState::Failed => "failed",
      JobState::Cancelled => "cancelled",
      JobState::Unknown => "unknown",
    };
    f.write_str(s)
  }
}

/// Everything needed to queue one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
  pub job_name: String,
  pub workdir: PathBuf,
  pub driver: PathBuf,
  pub args: Vec<String>,
  pub uid: Option<u32>,
  pub gid: Option<u32>,
  pub priority: u32,
  pub cpu_count: u32,
  pub memory_mb: u64,
  pub stdout: PathBuf,
  pub stderr: PathBuf,
  /// Run only if all of these complete successfully.
  pub after_ok: Vec<JobHandle>,
  /// Run once all of these stop, whatever their outcome.
  pub after_any: Vec<JobHandle>,
}

/// One row of scheduler accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingRecord {
  pub job_id: JobHandle,
  pub state: JobState,
  pub priority: Option<u32>,
  pub submit: Option<DateTime<Utc>>,
  pub start: Option<DateTime<Utc>>,
  pub end: Option<DateTime<Utc>>,
  pub exit_code: Option<i32>,
}

/// Jobs that were submitted with a dependency on another job.
#[derive(Debug, Default)]
pub(crate) struct Dependents {
  map: Mutex<HashMap<JobHandle, Vec<JobHandle>>>,
}

impl Dependents {
  pub(crate) fn register(&self, job: &JobHandle, request: &SubmitRequest) {
    let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
    for upstream in request.after_ok.iter().chain(&request.after_any) {
      map.entry(upstream.clone()).or_default().push(job.clone());
    }
  }

  /// Forget every job for which `keep` is false.
  pub(crate) fn retain(&self, keep: impl Fn(&JobHandle) -> bool) {
    let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
    map.retain(|upstream, children| {
      children.retain(|c| keep(c));
      keep(upstream) && !children.is_empty()
    });
  }

  /// `job` followed by everything that transitively depends on it.
  pub(crate) fn closure(&self, job: &JobHandle) -> Vec<JobHandle> {
    let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut queue = VecDeque::from([job.clone()]);
    while let Some(next) = queue.pop_front() {
      if !seen.insert(next.clone()) {
        continue;
      }
      if let Some(children) = map.get(&next) {
        queue.extend(children.iter().cloned());
      }
      out.push(next);
    }
    out
  }
}
