//! Task outcome, as written to `logs/outcome.json`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_cache::ContentHash;

use crate::error::ContainerError;

/// How an execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
  Succeeded,
  /// The driver exited nonzero or could not be started.
  Failed,
  Cancelled,
  /// An input no longer matched its recorded hash; nothing was launched.
  IntegrityFailure,
  /// The batch scheduler could not accept or track the job.
  SubmissionFailure,
  /// The worker died or stopped reporting.
  WorkerFailure,
}

impl OutcomeKind {
  pub fn is_success(self) -> bool {
    self == OutcomeKind::Succeeded
  }
}

impl fmt::Display for OutcomeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OutcomeKind::Succeeded => "succeeded",
      OutcomeKind::Failed => "failed",
      OutcomeKind::Cancelled => "cancelled",
      OutcomeKind::IntegrityFailure => "integrity_failure",
      OutcomeKind::SubmissionFailure => "submission_failure",
      OutcomeKind::WorkerFailure => "worker_failure",
    };
    f.write_str(s)
  }
}

/// A produced output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
  pub name: String,
  pub path: PathBuf,
  pub hash: ContentHash,
  pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
  pub task_id: String,
  pub kind: OutcomeKind,
  pub return_code: Option<i32>,
  pub started_at: DateTime<Utc>,
  pub ended_at: DateTime<Utc>,
  pub stdout: Option<PathBuf>,
  pub stderr: Option<PathBuf>,
  #[serde(default)]
  pub outputs: Vec<OutputFile>,
  /// Internal step that stopped a multi-step task (zero based).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failed_step: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl TaskOutcome {
  /// An outcome for an attempt that never produced a return code.
  pub fn without_return_code(
    task_id: impl Into<String>,
    kind: OutcomeKind,
    started_at: DateTime<Utc>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      task_id: task_id.into(),
      kind,
      return_code: None,
      started_at,
      ended_at: Utc::now(),
      stdout: None,
      stderr: None,
      outputs: Vec::new(),
      failed_step: None,
      message: Some(message.into()),
    }
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

  /// Last `max_lines` lines of captured stderr.
  pub fn stderr_tail(&self, max_lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(self.stderr.as_ref()?).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join("\n"))
  }
}
