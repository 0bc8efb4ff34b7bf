use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata of one concrete execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecLog {
  pub log_id: Uuid,
  pub started_at: DateTime<Utc>,
  pub ended_at: Option<DateTime<Utc>>,
  /// Driver return code. `None` when the driver never ran or was killed.
  pub return_code: Option<i32>,
  pub stdout: Option<PathBuf>,
  pub stderr: Option<PathBuf>,
}

impl ExecLog {
  /// Open a log for an attempt starting now.
  pub fn start() -> Self {
    Self {
      log_id: Uuid::new_v4(),
      started_at: Utc::now(),
      ended_at: None,
      return_code: None,
      stdout: None,
      stderr: None,
    }
  }

  pub fn finish(&mut self, return_code: Option<i32>) {
    self.ended_at = Some(Utc::now());
    self.return_code = return_code;
  }
}
