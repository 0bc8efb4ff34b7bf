use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by runs and components.
///
/// ```text
/// Pending → Running → Successful
///              ├──→ Failing ──→ Failed
///              └──→ Cancelling → Cancelled
/// Successful ──(begin_recovery)──→ Running
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  #[default]
  Pending,
  Running,
  Successful,
  Cancelling,
  Failing,
  Failed,
  Cancelled,
}

impl RunState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      RunState::Successful | RunState::Failed | RunState::Cancelled
    )
  }

  pub fn is_active(self) -> bool {
    !self.is_terminal()
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      RunState::Pending => "PENDING",
      RunState::Running => "RUNNING",
      RunState::Successful => "SUCCESSFUL",
      RunState::Cancelling => "CANCELLING",
      RunState::Failing => "FAILING",
      RunState::Failed => "FAILED",
      RunState::Cancelled => "CANCELLED",
    };
    f.write_str(s)
  }
}
