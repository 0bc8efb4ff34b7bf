use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::{ConfigError, EnvLookup, parse_or};

/// Which external batch scheduler (if any) receives cluster-targeted tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
  /// Every task runs locally through the container runner.
  #[default]
  None,
  /// In-process scheduler running jobs as child processes.
  Local,
  /// Slurm, driven through its command line tools.
  Slurm,
}

impl FromStr for SchedulerKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "none" | "" => Ok(Self::None),
      "local" => Ok(Self::Local),
      "slurm" => Ok(Self::Slurm),
      other => Err(format!("unknown scheduler '{}'", other)),
    }
  }
}

/// Tuning for the scheduler client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub kind: SchedulerKind,
  /// Attempts for a scheduler command before the failure is surfaced.
  pub retries: u32,
  /// Fixed sleep between attempts.
  pub retry_delay_ms: u64,
  /// A job reported as NODE_FAIL longer than this is a terminal failure.
  pub node_fail_timeout_secs: u64,
  /// Slurm partition to submit into.
  pub partition: Option<String>,
  /// Program a batch job runs to execute a task; defaults to the current executable.
  pub helper_program: Option<PathBuf>,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      kind: SchedulerKind::None,
      retries: 5,
      retry_delay_ms: 1000,
      node_fail_timeout_secs: 300,
      partition: None,
      helper_program: None,
    }
  }
}

impl SchedulerConfig {
  pub(crate) fn from_lookup(lookup: &dyn EnvLookup) -> Result<Self, ConfigError> {
    let defaults = Self::default();
    Ok(Self {
      kind: parse_or(lookup, "SLUICE_SCHEDULER", defaults.kind)?,
      retries: parse_or(lookup, "SLUICE_SCHEDULER_RETRIES", defaults.retries)?,
      retry_delay_ms: parse_or(
        lookup,
        "SLUICE_SCHEDULER_RETRY_DELAY_MS",
        defaults.retry_delay_ms,
      )?,
      node_fail_timeout_secs: parse_or(
        lookup,
        "SLUICE_NODE_FAIL_TIMEOUT_SECS",
        defaults.node_fail_timeout_secs,
      )?,
      partition: lookup.get("SLUICE_SLURM_PARTITION").filter(|p| !p.is_empty()),
      helper_program: lookup.get("SLUICE_HELPER_PROGRAM").map(PathBuf::from),
    })
  }

  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.retry_delay_ms)
  }

  pub fn node_fail_timeout(&self) -> Duration {
    Duration::from_secs(self.node_fail_timeout_secs)
  }
}
