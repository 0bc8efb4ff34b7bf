use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::{ConfigError, EnvLookup, flag_or, parse_or};

const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_IDLE_FACTOR: u32 = 10;
const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_DISPATCH_DEADLINE_SECS: u64 = 48 * 60 * 60;
const DEFAULT_SANDBOX_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Tuning for the Manager and its Worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
  /// Number of Worker slots.
  pub worker_count: usize,
  /// Manager control loop interval.
  pub poll_interval_ms: u64,
  /// Idle maintenance runs every `idle_factor * poll_interval_ms`.
  pub idle_factor: u32,
  /// How often a Worker polls the state of its batch job.
  pub job_poll_interval_ms: u64,
  /// A Worker that has not reported within this window is presumed dead.
  pub dispatch_deadline_secs: u64,
  /// Directory under which per-component sandboxes are created.
  pub sandbox_root: PathBuf,
  /// Finished sandboxes older than this are garbage collected.
  pub sandbox_retention_secs: u64,
  /// Keep sandboxes of failed components for inspection.
  pub keep_failed_sandboxes: bool,
}

impl Default for FleetConfig {
  fn default() -> Self {
    Self {
      worker_count: DEFAULT_WORKER_COUNT,
      poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
      idle_factor: DEFAULT_IDLE_FACTOR,
      job_poll_interval_ms: DEFAULT_JOB_POLL_INTERVAL_MS,
      dispatch_deadline_secs: DEFAULT_DISPATCH_DEADLINE_SECS,
      sandbox_root: default_sandbox_root(),
      sandbox_retention_secs: DEFAULT_SANDBOX_RETENTION_SECS,
      keep_failed_sandboxes: true,
    }
  }
}

impl FleetConfig {
  pub(crate) fn from_lookup(lookup: &dyn EnvLookup) -> Result<Self, ConfigError> {
    let defaults = Self::default();

    let worker_count: usize = parse_or(lookup, "SLUICE_WORKER_COUNT", defaults.worker_count)?;
    if worker_count == 0 {
      return Err(ConfigError::Invalid {
        key: "SLUICE_WORKER_COUNT".to_string(),
        value: "0".to_string(),
        message: "at least one worker slot is required".to_string(),
      });
    }

    Ok(Self {
      worker_count,
      poll_interval_ms: parse_or(lookup, "SLUICE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
      idle_factor: parse_or(lookup, "SLUICE_IDLE_FACTOR", defaults.idle_factor)?,
      job_poll_interval_ms: parse_or(
        lookup,
        "SLUICE_JOB_POLL_INTERVAL_MS",
        defaults.job_poll_interval_ms,
      )?,
      dispatch_deadline_secs: parse_or(
        lookup,
        "SLUICE_DISPATCH_DEADLINE_SECS",
        defaults.dispatch_deadline_secs,
      )?,
      sandbox_root: lookup
        .get("SLUICE_SANDBOX_ROOT")
        .map(PathBuf::from)
        .unwrap_or(defaults.sandbox_root),
      sandbox_retention_secs: parse_or(
        lookup,
        "SLUICE_SANDBOX_RETENTION_SECS",
        defaults.sandbox_retention_secs,
      )?,
      keep_failed_sandboxes: flag_or(
        lookup,
        "SLUICE_KEEP_FAILED_SANDBOXES",
        defaults.keep_failed_sandboxes,
      )?,
    })
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }

  pub fn job_poll_interval(&self) -> Duration {
    Duration::from_millis(self.job_poll_interval_ms.max(1))
  }

  pub fn dispatch_deadline(&self) -> Duration {
    Duration::from_secs(self.dispatch_deadline_secs)
  }

  pub fn sandbox_retention(&self) -> Duration {
    Duration::from_secs(self.sandbox_retention_secs)
  }
}

fn default_sandbox_root() -> PathBuf {
  dirs::data_local_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("sluice")
    .join("sandboxes")
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn test_zero_workers_rejected() {
    let vars = HashMap::from([("SLUICE_WORKER_COUNT".to_string(), "0".to_string())]);
    assert!(FleetConfig::from_lookup(&vars).is_err());
  }
}
