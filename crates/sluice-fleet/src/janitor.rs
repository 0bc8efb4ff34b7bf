//! Idle maintenance: garbage collection of finished sandboxes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sluice_cache::{DatasetId, DatasetRegistry};
use sluice_config::FleetConfig;
use sluice_container::{Sandbox, TaskOutcome};
use tracing::{debug, info, warn};

/// What one sweep removed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
  pub removed: Vec<PathBuf>,
  /// Datasets whose bytes went away with a removed sandbox.
  pub purged: Vec<DatasetId>,
  pub kept_failed: usize,
}

/// Removes sandboxes under the sandbox root once they are older than the
/// retention window. Outputs registered from a removed sandbox are purged,
/// so later runs regenerate them through recovery.
#[derive(Debug, Clone)]
pub struct SandboxJanitor {
  root: PathBuf,
  retention: Duration,
  keep_failed: bool,
  datasets: DatasetRegistry,
}

impl SandboxJanitor {
  pub fn new(config: &FleetConfig, datasets: DatasetRegistry) -> Self {
    Self {
      root: config.sandbox_root.clone(),
      retention: config.sandbox_retention(),
      keep_failed: config.keep_failed_sandboxes,
      datasets,
    }
  }

  /// The sandbox directly under the sandbox root that holds `path`.
  pub fn sandbox_of(&self, path: &Path) -> Option<PathBuf> {
    let first = path.strip_prefix(&self.root).ok()?.components().next()?;
    Some(self.root.join(first))
  }

  /// Sweep once, skipping every sandbox in `active`.
  pub fn sweep(&self, active: &HashSet<PathBuf>) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(&self.root) {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
      Err(e) => {
        warn!(root = %self.root.display(), error = %e, "sandbox_root_unreadable");
        return report;
      }
    };

    for entry in entries.flatten() {
      let path = entry.path();
      if !path.is_dir() || active.contains(&path) {
        continue;
      }

      let sandbox = Sandbox::at(&path);
      let outcome = TaskOutcome::read(sandbox.outcome_path()).ok();
      if self.keep_failed && outcome.as_ref().is_some_and(|o| !o.kind.is_success()) {
        report.kept_failed += 1;
        continue;
      }
      if age(&sandbox) < self.retention {
        continue;
      }

      for id in self.datasets.retained_under(&path) {
        match self.datasets.purge(id) {
          Ok(()) => report.purged.push(id),
          Err(e) => warn!(dataset = %id, error = %e, "dataset_purge_failed"),
        }
      }
      match std::fs::remove_dir_all(&path) {
        Ok(()) => {
          debug!(sandbox = %path.display(), "sandbox_removed");
          report.removed.push(path);
        }
        Err(e) => warn!(sandbox = %path.display(), error = %e, "sandbox_remove_failed"),
      }
    }

    if !report.removed.is_empty() {
      info!(
        removed = report.removed.len(),
        purged = report.purged.len(),
        kept_failed = report.kept_failed,
        "sandbox_sweep_finished"
      );
    }
    report
  }
}

/// Time since the sandbox last finished, falling back to the directory
/// itself when no outcome was written.
fn age(sandbox: &Sandbox) -> Duration {
  let outcome = sandbox.outcome_path();
  let marker = if outcome.is_file() {
    outcome
  } else {
    sandbox.root().to_path_buf()
  };
  std::fs::metadata(marker)
    .and_then(|m| m.modified())
    .ok()
    .and_then(|t| t.elapsed().ok())
    .unwrap_or_default()
}
