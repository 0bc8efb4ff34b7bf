//! Slurm client built on `sbatch`, `sacct`, `scancel` and `scontrol`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sluice_config::SchedulerConfig;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandOutput, CommandRunner, ProcessRunner};
use crate::error::SchedulerError;
use crate::scheduler::BatchScheduler;
use crate::types::{AccountingRecord, Dependents, JobHandle, JobState, SubmitRequest};

const SACCT_FORMAT: &str = "--format=JobID,State,Priority,Submit,Start,End,ExitCode";

/// A job state as reported by Slurm, before node-failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawState {
  Mapped(JobState),
  NodeFail,
}

fn parse_slurm_state(raw: &str) -> RawState {
  // "CANCELLED by 1000", "COMPLETED+"
  let word = raw
    .split_whitespace()
    .next()
    .unwrap_or("")
    .trim_end_matches('+');
  let state = match word {
    "PENDING" => JobState::Pending,
    "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESIZING" | "SUSPENDED" | "STOPPED"
    | "SIGNALING" | "STAGE_OUT" | "CONFIGURING" => JobState::ResourceWait,
    "RUNNING" | "COMPLETING" => JobState::Running,
    "COMPLETED" => JobState::Completed,
    "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED"
    | "SPECIAL_EXIT" | "REVOKED" => JobState::Failed,
    "CANCELLED" => JobState::Cancelled,
    "NODE_FAIL" => return RawState::NodeFail,
    _ => JobState::Unknown,
  };
  RawState::Mapped(state)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S")
    .ok()
    .map(|t| t.and_utc())
}

/// `"2:0"` → 2. Signals (`"0:9"`) have no exit code.
fn parse_exit_code(raw: &str) -> Option<i32> {
  let (code, signal) = raw.trim().split_once(':')?;
  let code: i32 = code.parse().ok()?;
  let signal: i32 = signal.parse().ok()?;
  if signal != 0 && code == 0 {
    None
  } else {
    Some(code)
  }
}

/// Parse `sbatch --parsable` output: `"<id>"` or `"<id>;<cluster>"`.
fn parse_job_id(stdout: &str) -> Option<JobHandle> {
  let id = stdout.trim().split(';').next()?.trim();
  if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit() || b == b'_') {
    Some(JobHandle::new(id))
  } else {
    None
  }
}

/// Slurm batch scheduler client.
pub struct SlurmScheduler {
  config: SchedulerConfig,
  runner: Arc<dyn CommandRunner>,
  dependents: Dependents,
  /// First time each job was seen in NODE_FAIL.
  node_failures: Mutex<HashMap<JobHandle, Instant>>,
}

impl SlurmScheduler {
  pub fn new(config: SchedulerConfig) -> Self {
    Self::with_runner(config, Arc::new(ProcessRunner))
  }

  /// Use a custom command runner, e.g. a scripted one in tests.
  pub fn with_runner(config: SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
    Self {
      config,
      runner,
      dependents: Dependents::default(),
      node_failures: Mutex::new(HashMap::new()),
    }
  }

  /// Run a command, retrying transient failures with a fixed delay.
  async fn invoke(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, SchedulerError> {
    let attempts = self.config.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
      match self.runner.run(program, &args).await {
        Ok(output) if output.success() => return Ok(output),
        Ok(output) => {
          last_error = format!(
            "exit status {:?}: {}",
            output.status,
            output.stderr.trim()
          );
        }
        Err(e) => last_error = e.to_string(),
      }

      if attempt < attempts {
        warn!(
          program = program,
          attempt = attempt,
          error = %last_error,
          "scheduler_command_retry"
        );
        tokio::time::sleep(self.config.retry_delay()).await;
      }
    }

    Err(SchedulerError::CommandFailed {
      program: program.to_string(),
      attempts,
      message: last_error,
    })
  }

  fn sbatch_args(&self, request: &SubmitRequest) -> Vec<String> {
    let mut args = vec![
      "--parsable".to_string(),
      "--kill-on-invalid-dep=yes".to_string(),
      format!("--job-name={}", request.job_name),
      format!("--chdir={}", request.workdir.display()),
      format!("--output={}", request.stdout.display()),
      format!("--error={}", request.stderr.display()),
      format!("--cpus-per-task={}", request.cpu_count.max(1)),
    ];
    if request.memory_mb > 0 {
      args.push(format!("--mem={}M", request.memory_mb));
    }
    if request.priority > 0 {
      args.push(format!("--priority={}", request.priority));
    }
    if let Some(uid) = request.uid {
      args.push(format!("--uid={}", uid));
    }
    if let Some(gid) = request.gid {
      args.push(format!("--gid={}", gid));
    }
    if let Some(partition) = &self.config.partition {
      args.push(format!("--partition={}", partition));
    }

    let mut dependency = Vec::new();
    if !request.after_ok.is_empty() {
      dependency.push(format!("afterok:{}", join_ids(&request.after_ok, ":")));
    }
    if !request.after_any.is_empty() {
      dependency.push(format!("afterany:{}", join_ids(&request.after_any, ":")));
    }
    if !dependency.is_empty() {
      args.push(format!("--dependency={}", dependency.join(",")));
    }

    args.push(request.driver.display().to_string());
    args.extend(request.args.iter().cloned());
    args
  }

  async fn query(&self, jobs: &[JobHandle]) -> Result<HashMap<JobHandle, SacctRow>, SchedulerError> {
    if jobs.is_empty() {
      return Ok(HashMap::new());
    }
    let args = vec![
      "--parsable2".to_string(),
      "--noheader".to_string(),
      "--allocations".to_string(),
      SACCT_FORMAT.to_string(),
      format!("--jobs={}", join_ids(jobs, ",")),
    ];
    let output = self.invoke("sacct", args).await?;

    let mut rows = HashMap::new();
    for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
      let row = SacctRow::parse(line).ok_or_else(|| SchedulerError::Parse {
        program: "sacct".to_string(),
        message: format!("malformed row '{}'", line),
      })?;
      // Job steps ("123.batch") are reported even with --allocations on some sites.
      if !row.job_id.as_str().contains('.') {
        rows.insert(row.job_id.clone(), row);
      }
    }
    Ok(rows)
  }

  /// Apply the node-failure timeout to a raw state.
  fn resolve(&self, job: &JobHandle, raw: RawState) -> JobState {
    let mut failures = self
      .node_failures
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    match raw {
      RawState::Mapped(state) => {
        failures.remove(job);
        state
      }
      RawState::NodeFail => {
        let since = *failures.entry(job.clone()).or_insert_with(Instant::now);
        if since.elapsed() >= self.config.node_fail_timeout() {
          warn!(job = %job, "node_failure_timeout");
          JobState::Failed
        } else {
          JobState::ResourceWait
        }
      }
    }
  }
}

fn join_ids(jobs: &[JobHandle], sep: &str) -> String {
  jobs
    .iter()
    .map(JobHandle::as_str)
    .collect::<Vec<_>>()
    .join(sep)
}

#[derive(Debug, Clone)]
struct SacctRow {
  job_id: JobHandle,
  state: RawState,
  priority: Option<u32>,
  submit: Option<DateTime<Utc>>,
  start: Option<DateTime<Utc>>,
  end: Option<DateTime<Utc>>,
  exit_code: Option<i32>,
}

impl SacctRow {
  fn parse(line: &str) -> Option<Self> {
    let fields: Vec<&str> = line.split('|').collect();
    let [job_id, state, priority, submit, start, end, exit_code] = fields.as_slice() else {
      return None;
    };
    Some(Self {
      job_id: JobHandle::new(job_id.trim()),
      state: parse_slurm_state(state),
      priority: priority.trim().parse().ok(),
      submit: parse_timestamp(submit),
      start: parse_timestamp(start),
      end: parse_timestamp(end),
      exit_code: parse_exit_code(exit_code),
    })
  }
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
  fn name(&self) -> &'static str {
    "slurm"
  }

  async fn is_alive(&self) -> Result<(), SchedulerError> {
    self
      .invoke("scontrol", vec!["ping".to_string()])
      .await
      .map(|_| ())
      .map_err(|e| SchedulerError::Unreachable {
        message: e.to_string(),
      })
  }

  #[instrument(name = "slurm_submit", skip(self, request), fields(job_name = %request.job_name))]
  async fn submit(&self, request: SubmitRequest) -> Result<JobHandle, SchedulerError> {
    let output = self.invoke("sbatch", self.sbatch_args(&request)).await?;
    let job = parse_job_id(&output.stdout).ok_or_else(|| SchedulerError::Parse {
      program: "sbatch".to_string(),
      message: format!("no job id in '{}'", output.stdout.trim()),
    })?;
    self.dependents.register(&job, &request);
    info!(job = %job, "job_submitted");
    Ok(job)
  }

  async fn get_state(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
    let rows = self.query(std::slice::from_ref(job)).await?;
    let state = match rows.get(job) {
      Some(row) => self.resolve(job, row.state),
      None => JobState::Unknown,
    };
    debug!(job = %job, state = %state, "job_polled");
    Ok(state)
  }

  async fn cancel(&self, job: &JobHandle) -> Result<Vec<JobHandle>, SchedulerError> {
    let targets = self.dependents.closure(job);
    let args = targets.iter().map(|j| j.0.clone()).collect();
    self.invoke("scancel", args).await?;
    info!(job = %job, cascaded = targets.len() - 1, "job_cancelled");
    Ok(targets)
  }

  async fn set_priority(&self, jobs: &[JobHandle], priority: u32) -> Result<(), SchedulerError> {
    for job in jobs {
      let args = vec![
        "update".to_string(),
        format!("JobId={}", job),
        format!("Priority={}", priority),
      ];
      self.invoke("scontrol", args).await?;
    }
    Ok(())
  }

  async fn accounting(
    &self,
    jobs: &[JobHandle],
  ) -> Result<HashMap<JobHandle, AccountingRecord>, SchedulerError> {
    let rows = self.query(jobs).await?;
    Ok(
      rows
        .into_values()
        .map(|row| {
          let state = self.resolve(&row.job_id, row.state);
          let record = AccountingRecord {
            job_id: row.job_id.clone(),
            state,
            priority: row.priority,
            submit: row.submit,
            start: row.start,
            end: row.end,
            exit_code: row.exit_code,
          };
          (row.job_id, record)
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_mapping() {
    use JobState::*;
    let cases = [
      ("PENDING", Pending),
      ("RUNNING", Running),
      ("COMPLETING", Running),
      ("COMPLETED", Completed),
      ("FAILED", Failed),
      ("TIMEOUT", Failed),
      ("OUT_OF_MEMORY", Failed),
      ("CANCELLED by 1000", Cancelled),
      ("CANCELLED+", Cancelled),
      ("REQUEUED", ResourceWait),
      ("SOMETHING_NEW", Unknown),
      ("", Unknown),
    ];
    for (raw, expected) in cases {
      assert_eq!(parse_slurm_state(raw), RawState::Mapped(expected), "{}", raw);
    }
    assert_eq!(parse_slurm_state("NODE_FAIL"), RawState::NodeFail);
  }

  #[test]
  fn test_exit_code_parsing() {
    assert_eq!(parse_exit_code("0:0"), Some(0));
    assert_eq!(parse_exit_code("2:0"), Some(2));
    assert_eq!(parse_exit_code("0:9"), None);
    assert_eq!(parse_exit_code(""), None);
  }

  #[test]
  fn test_job_id_parsing() {
    assert_eq!(parse_job_id("12345\n"), Some(JobHandle::new("12345")));
    assert_eq!(parse_job_id("12345;cluster"), Some(JobHandle::new("12345")));
    assert_eq!(parse_job_id("sbatch: error"), None);
  }

  #[test]
  fn test_sacct_row() {
    let row = SacctRow::parse("42|COMPLETED|1000|2024-03-01T10:00:00|2024-03-01T10:00:05|Unknown|0:0")
      .unwrap();
    assert_eq!(row.job_id, JobHandle::new("42"));
    assert_eq!(row.priority, Some(1000));
    assert!(row.submit.is_some());
    assert!(row.end.is_none());
    assert_eq!(row.exit_code, Some(0));
    assert!(SacctRow::parse("42|COMPLETED").is_none());
  }
}
