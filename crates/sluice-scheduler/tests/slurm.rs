//! Slurm protocol tests against a scripted command runner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sluice_config::SchedulerConfig;
use sluice_scheduler::{
  BatchScheduler, CommandOutput, CommandRunner, JobHandle, JobState, SchedulerError, SlurmScheduler,
  SubmitRequest,
};

/// Replays canned outputs and records every invocation.
#[derive(Default)]
struct ScriptedRunner {
  replies: Mutex<VecDeque<std::io::Result<CommandOutput>>>,
  calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
  fn reply(&self, status: i32, stdout: &str) {
    self.replies.lock().unwrap().push_back(Ok(CommandOutput {
      status: Some(status),
      stdout: stdout.to_string(),
      stderr: if status == 0 { String::new() } else { "slurm_load_jobs error".to_string() },
    }));
  }

  fn unreachable(&self) {
    self.replies.lock().unwrap().push_back(Err(std::io::Error::new(
      std::io::ErrorKind::NotFound,
      "sbatch: command not found",
    )));
  }

  fn calls(&self) -> Vec<(String, Vec<String>)> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
  async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
    self
      .calls
      .lock()
      .unwrap()
      .push((program.to_string(), args.to_vec()));
    self
      .replies
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Ok(CommandOutput::default()))
  }
}

fn config(node_fail_timeout_secs: u64) -> SchedulerConfig {
  SchedulerConfig {
    retries: 3,
    retry_delay_ms: 1,
    node_fail_timeout_secs,
    partition: Some("batch".to_string()),
    ..Default::default()
  }
}

fn slurm(timeout: u64) -> (SlurmScheduler, Arc<ScriptedRunner>) {
  let runner = Arc::new(ScriptedRunner::default());
  (SlurmScheduler::with_runner(config(timeout), runner.clone()), runner)
}

fn request(after_ok: &[&str], after_any: &[&str]) -> SubmitRequest {
  SubmitRequest {
    job_name: "sort".to_string(),
    workdir: "/scratch/run1".into(),
    driver: "/usr/bin/sluice".into(),
    args: vec!["exec-task".to_string(), "task.json".to_string()],
    cpu_count: 2,
    memory_mb: 512,
    priority: 10,
    stdout: "/scratch/run1/logs/stdout.txt".into(),
    stderr: "/scratch/run1/logs/stderr.txt".into(),
    after_ok: after_ok.iter().map(|s| JobHandle::new(*s)).collect(),
    after_any: after_any.iter().map(|s| JobHandle::new(*s)).collect(),
    ..Default::default()
  }
}

#[tokio::test]
async fn test_submit_builds_sbatch_command() {
  let (slurm, runner) = slurm(300);
  runner.reply(0, "4242;cluster\n");

  let job = slurm.submit(request(&["1", "2"], &["3"])).await.unwrap();
  assert_eq!(job, JobHandle::new("4242"));

  let calls = runner.calls();
  let (program, args) = &calls[0];
  assert_eq!(program, "sbatch");
  assert_eq!(args[0], "--parsable");
  assert!(args.contains(&"--kill-on-invalid-dep=yes".to_string()));
  assert!(args.contains(&"--dependency=afterok:1:2,afterany:3".to_string()));
  assert!(args.contains(&"--cpus-per-task=2".to_string()));
  assert!(args.contains(&"--mem=512M".to_string()));
  assert!(args.contains(&"--partition=batch".to_string()));
  assert_eq!(&args[args.len() - 3..], ["/usr/bin/sluice", "exec-task", "task.json"]);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
  let (slurm, runner) = slurm(300);
  runner.unreachable();
  runner.reply(1, "");
  runner.reply(0, "77");

  let job = slurm.submit(request(&[], &[])).await.unwrap();
  assert_eq!(job, JobHandle::new("77"));
  assert_eq!(runner.calls().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_are_surfaced() {
  let (slurm, runner) = slurm(300);
  for _ in 0..3 {
    runner.reply(1, "");
  }
  let err = slurm.submit(request(&[], &[])).await.unwrap_err();
  assert!(matches!(err, SchedulerError::CommandFailed { attempts: 3, .. }));
  assert_eq!(runner.calls().len(), 3);
}

#[tokio::test]
async fn test_get_state_reads_sacct() {
  let (slurm, runner) = slurm(300);
  runner.reply(
    0,
    "9|CANCELLED by 1000|5|2024-03-01T10:00:00|Unknown|2024-03-01T10:01:00|0:15\n9.batch|CANCELLED|5||||\n",
  );
  runner.reply(0, "");

  let job = JobHandle::new("9");
  assert_eq!(slurm.get_state(&job).await.unwrap(), JobState::Cancelled);
  // Not yet known to accounting.
  assert_eq!(slurm.get_state(&job).await.unwrap(), JobState::Unknown);

  let (program, args) = &runner.calls()[0];
  assert_eq!(program, "sacct");
  assert!(args.contains(&"--jobs=9".to_string()));
}

#[tokio::test]
async fn test_node_failure_is_transient_until_timeout() {
  let (slurm, runner) = slurm(300);
  runner.reply(0, "5|NODE_FAIL|1||||\n");
  assert_eq!(
    slurm.get_state(&JobHandle::new("5")).await.unwrap(),
    JobState::ResourceWait
  );

  let (slurm, runner) = self::slurm(0);
  runner.reply(0, "5|NODE_FAIL|1||||\n");
  assert_eq!(
    slurm.get_state(&JobHandle::new("5")).await.unwrap(),
    JobState::Failed
  );
}

#[tokio::test]
async fn test_cancel_includes_registered_dependents() {
  let (slurm, runner) = slurm(300);
  runner.reply(0, "100");
  runner.reply(0, "101");
  runner.reply(0, "102");
  let a = slurm.submit(request(&[], &[])).await.unwrap();
  let b = slurm.submit(request(&["100"], &[])).await.unwrap();
  let c = slurm.submit(request(&[], &["101"])).await.unwrap();

  let cancelled = slurm.cancel(&a).await.unwrap();
  assert_eq!(cancelled, vec![a, b, c]);

  let calls = runner.calls();
  let (program, args) = calls.last().unwrap();
  assert_eq!(program, "scancel");
  assert_eq!(args, &["100", "101", "102"]);
}

#[tokio::test]
async fn test_accounting_and_priority() {
  let (slurm, runner) = slurm(300);
  runner.reply(
    0,
    "1|COMPLETED|40|2024-03-01T10:00:00|2024-03-01T10:00:02|2024-03-01T10:00:09|0:0\n2|FAILED|40|2024-03-01T10:00:00|2024-03-01T10:00:02|2024-03-01T10:00:03|2:0\n",
  );
  let jobs = [JobHandle::new("1"), JobHandle::new("2")];
  let records = slurm.accounting(&jobs).await.unwrap();
  assert_eq!(records[&jobs[0]].state, JobState::Completed);
  assert_eq!(records[&jobs[1]].exit_code, Some(2));
  assert_eq!(records[&jobs[1]].priority, Some(40));

  slurm.set_priority(&jobs, 99).await.unwrap();
  let calls = runner.calls();
  assert_eq!(calls.len(), 3);
  assert_eq!(calls[1].1, ["update", "JobId=1", "Priority=99"]);
}
