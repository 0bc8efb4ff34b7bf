//! Container runner tests using host isolation and `/bin/sh` drivers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sluice_cache::{hash_bytes, hash_file};
use sluice_config::{ContainerConfig, Isolation};
use sluice_container::{ContainerRunner, ContainerTask, OutcomeKind, TaskInput, TaskOutcome};
use sluice_pipeline::InternalStep;
use tokio_util::sync::CancellationToken;

fn host_runner() -> ContainerRunner {
  ContainerRunner::new(ContainerConfig {
    isolation: Isolation::Host,
    ..Default::default()
  })
}

/// Write an executable shell script.
fn script(dir: &Path, name: &str, body: &str) -> String {
  let path = dir.join(name);
  std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
  path.display().to_string()
}

fn task(driver: String, inputs: Vec<TaskInput>, outputs: &[&str]) -> ContainerTask {
  ContainerTask {
    task_id: "t1".to_string(),
    image: PathBuf::from("/images/unused.simg"),
    app: None,
    driver,
    args: Vec::new(),
    inputs,
    outputs: outputs.iter().map(|s| s.to_string()).collect(),
    steps: Vec::new(),
  }
}

fn input(dir: &Path, name: &str, content: &[u8]) -> TaskInput {
  let source = dir.join(format!("src_{}", name));
  std::fs::write(&source, content).expect("write input");
  TaskInput {
    name: name.to_string(),
    expected_hash: Some(hash_bytes(content)),
    source,
  }
}

#[tokio::test]
async fn test_driver_success_collects_outputs() {
  let dir = tempfile::tempdir().expect("temp dir");
  let driver = script(dir.path(), "sort.sh", "sort \"$1\" > \"$2\"\necho sorted >&2");
  let t = task(driver, vec![input(dir.path(), "raw", b"b\na\n")], &["sorted"]);
  let root = dir.path().join("sandbox");

  let outcome = host_runner()
    .run(&t, &root, &CancellationToken::new())
    .await
    .expect("run");

  assert_eq!(outcome.kind, OutcomeKind::Succeeded);
  assert_eq!(outcome.return_code, Some(0));
  assert_eq!(outcome.outputs.len(), 1);
  assert_eq!(outcome.outputs[0].hash, hash_bytes(b"a\nb\n"));
  assert_eq!(outcome.stderr_tail(5).as_deref(), Some("sorted"));

  let written = TaskOutcome::read(root.join("logs/outcome.json")).expect("outcome.json");
  assert_eq!(written, outcome);
}

#[tokio::test]
async fn test_nonzero_exit_is_failure_with_return_code() {
  let dir = tempfile::tempdir().expect("temp dir");
  let driver = script(dir.path(), "fail.sh", "echo boom >&2\nexit 7");
  let t = task(driver, Vec::new(), &["never"]);

  let outcome = host_runner()
    .run(&t, &dir.path().join("sandbox"), &CancellationToken::new())
    .await
    .expect("run");

  assert_eq!(outcome.kind, OutcomeKind::Failed);
  assert_eq!(outcome.return_code, Some(7));
  assert_eq!(outcome.stderr_tail(1).as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_hash_mismatch_never_launches() {
  let dir = tempfile::tempdir().expect("temp dir");
  let marker = dir.path().join("launched");
  let driver = script(
    dir.path(),
    "touch.sh",
    &format!("touch {}", marker.display()),
  );
  let mut raw = input(dir.path(), "raw", b"original");
  std::fs::write(&raw.source, b"tampered").expect("tamper");
  raw.expected_hash = Some(hash_bytes(b"original"));
  let t = task(driver, vec![raw], &["out"]);

  let outcome = host_runner()
    .run(&t, &dir.path().join("sandbox"), &CancellationToken::new())
    .await
    .expect("run");

  assert_eq!(outcome.kind, OutcomeKind::IntegrityFailure);
  assert_eq!(outcome.return_code, None);
  assert!(!marker.exists());
}

#[tokio::test]
async fn test_missing_output_is_failure() {
  let dir = tempfile::tempdir().expect("temp dir");
  let driver = script(dir.path(), "noop.sh", "exit 0");
  let t = task(driver, Vec::new(), &["expected"]);

  let outcome = host_runner()
    .run(&t, &dir.path().join("sandbox"), &CancellationToken::new())
    .await
    .expect("run");
  assert_eq!(outcome.kind, OutcomeKind::Failed);
  assert_eq!(outcome.return_code, Some(0));
  assert!(outcome.message.is_some());
}

#[tokio::test]
async fn test_cancel_kills_driver() {
  let dir = tempfile::tempdir().expect("temp dir");
  let driver = script(dir.path(), "slow.sh", "sleep 30");
  let t = task(driver, Vec::new(), &["out"]);
  let cancel = CancellationToken::new();

  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.cancel();
  });

  let outcome = tokio::time::timeout(
    Duration::from_secs(10),
    host_runner().run(&t, &dir.path().join("sandbox"), &cancel),
  )
  .await
  .expect("cancel should stop the driver")
  .expect("run");
  assert_eq!(outcome.kind, OutcomeKind::Cancelled);
}

#[tokio::test]
async fn test_multi_step_wires_outputs_to_next_step() {
  let dir = tempfile::tempdir().expect("temp dir");
  let upper = script(dir.path(), "upper.sh", "tr a-z A-Z < \"$1\" > \"$2\"");
  let rev = script(dir.path(), "rev.sh", "sort -r \"$1\" > \"$2\"");

  let mut t = task(String::new(), vec![input(dir.path(), "raw", b"a\nb\n")], &["final"]);
  t.steps = vec![
    InternalStep {
      driver: upper,
      inputs: vec!["raw".to_string()],
      outputs: vec!["upper".to_string()],
    },
    InternalStep {
      driver: rev,
      inputs: vec!["upper".to_string()],
      outputs: vec!["final".to_string()],
    },
  ];
  let root = dir.path().join("sandbox");

  let outcome = host_runner()
    .run(&t, &root, &CancellationToken::new())
    .await
    .expect("run");

  assert_eq!(outcome.kind, OutcomeKind::Succeeded);
  assert!(root.join("step_01/output/upper").is_file());
  assert!(root.join("step_02/input/upper").is_file());
  assert_eq!(
    hash_file(root.join("output/final")).expect("hash"),
    hash_bytes(b"B\nA\n")
  );
}

#[tokio::test]
async fn test_multi_step_stops_at_first_failure() {
  let dir = tempfile::tempdir().expect("temp dir");
  let fail = script(dir.path(), "fail.sh", "exit 4");
  let never = script(dir.path(), "never.sh", "touch \"$2\"");

  let mut t = task(String::new(), vec![input(dir.path(), "raw", b"x")], &["final"]);
  t.steps = vec![
    InternalStep {
      driver: fail,
      inputs: vec!["raw".to_string()],
      outputs: vec!["mid".to_string()],
    },
    InternalStep {
      driver: never,
      inputs: vec!["mid".to_string()],
      outputs: vec!["final".to_string()],
    },
  ];
  let root = dir.path().join("sandbox");

  let outcome = host_runner()
    .run(&t, &root, &CancellationToken::new())
    .await
    .expect("run");

  assert_eq!(outcome.kind, OutcomeKind::Failed);
  assert_eq!(outcome.return_code, Some(4));
  assert_eq!(outcome.failed_step, Some(0));
  assert!(!root.join("step_02").exists());
}
