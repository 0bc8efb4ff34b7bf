//! Container runner implementation.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use sluice_cache::hash_file;
use sluice_config::ContainerConfig;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::ContainerError;
use crate::invocation::{Invocation, Launch};
use crate::outcome::{OutcomeKind, OutputFile, TaskOutcome};
use crate::sandbox::{Sandbox, link_or_copy};
use crate::task::ContainerTask;

enum ProcessExit {
  Exited(Option<i32>),
  Cancelled,
}

/// How the driver (or the step that stopped a multi-step task) finished.
struct Exit {
  process: ProcessExit,
  failed_step: Option<usize>,
  stdout: PathBuf,
  stderr: PathBuf,
  message: Option<String>,
}

/// Builds sandboxes and runs drivers in them.
#[derive(Debug, Clone, Default)]
pub struct ContainerRunner {
  config: ContainerConfig,
}

impl ContainerRunner {
  pub fn new(config: ContainerConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &ContainerConfig {
    &self.config
  }

  /// Create the sandbox at `root`, verify input hashes and link inputs in.
  /// Nothing is linked if any input fails verification.
  #[instrument(name = "sandbox_prepare", skip(self, task, root), fields(task_id = %task.task_id))]
  pub fn prepare(&self, task: &ContainerTask, root: &Path) -> Result<Sandbox, ContainerError> {
    task.validate()?;

    for input in &task.inputs {
      if !input.source.is_file() {
        return Err(ContainerError::MissingInput {
          name: input.name.clone(),
          path: input.source.clone(),
        });
      }
      if let Some(expected) = &input.expected_hash {
        let actual = hash_file(&input.source)?;
        if &actual != expected {
          return Err(ContainerError::IntegrityFailure {
            name: input.name.clone(),
            expected: expected.clone(),
            actual,
          });
        }
      }
    }

    let sandbox = Sandbox::create(root)?;
    for input in &task.inputs {
      link_or_copy(&input.source, &sandbox.input_dir().join(&input.name))?;
    }
    Ok(sandbox)
  }

  /// Run the task's driver (or each internal step) in a prepared sandbox.
  pub async fn launch(
    &self,
    task: &ContainerTask,
    sandbox: &Sandbox,
    cancel: &CancellationToken,
  ) -> Result<TaskOutcome, ContainerError> {
    let started_at = Utc::now();
    let exit = if task.is_multi_step() {
      self.launch_steps(task, sandbox, cancel).await?
    } else {
      let input_names: Vec<String> = task.inputs.iter().map(|i| i.name.clone()).collect();
      let launch = Launch {
        image: &task.image,
        app: task.app.as_deref(),
        driver: &task.driver,
        args: &task.args,
        inputs: &input_names,
        outputs: &task.outputs,
      };
      let invocation = Invocation::build(&self.config, &launch, sandbox);
      let process = execute(
        &invocation,
        &sandbox.stdout_path(),
        &sandbox.stderr_path(),
        cancel,
      )
      .await?;
      Exit {
        process,
        failed_step: None,
        stdout: sandbox.stdout_path(),
        stderr: sandbox.stderr_path(),
        message: None,
      }
    };

    finish(task, sandbox, started_at, exit)
  }

  async fn launch_steps(
    &self,
    task: &ContainerTask,
    sandbox: &Sandbox,
    cancel: &CancellationToken,
  ) -> Result<Exit, ContainerError> {
    let mut available: HashMap<&str, PathBuf> = task
      .inputs
      .iter()
      .map(|i| (i.name.as_str(), sandbox.input_dir().join(&i.name)))
      .collect();
    let mut exit = Exit {
      process: ProcessExit::Exited(Some(0)),
      failed_step: None,
      stdout: sandbox.stdout_path(),
      stderr: sandbox.stderr_path(),
      message: None,
    };

    for (index, step) in task.steps.iter().enumerate() {
      let step_box = sandbox.step(index)?;
      for name in &step.inputs {
        let source = available
          .get(name.as_str())
          .ok_or_else(|| ContainerError::MissingInput {
            name: name.clone(),
            path: step_box.input_dir().join(name),
          })?;
        link_or_copy(source, &step_box.input_dir().join(name))?;
      }

      let launch = Launch {
        image: &task.image,
        app: None,
        driver: &step.driver,
        args: &[],
        inputs: &step.inputs,
        outputs: &step.outputs,
      };
      let invocation = Invocation::build(&self.config, &launch, &step_box);
      info!(task_id = %task.task_id, step = index + 1, driver = %step.driver, "internal_step_started");
      exit.process = execute(
        &invocation,
        &step_box.stdout_path(),
        &step_box.stderr_path(),
        cancel,
      )
      .await?;
      exit.stdout = step_box.stdout_path();
      exit.stderr = step_box.stderr_path();

      if !matches!(exit.process, ProcessExit::Exited(Some(0))) {
        exit.failed_step = Some(index);
        return Ok(exit);
      }
      for name in &step.outputs {
        available.insert(name.as_str(), step_box.output_dir().join(name));
      }
    }

    for name in &task.outputs {
      match available.get(name.as_str()).filter(|p| p.is_file()) {
        Some(source) => link_or_copy(source, &sandbox.output_dir().join(name))?,
        None => {
          exit.message = Some(format!("output '{}' was not produced", name));
          break;
        }
      }
    }
    Ok(exit)
  }

  /// Prepare and launch, then write `logs/outcome.json`.
  ///
  /// Failures attributable to the task (corrupt or missing inputs, a driver
  /// that cannot start) become outcomes; only sandbox-level I/O problems are
  /// errors.
  #[instrument(name = "container_run", skip(self, task, root, cancel), fields(task_id = %task.task_id))]
  pub async fn run(
    &self,
    task: &ContainerTask,
    root: &Path,
    cancel: &CancellationToken,
  ) -> Result<TaskOutcome, ContainerError> {
    let started_at = Utc::now();
    info!(image = %task.image.display(), driver = %task.driver, "task_started");

    let result = match self.prepare(task, root) {
      Ok(sandbox) => self.launch(task, &sandbox, cancel).await,
      Err(e) => Err(e),
    };

    let outcome = match result {
      Ok(outcome) => outcome,
      Err(e @ ContainerError::IntegrityFailure { .. }) => {
        error!(error = %e, "input_integrity_failure");
        TaskOutcome::without_return_code(
          &task.task_id,
          OutcomeKind::IntegrityFailure,
          started_at,
          e.to_string(),
        )
      }
      Err(e @ (ContainerError::MissingInput { .. } | ContainerError::Spawn { .. })) => {
        TaskOutcome::without_return_code(&task.task_id, OutcomeKind::Failed, started_at, e.to_string())
      }
      Err(e) => {
        error!(error = %e, "task_error");
        return Err(e);
      }
    };

    let sandbox = Sandbox::at(root);
    let logs = sandbox.logs_dir();
    std::fs::create_dir_all(&logs).map_err(|e| ContainerError::io(&logs, e))?;
    outcome.write(sandbox.outcome_path())?;

    match outcome.kind {
      OutcomeKind::Succeeded => info!(outputs = outcome.outputs.len(), "task_completed"),
      kind => error!(
        kind = %kind,
        return_code = ?outcome.return_code,
        message = ?outcome.message,
        "task_failed"
      ),
    }
    Ok(outcome)
  }
}

async fn execute(
  invocation: &Invocation,
  stdout: &Path,
  stderr: &Path,
  cancel: &CancellationToken,
) -> Result<ProcessExit, ContainerError> {
  if cancel.is_cancelled() {
    return Ok(ProcessExit::Cancelled);
  }

  let out = File::create(stdout).map_err(|e| ContainerError::io(stdout, e))?;
  let err = File::create(stderr).map_err(|e| ContainerError::io(stderr, e))?;
  let mut child = Command::new(&invocation.program)
    .args(&invocation.args)
    .current_dir(&invocation.cwd)
    .stdin(Stdio::null())
    .stdout(Stdio::from(out))
    .stderr(Stdio::from(err))
    .kill_on_drop(true)
    .spawn()
    .map_err(|source| ContainerError::Spawn {
      program: invocation.program.clone(),
      source,
    })?;

  tokio::select! {
    status = child.wait() => {
      let status = status.map_err(|e| ContainerError::io(&invocation.cwd, e))?;
      Ok(ProcessExit::Exited(status.code()))
    }
    _ = cancel.cancelled() => {
      if let Err(e) = child.kill().await {
        warn!(program = %invocation.program, error = %e, "kill_failed");
      }
      Ok(ProcessExit::Cancelled)
    }
  }
}

fn finish(
  task: &ContainerTask,
  sandbox: &Sandbox,
  started_at: DateTime<Utc>,
  exit: Exit,
) -> Result<TaskOutcome, ContainerError> {
  let mut outcome = TaskOutcome {
    task_id: task.task_id.clone(),
    kind: OutcomeKind::Failed,
    return_code: None,
    started_at,
    ended_at: Utc::now(),
    stdout: Some(exit.stdout),
    stderr: Some(exit.stderr),
    outputs: Vec::new(),
    failed_step: exit.failed_step,
    message: exit.message,
  };

  match exit.process {
    ProcessExit::Cancelled => {
      outcome.kind = OutcomeKind::Cancelled;
      return Ok(outcome);
    }
    ProcessExit::Exited(code) => outcome.return_code = code,
  }
  if outcome.return_code != Some(0) || outcome.message.is_some() {
    return Ok(outcome);
  }

  for name in &task.outputs {
    let path = sandbox.output_dir().join(name);
    if !path.is_file() {
      outcome.message = Some(format!("output '{}' was not produced", name));
      return Ok(outcome);
    }
    let size = std::fs::metadata(&path)
      .map_err(|e| ContainerError::io(&path, e))?
      .len();
    outcome.outputs.push(OutputFile {
      name: name.clone(),
      hash: hash_file(&path)?,
      path,
      size,
    });
  }

  outcome.kind = OutcomeKind::Succeeded;
  Ok(outcome)
}
