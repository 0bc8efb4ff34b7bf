//! Workers: one per dispatch slot.
//!
//! A worker blocks only on its own task channel. Whatever happens while a
//! task runs (including a panic inside the backend), it answers with exactly
//! one [`WorkerMessage::Finished`].

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use sluice_container::{OutcomeKind, TaskOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::backend::Backends;
use crate::descriptor::TaskDescriptor;

/// Status of a dispatch slot as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
  Free,
  /// A task was sent but the worker has not picked it up yet.
  Staged,
  Working,
  /// The worker reported; the manager has not released the slot yet.
  Done,
}

/// A task sent to a worker.
#[derive(Debug)]
pub struct Dispatch {
  pub dispatch_id: u64,
  pub descriptor: TaskDescriptor,
  pub cancel: CancellationToken,
}

/// Messages from workers to the manager.
#[derive(Debug)]
pub enum WorkerMessage {
  Started {
    slot: usize,
    dispatch_id: u64,
  },
  Finished {
    slot: usize,
    dispatch_id: u64,
    outcome: TaskOutcome,
  },
}

pub struct Worker {
  slot: usize,
  backends: Backends,
  tasks: mpsc::Receiver<Dispatch>,
  reports: mpsc::UnboundedSender<WorkerMessage>,
}

impl Worker {
  /// Spawn a worker for `slot`. Returns the sender used to hand it tasks.
  pub fn spawn(
    slot: usize,
    backends: Backends,
    reports: mpsc::UnboundedSender<WorkerMessage>,
  ) -> (mpsc::Sender<Dispatch>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let worker = Self {
      slot,
      backends,
      tasks: rx,
      reports,
    };
    (tx, tokio::spawn(worker.run()))
  }

  async fn run(mut self) {
    debug!(slot = self.slot, "worker_started");
    while let Some(dispatch) = self.tasks.recv().await {
      let _ = self.reports.send(WorkerMessage::Started {
        slot: self.slot,
        dispatch_id: dispatch.dispatch_id,
      });
      let outcome = self.execute(&dispatch).await;
      if self
        .reports
        .send(WorkerMessage::Finished {
          slot: self.slot,
          dispatch_id: dispatch.dispatch_id,
          outcome,
        })
        .is_err()
      {
        break;
      }
    }
    debug!(slot = self.slot, "worker_stopped");
  }

  #[instrument(
    name = "worker_execute",
    skip(self, dispatch),
    fields(slot = self.slot, component = %dispatch.descriptor.run_component_id)
  )]
  async fn execute(&self, dispatch: &Dispatch) -> TaskOutcome {
    let task = &dispatch.descriptor;
    let started_at = Utc::now();
    let Some(backend) = self.backends.for_target(task.target) else {
      return TaskOutcome::without_return_code(
        &task.container.task_id,
        OutcomeKind::SubmissionFailure,
        started_at,
        "no batch scheduler is configured",
      );
    };

    info!(backend = backend.name(), "task_started");
    let run = backend.execute(task, &dispatch.cancel);
    match AssertUnwindSafe(run).catch_unwind().await {
      Ok(outcome) => {
        info!(kind = %outcome.kind, return_code = ?outcome.return_code, "task_finished");
        outcome
      }
      Err(panic) => {
        let message = panic_message(panic.as_ref());
        error!(panic = %message, "worker_panicked");
        TaskOutcome::without_return_code(
          &task.container.task_id,
          OutcomeKind::WorkerFailure,
          started_at,
          format!("worker panicked: {}", message),
        )
      }
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
