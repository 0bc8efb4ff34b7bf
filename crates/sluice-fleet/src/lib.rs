//! Sluice fleet
//!
//! Drives pipeline runs to completion: a single manager expands runs into
//! run trees, satisfies components from the result cache where it can and
//! hands the rest to a fixed pool of workers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Manager                             │
//! │  - owns the run queue, run trees and worker slots           │
//! │  - each tick: ingest → dispatch → reap → wind down          │
//! │  - idle ticks: sandbox janitor                              │
//! └─────────────────────────────────────────────────────────────┘
//!                  │ Dispatch                 ▲ WorkerMessage
//!                  ▼                          │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Worker (one per slot)                     │
//! │  - runs one task at a time, always reports exactly once     │
//! └─────────────────────────────────────────────────────────────┘
//!                  │
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//! ┌──────────────────┐  ┌──────────────────────────────────────┐
//! │ ContainerBackend │  │ SchedulerBackend                     │
//! │  local sandbox   │  │  batch job running `exec-task`       │
//! └──────────────────┘  └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sluice_fleet::{Backends, ContainerBackend, Manager, RunRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! let backends = Backends::local(Arc::new(ContainerBackend::new(runner)));
//! let manager = Manager::new(config.fleet, backends, ResultCache::new(), DatasetRegistry::new());
//! let handle = manager.handle();
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn(manager.start(cancel.clone()));
//!
//! let summary = handle.submit_run(RunRequest::new(pipeline, inputs))?.wait().await?;
//! ```

mod backend;
mod context;
mod descriptor;
mod error;
mod events;
mod janitor;
mod manager;
mod worker;

pub use backend::{Backends, ContainerBackend, ExecutionBackend, SchedulerBackend};
pub use descriptor::{Resources, Target, TaskDescriptor};
pub use error::FleetError;
pub use events::{ChannelNotifier, EventNotifier, FleetEvent, NoopNotifier};
pub use janitor::{SandboxJanitor, SweepReport};
pub use manager::{
  Manager, ManagerHandle, RunOutput, RunRequest, RunSummary, RunTicket, StepSummary,
};
pub use worker::{Dispatch, SlotStatus, Worker, WorkerMessage};
