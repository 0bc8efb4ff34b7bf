//! Sluice Scheduler
//!
//! Clients for external batch schedulers. Cluster-targeted tasks are
//! submitted as jobs, polled until they stop, and cancelled cooperatively.
//!
//! # Architecture
//!
//! ```text
//! BatchScheduler (trait)
//! ├── SlurmScheduler  - sbatch / sacct / scancel / scontrol via a CommandRunner
//! └── LocalScheduler  - child processes on this host
//!
//! submit(request { after_ok, after_any, .. }) -> JobHandle
//! get_state(job) -> Pending | ResourceWait | Running | Completed | Failed | Cancelled | Unknown
//! cancel(job)    -> job + every registered dependent
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sluice_scheduler::{BatchScheduler, SlurmScheduler, SubmitRequest};
//!
//! let slurm = SlurmScheduler::new(config.scheduler.clone());
//! slurm.is_alive().await?;
//! let job = slurm.submit(request).await?;
//! while !slurm.get_state(&job).await?.is_stopped() {
//!     tokio::time::sleep(poll).await;
//! }
//! ```

mod command;
mod error;
mod local;
mod scheduler;
mod slurm;
mod types;

use std::sync::Arc;

use sluice_config::{SchedulerConfig, SchedulerKind};

pub use command::{CommandOutput, CommandRunner, ProcessRunner};
pub use error::SchedulerError;
pub use local::LocalScheduler;
pub use scheduler::BatchScheduler;
pub use slurm::SlurmScheduler;
pub use types::{AccountingRecord, JobHandle, JobState, SubmitRequest};

/// Build the scheduler client selected by configuration, if any.
pub fn from_config(config: &SchedulerConfig, local_jobs: usize) -> Option<Arc<dyn BatchScheduler>> {
  match config.kind {
    SchedulerKind::None => None,
    SchedulerKind::Local => Some(Arc::new(LocalScheduler::new(local_jobs))),
    SchedulerKind::Slurm => Some(Arc::new(SlurmScheduler::new(config.clone()))),
  }
}
