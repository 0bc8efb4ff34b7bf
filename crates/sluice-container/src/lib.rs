//! Sluice Container
//!
//! Runs one task in an isolated sandbox.
//!
//! # Architecture
//!
//! ```text
//! ContainerRunner
//! ├── prepare(task, root) -> Sandbox   - input/ output/ logs/, hash check, hard links
//! ├── launch(task, sandbox, cancel)    - driver, or each internal step in step_NN/
//! └── run(task, root, cancel)          - prepare + launch + logs/outcome.json
//! ```
//!
//! Drivers run under Singularity/Apptainer with the sandbox `input/` and
//! `output/` directories bind-mounted at fixed paths, or directly on the host
//! when isolation is disabled.
//!
//! # Usage
//!
//! ```ignore
//! use sluice_container::{ContainerRunner, ContainerTask};
//!
//! let runner = ContainerRunner::new(config.container.clone());
//! let outcome = runner.run(&task, &sandbox_root, &cancel).await?;
//! println!("{} (rc {:?})", outcome.kind, outcome.return_code);
//! ```

mod error;
mod invocation;
mod outcome;
mod runner;
mod sandbox;
mod task;

pub use error::ContainerError;
pub use invocation::Invocation;
pub use outcome::{OutcomeKind, OutputFile, TaskOutcome};
pub use runner::ContainerRunner;
pub use sandbox::{OUTCOME_FILE, Sandbox, TASK_FILE, link_or_copy};
pub use task::{ContainerTask, TaskInput};
