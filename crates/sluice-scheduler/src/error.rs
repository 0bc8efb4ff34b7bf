use thiserror::Error;

use crate::types::JobHandle;

/// Errors that can occur while talking to a batch scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
  /// A scheduler command kept failing after every retry.
  #[error("'{program}' failed after {attempts} attempt(s): {message}")]
  CommandFailed {
    program: String,
    attempts: u32,
    message: String,
  },

  /// A scheduler command succeeded but its output made no sense.
  #[error("unexpected output from '{program}': {message}")]
  Parse { program: String, message: String },

  #[error("unknown job {job}")]
  UnknownJob { job: JobHandle },

  /// The scheduler cannot be reached at all.
  #[error("scheduler unreachable: {message}")]
  Unreachable { message: String },

  #[error("failed to launch job {job}: {source}")]
  Launch {
    job: JobHandle,
    #[source]
    source: std::io::Error,
  },
}
