use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("step {step} ('{name}'): {message}")]
  InvalidStep {
    step: usize,
    name: String,
    message: String,
  },

  #[error("step {step} cable {cable} references {reference}, which does not exist yet")]
  DanglingCable {
    step: usize,
    cable: usize,
    reference: String,
  },

  #[error("output cable '{name}': {message}")]
  InvalidOutput { name: String, message: String },

  #[error("method {method}: {message}")]
  InvalidMethod { method: String, message: String },

  #[error("failed to parse pipeline: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("failed to read pipeline file: {0}")]
  Io(#[from] std::io::Error),
}
