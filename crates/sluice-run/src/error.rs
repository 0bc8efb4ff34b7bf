use crate::state::RunState;
use crate::tree::{NodeId, RunId, TransitionOp};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
  #[error("cannot {op} node {node} from state {from}")]
  InvalidTransition {
    node: NodeId,
    op: TransitionOp,
    from: RunState,
  },

  #[error("node {node} does not exist")]
  UnknownNode { node: NodeId },

  #[error("run {run_id} is not registered")]
  UnknownRun { run_id: RunId },

  /// A component may reuse a record or carry its own log, never both.
  #[error("node {node}: {message}")]
  Completion { node: NodeId, message: String },
}
