//! Sluice Run
//!
//! The run/component state machine. A [`RunTree`] is an arena holding one
//! top-level run, its components (input cables, steps, output cables) and the
//! sub-runs of steps whose transformation is itself a pipeline. Every node
//! keeps an explicit parent index, so upward recursion is a walk over the
//! arena.
//!
//! ```text
//! Run (root)
//! ├── sort:in0      InputCable
//! ├── sort          Step
//! ├── nested        Step
//! │   └── Run       sub-run
//! │       ├── ...
//! └── counts        OutputCable
//! ```
//!
//! Transitions (`start`, `cancel`, `stop`, `mark_failure`, `begin_recovery`,
//! `finish_recovery`) are journaled. Trees live in a [`RunBook`]; all
//! mutation happens inside [`RunBook::transact`].

mod book;
mod error;
mod state;
mod tree;

pub use book::RunBook;
pub use error::TransitionError;
pub use state::RunState;
pub use tree::{Node, NodeId, NodeKind, RunId, RunTree, TransitionOp, TransitionRecord};
