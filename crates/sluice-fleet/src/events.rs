//! Fleet events and notifiers for observability.
//!
//! Events are emitted by the manager as runs progress so consumers can
//! observe dispatch, reuse and completion without polling run trees.

use serde::{Deserialize, Serialize};
use sluice_cache::RecordId;
use sluice_container::OutcomeKind;
use sluice_run::{NodeId, RunId, RunState};
use tokio::sync::mpsc;

/// Events emitted while the manager drives runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
  /// A run was accepted from the queue and expanded.
  RunStarted { run_id: RunId, pipeline_id: String },

  /// A component was handed to a worker slot.
  ComponentDispatched {
    run_id: RunId,
    node: NodeId,
    name: String,
    slot: usize,
  },

  /// A component was satisfied from the result cache.
  ComponentReused {
    run_id: RunId,
    node: NodeId,
    name: String,
    record: RecordId,
  },

  /// A reused component is being re-executed to regenerate purged outputs.
  ComponentRecovering { run_id: RunId, node: NodeId },

  /// A component finished successfully.
  ComponentSucceeded { run_id: RunId, node: NodeId },

  /// A component failed.
  ComponentFailed {
    run_id: RunId,
    node: NodeId,
    kind: OutcomeKind,
    message: Option<String>,
  },

  /// A run reached a terminal state.
  RunFinished { run_id: RunId, state: RunState },
}

/// Trait for receiving fleet events.
///
/// The manager calls `notify` for each event; implementations decide what to
/// do with them.
pub trait EventNotifier: Send + Sync + 'static {
  fn notify(&self, event: FleetEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl EventNotifier for NoopNotifier {
  fn notify(&self, _event: FleetEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the control loop.
  sender: mpsc::UnboundedSender<FleetEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<FleetEvent>) -> Self {
    Self { sender }
  }
}

impl EventNotifier for ChannelNotifier {
  fn notify(&self, event: FleetEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
