use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_cache::{ExecLog, RecordId};
use sluice_pipeline::{ComponentKey, Pipeline, Transformation};
use tracing::debug;
use uuid::Uuid;

use crate::error::TransitionError;
use crate::state::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for RunId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// Index of a node in its [`RunTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "n{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeKind {
  /// The top-level run or a sub-run owned by a step.
  Run { pipeline_id: String },
  Component { key: ComponentKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOp {
  Start,
  Cancel,
  Stop,
  MarkFailure,
  BeginRecovery,
  FinishRecovery,
}

impl fmt::Display for TransitionOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TransitionOp::Start => "start",
      TransitionOp::Cancel => "cancel",
      TransitionOp::Stop => "stop",
      TransitionOp::MarkFailure => "mark_failure",
      TransitionOp::BeginRecovery => "begin_recovery",
      TransitionOp::FinishRecovery => "finish_recovery",
    };
    f.write_str(s)
  }
}

/// One accepted call to a transition entry point. No-op calls are recorded
/// with `from == to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
  pub node: NodeId,
  pub op: TransitionOp,
  pub from: RunState,
  pub to: RunState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  pub id: NodeId,
  pub kind: NodeKind,
  pub name: String,
  pub parent: Option<NodeId>,
  pub children: Vec<NodeId>,
  /// Sibling components that must succeed before this one may start.
  pub depends_on: Vec<NodeId>,
  pub state: RunState,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
  pub reused: Option<RecordId>,
  pub log: Option<ExecLog>,
  /// Attempts that regenerated purged outputs. Kept apart from `log` so a
  /// reused component never gains a log of its own.
  pub recovery_logs: Vec<ExecLog>,
}

impl Node {
  pub fn is_run(&self) -> bool {
    matches!(self.kind, NodeKind::Run { .. })
  }

  pub fn component_key(&self) -> Option<ComponentKey> {
    match self.kind {
      NodeKind::Component { key } => Some(key),
      NodeKind::Run { .. } => None,
    }
  }
}

/// Arena holding a run, its components and any nested sub-runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTree {
  run_id: RunId,
  nodes: Vec<Node>,
  journal: Vec<TransitionRecord>,
}

impl RunTree {
  /// Expand a pipeline into a pending run tree. Steps whose transformation
  /// is a pipeline own a sub-run, expanded recursively.
  pub fn new(run_id: RunId, pipeline: &Pipeline) -> Self {
    let mut tree = Self {
      run_id,
      nodes: Vec::new(),
      journal: Vec::new(),
    };
    let root = tree.push(
      NodeKind::Run {
        pipeline_id: pipeline.pipeline_id.clone(),
      },
      pipeline.name.clone(),
      None,
      Vec::new(),
    );
    tree.expand(root, pipeline);
    tree
  }

  fn expand(&mut self, run: NodeId, pipeline: &Pipeline) {
    let graph = pipeline.graph();
    let mut ids: HashMap<ComponentKey, NodeId> = HashMap::new();

    for key in graph.topological_order() {
      let depends_on = graph
        .upstream(key)
        .iter()
        .filter_map(|k| ids.get(k))
        .copied()
        .collect();
      let id = self.push(
        NodeKind::Component { key },
        component_name(pipeline, key),
        Some(run),
        depends_on,
      );
      ids.insert(key, id);

      if let ComponentKey::Step { step } = key
        && let Some(Transformation::Pipeline(sub)) =
          pipeline.get_step(step).map(|s| &s.transformation)
      {
        let sub_run = self.push(
          NodeKind::Run {
            pipeline_id: sub.pipeline_id.clone(),
          },
          sub.name.clone(),
          Some(id),
          Vec::new(),
        );
        self.expand(sub_run, sub);
      }
    }
  }

  fn push(
    &mut self,
    kind: NodeKind,
    name: String,
    parent: Option<NodeId>,
    depends_on: Vec<NodeId>,
  ) -> NodeId {
    let id = NodeId(self.nodes.len());
    self.nodes.push(Node {
      id,
      kind,
      name,
      parent,
      children: Vec::new(),
      depends_on,
      state: RunState::Pending,
      started_at: None,
      ended_at: None,
      reused: None,
      log: None,
      recovery_logs: Vec::new(),
    });
    if let Some(parent) = parent {
      self.nodes[parent.0].children.push(id);
    }
    id
  }

  pub fn run_id(&self) -> RunId {
    self.run_id
  }

  /// The top-level run node.
  pub fn root(&self) -> NodeId {
    NodeId(0)
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn journal(&self) -> &[TransitionRecord] {
    &self.journal
  }

  pub fn get(&self, id: NodeId) -> Result<&Node, TransitionError> {
    self
      .nodes
      .get(id.0)
      .ok_or(TransitionError::UnknownNode { node: id })
  }

  fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, TransitionError> {
    self
      .nodes
      .get_mut(id.0)
      .ok_or(TransitionError::UnknownNode { node: id })
  }

  pub fn state(&self, id: NodeId) -> Result<RunState, TransitionError> {
    Ok(self.get(id)?.state)
  }

  /// The sub-run owned by a step, if its transformation is a pipeline.
  pub fn sub_run(&self, step: NodeId) -> Option<NodeId> {
    let node = self.nodes.get(step.0)?;
    node
      .children
      .iter()
      .copied()
      .find(|c| self.nodes.get(c.0).is_some_and(Node::is_run))
  }

  /// Component of `run` for a pipeline key.
  pub fn component(&self, run: NodeId, key: ComponentKey) -> Option<NodeId> {
    let node = self.nodes.get(run.0)?;
    node
      .children
      .iter()
      .copied()
      .find(|c| self.nodes.get(c.0).and_then(Node::component_key) == Some(key))
  }

  /// All nodes below `id`, depth first.
  pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = self
      .nodes
      .get(id.0)
      .map(|n| n.children.iter().rev().copied().collect())
      .unwrap_or_default();
    while let Some(next) = stack.pop() {
      out.push(next);
      if let Some(node) = self.nodes.get(next.0) {
        stack.extend(node.children.iter().rev().copied());
      }
    }
    out
  }

  fn record(&mut self, node: NodeId, op: TransitionOp, from: RunState, to: RunState) {
    debug!(
      run_id = %self.run_id,
      node = %node,
      op = %op,
      from = %from,
      to = %to,
      "state_transition"
    );
    self.journal.push(TransitionRecord { node, op, from, to });
  }

  fn set_state(
    &mut self,
    id: NodeId,
    op: TransitionOp,
    to: RunState,
  ) -> Result<RunState, TransitionError> {
    let node = self.get_mut(id)?;
    let from = node.state;
    node.state = to;
    match op {
      TransitionOp::Start => node.started_at = Some(Utc::now()),
      TransitionOp::BeginRecovery if from != to => node.ended_at = None,
      _ if to.is_terminal() && from != to => node.ended_at = Some(Utc::now()),
      _ => {}
    }
    self.record(id, op, from, to);
    Ok(from)
  }

  fn invalid(&self, node: NodeId, op: TransitionOp) -> TransitionError {
    TransitionError::InvalidTransition {
      node,
      op,
      from: self.nodes.get(node.0).map(|n| n.state).unwrap_or_default(),
    }
  }

  /// Pending → Running.
  pub fn start(&mut self, id: NodeId) -> Result<(), TransitionError> {
    match self.state(id)? {
      RunState::Pending => {
        self.set_state(id, TransitionOp::Start, RunState::Running)?;
        Ok(())
      }
      _ => Err(self.invalid(id, TransitionOp::Start)),
    }
  }

  /// Pending or Running → Cancelling. Repeating it while Cancelling is a
  /// no-op.
  pub fn cancel(&mut self, id: NodeId) -> Result<(), TransitionError> {
    let to = match self.state(id)? {
      RunState::Pending | RunState::Running => RunState::Cancelling,
      RunState::Cancelling => RunState::Cancelling,
      _ => return Err(self.invalid(id, TransitionOp::Cancel)),
    };
    self.set_state(id, TransitionOp::Cancel, to)?;
    Ok(())
  }

  /// Cancel every Pending or Running node below `id`. Returns the nodes
  /// that moved to Cancelling.
  pub fn cancel_descendants(&mut self, id: NodeId) -> Result<Vec<NodeId>, TransitionError> {
    let mut cancelled = Vec::new();
    for node in self.descendants(id) {
      if matches!(self.state(node)?, RunState::Pending | RunState::Running) {
        self.cancel(node)?;
        cancelled.push(node);
      }
    }
    Ok(cancelled)
  }

  /// Cancel a run and all its active descendants.
  pub fn cancel_tree(&mut self, id: NodeId) -> Result<Vec<NodeId>, TransitionError> {
    self.cancel(id)?;
    self.cancel_descendants(id)
  }

  /// The only way into a terminal state: Running → Successful,
  /// Cancelling → Cancelled, Failing → Failed.
  pub fn stop(&mut self, id: NodeId) -> Result<RunState, TransitionError> {
    let to = match self.state(id)? {
      RunState::Running => RunState::Successful,
      RunState::Cancelling => RunState::Cancelled,
      RunState::Failing => RunState::Failed,
      _ => return Err(self.invalid(id, TransitionOp::Stop)),
    };
    self.set_state(id, TransitionOp::Stop, to)?;
    Ok(to)
  }

  /// Running → Failing. Failing and Cancelling are left as they are. With
  /// `recurse_upward`, the parent is marked too; a missing parent ends the
  /// recursion.
  pub fn mark_failure(&mut self, id: NodeId, recurse_upward: bool) -> Result<(), TransitionError> {
    let to = match self.state(id)? {
      RunState::Running => RunState::Failing,
      s @ (RunState::Failing | RunState::Cancelling) => s,
      _ => return Err(self.invalid(id, TransitionOp::MarkFailure)),
    };
    self.set_state(id, TransitionOp::MarkFailure, to)?;

    if recurse_upward && let Some(parent) = self.get(id)?.parent {
      self.mark_failure(parent, true)?;
    }
    Ok(())
  }

  /// Successful → Running so purged outputs can be regenerated. Nodes that
  /// are already active are left as they are.
  pub fn begin_recovery(&mut self, id: NodeId, recurse_upward: bool) -> Result<(), TransitionError> {
    let to = match self.state(id)? {
      RunState::Successful => RunState::Running,
      s @ (RunState::Running | RunState::Failing | RunState::Cancelling) => s,
      _ => return Err(self.invalid(id, TransitionOp::BeginRecovery)),
    };
    self.set_state(id, TransitionOp::BeginRecovery, to)?;

    if recurse_upward && let Some(parent) = self.get(id)?.parent {
      self.begin_recovery(parent, true)?;
    }
    Ok(())
  }

  /// Settle a recovering node: Running → Successful, Failing → Failed,
  /// Cancelling → Cancelled. A node with active children stays as it is and
  /// the recursion stops there.
  pub fn finish_recovery(
    &mut self,
    id: NodeId,
    recurse_upward: bool,
  ) -> Result<(), TransitionError> {
    let from = self.state(id)?;
    if from == RunState::Pending {
      return Err(self.invalid(id, TransitionOp::FinishRecovery));
    }

    let node = self.get(id)?;
    let waiting = node
      .children
      .iter()
      .any(|c| self.nodes.get(c.0).is_some_and(|n| n.state.is_active()));
    if waiting {
      self.record(id, TransitionOp::FinishRecovery, from, from);
      return Ok(());
    }

    let to = match from {
      RunState::Running => RunState::Successful,
      RunState::Failing => RunState::Failed,
      RunState::Cancelling => RunState::Cancelled,
      terminal => terminal,
    };
    self.set_state(id, TransitionOp::FinishRecovery, to)?;

    if recurse_upward && let Some(parent) = self.get(id)?.parent {
      self.finish_recovery(parent, true)?;
    }
    Ok(())
  }

  /// Point a component at an existing record instead of executing it.
  pub fn attach_reuse(&mut self, id: NodeId, record: RecordId) -> Result<(), TransitionError> {
    let node = self.get_mut(id)?;
    if node.log.is_some() {
      return Err(TransitionError::Completion {
        node: id,
        message: "already executed; cannot also reuse a record".to_string(),
      });
    }
    node.reused = Some(record);
    Ok(())
  }

  /// Attach the log of the component's own execution.
  pub fn attach_log(&mut self, id: NodeId, log: ExecLog) -> Result<(), TransitionError> {
    let node = self.get_mut(id)?;
    if node.reused.is_some() {
      return Err(TransitionError::Completion {
        node: id,
        message: "reused a record; cannot also carry an execution log".to_string(),
      });
    }
    node.log = Some(log);
    Ok(())
  }

  pub fn record_recovery_log(&mut self, id: NodeId, log: ExecLog) -> Result<(), TransitionError> {
    self.get_mut(id)?.recovery_logs.push(log);
    Ok(())
  }

  /// Pending components inside a Running run whose dependencies have all
  /// succeeded, in dispatch order.
  pub fn ready_components(&self) -> Vec<NodeId> {
    self
      .nodes
      .iter()
      .filter(|n| !n.is_run() && n.state == RunState::Pending)
      .filter(|n| {
        n.parent
          .and_then(|p| self.nodes.get(p.0))
          .is_some_and(|run| run.state == RunState::Running)
      })
      .filter(|n| {
        n.depends_on
          .iter()
          .all(|d| self.nodes.get(d.0).is_some_and(|dep| dep.state == RunState::Successful))
      })
      .map(|n| n.id)
      .collect()
  }

  /// The earliest-started leaf component below `id` that failed.
  pub fn first_failure(&self, id: NodeId) -> Option<NodeId> {
    self
      .descendants(id)
      .into_iter()
      .filter_map(|d| self.nodes.get(d.0))
      .filter(|n| !n.is_run() && n.children.is_empty())
      .filter(|n| matches!(n.state, RunState::Failing | RunState::Failed))
      .min_by_key(|n| (n.started_at, n.id))
      .map(|n| n.id)
  }
}

fn component_name(pipeline: &Pipeline, key: ComponentKey) -> String {
  let step_name = |step: usize| {
    pipeline
      .get_step(step)
      .map(|s| s.name.clone())
      .unwrap_or_else(|| format!("step{}", step))
  };
  match key {
    ComponentKey::Step { step } => step_name(step),
    ComponentKey::InputCable { step, cable } => format!("{}:in{}", step_name(step), cable),
    ComponentKey::OutputCable { output } => pipeline
      .outputs
      .get(output)
      .map(|o| o.name.clone())
      .unwrap_or_else(|| format!("output{}", output)),
  }
}
