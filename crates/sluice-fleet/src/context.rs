//! Per-run data that lives beside the run tree: which pipeline each (sub-)run
//! executes and which datasets flow along its cables.

use std::collections::HashMap;

use sluice_cache::DatasetId;
use sluice_container::TaskOutcome;
use sluice_pipeline::{CableSource, ComponentKey, Method, Pipeline, PipelineStep, Transformation};
use sluice_run::{NodeId, RunId, RunTree};
use tokio::sync::oneshot;

use crate::descriptor::Resources;
use crate::error::FleetError;
use crate::manager::RunSummary;

/// What a ready component needs in order to make progress.
pub(crate) enum Plan {
  /// Cables only forward a dataset. `delivered` marks an output cable of the
  /// top-level run, whose dataset is handed to the caller.
  Cable { dataset: DatasetId, delivered: bool },
  /// A step whose transformation is a pipeline opens its sub-run.
  SubRun { sub: NodeId, inputs: Vec<DatasetId> },
  Method {
    method: Box<Method>,
    inputs: Vec<DatasetId>,
  },
}

pub(crate) struct RunContext {
  run_id: RunId,
  pub(crate) pipeline_id: String,
  pub(crate) resources: Resources,
  /// Pipeline of every run node, the root and each sub-run.
  pipelines: HashMap<NodeId, Pipeline>,
  /// Run nodes: their inputs. Components: what they produced or forwarded.
  values: HashMap<NodeId, Vec<DatasetId>>,
  /// Step that produced (or reused) each dataset within this run.
  producers: HashMap<DatasetId, NodeId>,
  pub(crate) failures: HashMap<NodeId, TaskOutcome>,
  pub(crate) waiter: Option<oneshot::Sender<RunSummary>>,
}

impl RunContext {
  pub(crate) fn new(
    tree: &RunTree,
    pipeline: Pipeline,
    inputs: Vec<DatasetId>,
    resources: Resources,
  ) -> Result<Self, FleetError> {
    let run_id = tree.run_id();
    let mut pipelines: HashMap<NodeId, Pipeline> = HashMap::new();

    // Parents precede children in the arena, so each sub-run's enclosing
    // pipeline is already known when it is reached.
    for node in tree.nodes().iter().filter(|n| n.is_run()) {
      let Some(step) = node.parent else {
        pipelines.insert(node.id, pipeline.clone());
        continue;
      };
      let sub = tree
        .get(step)
        .ok()
        .and_then(|s| Some((s.parent?, s.component_key()?)))
        .and_then(|(outer, key)| match key {
          ComponentKey::Step { step } => pipelines.get(&outer)?.get_step(step),
          _ => None,
        })
        .and_then(|s| match &s.transformation {
          Transformation::Pipeline(sub) => Some(sub.as_ref().clone()),
          Transformation::Method(_) => None,
        })
        .ok_or_else(|| FleetError::Wiring {
          run_id,
          node: node.id,
          message: "sub-run has no pipeline".to_string(),
        })?;
      pipelines.insert(node.id, sub);
    }

    let mut values = HashMap::new();
    values.insert(tree.root(), inputs);

    Ok(Self {
      run_id,
      pipeline_id: pipeline.pipeline_id,
      resources,
      pipelines,
      values,
      producers: HashMap::new(),
      failures: HashMap::new(),
      waiter: None,
    })
  }

  fn wiring(&self, node: NodeId, message: impl Into<String>) -> FleetError {
    FleetError::Wiring {
      run_id: self.run_id,
      node,
      message: message.into(),
    }
  }

  pub(crate) fn pipeline_of(&self, run: NodeId) -> Option<&Pipeline> {
    self.pipelines.get(&run)
  }

  pub(crate) fn values(&self, node: NodeId) -> Option<&[DatasetId]> {
    self.values.get(&node).map(Vec::as_slice)
  }

  pub(crate) fn set_values(&mut self, node: NodeId, datasets: Vec<DatasetId>) {
    self.values.insert(node, datasets);
  }

  pub(crate) fn record_producer(&mut self, step: NodeId, datasets: &[DatasetId]) {
    for id in datasets {
      self.producers.insert(*id, step);
    }
  }

  pub(crate) fn producer(&self, dataset: DatasetId) -> Option<NodeId> {
    self.producers.get(&dataset).copied()
  }

  fn placement(&self, tree: &RunTree, node: NodeId) -> Result<(NodeId, ComponentKey), FleetError> {
    let n = tree.get(node)?;
    match (n.parent, n.component_key()) {
      (Some(run), Some(key)) => Ok((run, key)),
      _ => Err(self.wiring(node, "not a component")),
    }
  }

  pub(crate) fn step_def(&self, tree: &RunTree, node: NodeId) -> Result<&PipelineStep, FleetError> {
    let (run, key) = self.placement(tree, node)?;
    let ComponentKey::Step { step } = key else {
      return Err(self.wiring(node, "not a step"));
    };
    self
      .pipeline_of(run)
      .and_then(|p| p.get_step(step))
      .ok_or_else(|| self.wiring(node, format!("run {} has no step {}", run, step)))
  }

  fn resolve(
    &self,
    tree: &RunTree,
    run: NodeId,
    node: NodeId,
    source: &CableSource,
  ) -> Result<DatasetId, FleetError> {
    let found = match *source {
      CableSource::PipelineInput { index } => self.values(run).and_then(|v| v.get(index)),
      CableSource::StepOutput { step, output } => tree
        .component(run, ComponentKey::Step { step })
        .and_then(|producer| self.values(producer))
        .and_then(|v| v.get(output)),
    };
    found
      .copied()
      .ok_or_else(|| self.wiring(node, "source has no dataset yet"))
  }

  /// Dataset carried by an input or output cable.
  pub(crate) fn cable_dataset(&self, tree: &RunTree, node: NodeId) -> Result<DatasetId, FleetError> {
    let (run, key) = self.placement(tree, node)?;
    let pipeline = self
      .pipeline_of(run)
      .ok_or_else(|| self.wiring(node, "run has no pipeline"))?;
    let source = match key {
      ComponentKey::InputCable { step, cable } => pipeline
        .get_step(step)
        .and_then(|s| s.cables.get(cable))
        .map(|c| &c.source),
      ComponentKey::OutputCable { output } => pipeline.outputs.get(output).map(|o| &o.source),
      ComponentKey::Step { .. } => None,
    }
    .ok_or_else(|| self.wiring(node, "not a cable"))?;
    self.resolve(tree, run, node, source)
  }

  /// Datasets feeding a step, ordered by input position.
  pub(crate) fn step_inputs(&self, tree: &RunTree, node: NodeId) -> Result<Vec<DatasetId>, FleetError> {
    let (run, key) = self.placement(tree, node)?;
    let ComponentKey::Step { step } = key else {
      return Err(self.wiring(node, "not a step"));
    };
    let def = self.step_def(tree, node)?;
    (0..def.transformation.input_count())
      .map(|dest| {
        let cable = def
          .cables
          .iter()
          .position(|c| c.dest == dest)
          .ok_or_else(|| self.wiring(node, format!("input {} is not wired", dest)))?;
        tree
          .component(run, ComponentKey::InputCable { step, cable })
          .and_then(|c| self.values(c))
          .and_then(|v| v.first())
          .copied()
          .ok_or_else(|| self.wiring(node, format!("input {} has no dataset yet", dest)))
      })
      .collect()
  }

  /// Datasets leaving a run through its output cables, in output order.
  pub(crate) fn run_outputs(&self, tree: &RunTree, run: NodeId) -> Result<Vec<DatasetId>, FleetError> {
    let count = self.pipeline_of(run).map_or(0, |p| p.outputs.len());
    (0..count)
      .map(|output| {
        tree
          .component(run, ComponentKey::OutputCable { output })
          .and_then(|c| self.values(c))
          .and_then(|v| v.first())
          .copied()
          .ok_or_else(|| self.wiring(run, format!("output {} has no dataset", output)))
      })
      .collect()
  }

  /// Decide how a ready component proceeds.
  pub(crate) fn plan(&self, tree: &RunTree, node: NodeId) -> Result<Plan, FleetError> {
    let (run, key) = self.placement(tree, node)?;
    match key {
      ComponentKey::InputCable { .. } | ComponentKey::OutputCable { .. } => Ok(Plan::Cable {
        dataset: self.cable_dataset(tree, node)?,
        delivered: run == tree.root() && matches!(key, ComponentKey::OutputCable { .. }),
      }),
      ComponentKey::Step { .. } => {
        let inputs = self.step_inputs(tree, node)?;
        match &self.step_def(tree, node)?.transformation {
          Transformation::Method(method) => Ok(Plan::Method {
            method: Box::new(method.clone()),
            inputs,
          }),
          Transformation::Pipeline(_) => {
            let sub = tree
              .sub_run(node)
              .ok_or_else(|| self.wiring(node, "step has no sub-run"))?;
            Ok(Plan::SubRun { sub, inputs })
          }
        }
      }
    }
  }
}

/// `outer/inner` style name of a node, built from its component ancestors.
pub(crate) fn qualified_name(tree: &RunTree, node: NodeId) -> String {
  let mut parts = Vec::new();
  let mut next = Some(node);
  while let Some(id) = next {
    let Ok(n) = tree.get(id) else { break };
    if !n.is_run() {
      parts.push(n.name.clone());
    }
    next = n.parent;
  }
  parts.reverse();
  parts.join("/")
}
