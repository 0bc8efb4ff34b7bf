use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::{CableSource, Pipeline};

/// One schedulable unit within a single pipeline level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentKey {
  InputCable { step: usize, cable: usize },
  Step { step: usize },
  OutputCable { output: usize },
}

impl fmt::Display for ComponentKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ComponentKey::InputCable { step, cable } => write!(f, "step{}.cable{}", step, cable),
      ComponentKey::Step { step } => write!(f, "step{}", step),
      ComponentKey::OutputCable { output } => write!(f, "output{}", output),
    }
  }
}

/// Dependency graph of one pipeline level.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Components in declaration order.
  nodes: Vec<ComponentKey>,
  /// Adjacency list: component -> components that consume it.
  adjacency: HashMap<ComponentKey, Vec<ComponentKey>>,
  /// Reverse adjacency: component -> components it waits on.
  reverse_adjacency: HashMap<ComponentKey, Vec<ComponentKey>>,
  /// Components with no incoming edges.
  entry_points: Vec<ComponentKey>,
}

impl Graph {
  /// Build the cable -> step -> cable graph of a pipeline.
  pub fn new(pipeline: &Pipeline) -> Self {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for (step_idx, step) in pipeline.steps.iter().enumerate() {
      let step_key = ComponentKey::Step { step: step_idx };
      for (cable_idx, cable) in step.cables.iter().enumerate() {
        let cable_key = ComponentKey::InputCable {
          step: step_idx,
          cable: cable_idx,
        };
        nodes.push(cable_key);
        if let CableSource::StepOutput { step: producer, .. } = cable.source {
          edges.push((ComponentKey::Step { step: producer }, cable_key));
        }
        edges.push((cable_key, step_key));
      }
      nodes.push(step_key);
    }

    for (output_idx, output) in pipeline.outputs.iter().enumerate() {
      let key = ComponentKey::OutputCable { output: output_idx };
      nodes.push(key);
      if let CableSource::StepOutput { step, .. } = output.source {
        edges.push((ComponentKey::Step { step }, key));
      }
    }

    let mut adjacency: HashMap<ComponentKey, Vec<ComponentKey>> = HashMap::new();
    let mut reverse_adjacency: HashMap<ComponentKey, Vec<ComponentKey>> = HashMap::new();

    for key in &nodes {
      adjacency.entry(*key).or_default();
      reverse_adjacency.entry(*key).or_default();
    }

    for (from, to) in edges {
      adjacency.entry(from).or_default().push(to);
      reverse_adjacency.entry(to).or_default().push(from);
    }

    let entry_points = nodes
      .iter()
      .filter(|key| reverse_adjacency.get(*key).is_none_or(|v| v.is_empty()))
      .copied()
      .collect();

    Self {
      nodes,
      adjacency,
      reverse_adjacency,
      entry_points,
    }
  }

  /// All components in declaration order.
  pub fn nodes(&self) -> &[ComponentKey] {
    &self.nodes
  }

  /// Get entry points (components with no incoming edges).
  pub fn entry_points(&self) -> &[ComponentKey] {
    &self.entry_points
  }

  /// Get the components that consume a given component.
  pub fn downstream(&self, key: ComponentKey) -> &[ComponentKey] {
    self
      .adjacency
      .get(&key)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get the components a given component waits on.
  pub fn upstream(&self, key: ComponentKey) -> &[ComponentKey] {
    self
      .reverse_adjacency
      .get(&key)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Components in dependency order. Ties resolve in declaration order, so
  /// the result is stable across calls.
  pub fn topological_order(&self) -> Vec<ComponentKey> {
    let mut remaining: HashMap<ComponentKey, usize> = self
      .nodes
      .iter()
      .map(|key| (*key, self.upstream(*key).len()))
      .collect();
    let position: HashMap<ComponentKey, usize> =
      self.nodes.iter().enumerate().map(|(i, k)| (*k, i)).collect();

    let mut ready: VecDeque<ComponentKey> = self.entry_points.iter().copied().collect();
    let mut order = Vec::with_capacity(self.nodes.len());

    while let Some(key) = ready.pop_front() {
      order.push(key);
      let mut unlocked = Vec::new();
      for next in self.downstream(key) {
        if let Some(count) = remaining.get_mut(next) {
          *count -= 1;
          if *count == 0 {
            unlocked.push(*next);
          }
        }
      }
      unlocked.sort_by_key(|k| position.get(k).copied().unwrap_or(usize::MAX));
      ready.extend(unlocked);
    }

    order
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::method::{ImageRef, Method, MethodId, Reusability};
  use crate::pipeline::{InputCable, OutputCable, PipelineStep, Transformation};
  use std::path::PathBuf;

  fn method(family: &str, inputs: usize) -> Method {
    Method {
      id: MethodId::new(family, 1),
      driver: "run.sh".to_string(),
      image: ImageRef {
        path: PathBuf::from("/images/x.simg"),
        app: None,
        steps: Vec::new(),
      },
      inputs: (0..inputs).map(|i| format!("in{}", i)).collect(),
      outputs: vec!["out".to_string()],
      threads: 1,
      memory_mb: 0,
      reusable: Reusability::Deterministic,
    }
  }

  /// Two independent steps joined by a third.
  fn diamond() -> Pipeline {
    let from_input = |dest| InputCable {
      source: CableSource::PipelineInput { index: 0 },
      dest,
    };
    Pipeline {
      pipeline_id: "diamond".to_string(),
      name: "diamond".to_string(),
      inputs: vec!["data".to_string()],
      steps: vec![
        PipelineStep {
          name: "left".to_string(),
          transformation: Transformation::Method(method("left", 1)),
          cables: vec![from_input(0)],
        },
        PipelineStep {
          name: "right".to_string(),
          transformation: Transformation::Method(method("right", 1)),
          cables: vec![from_input(0)],
        },
        PipelineStep {
          name: "join".to_string(),
          transformation: Transformation::Method(method("join", 2)),
          cables: vec![
            InputCable {
              source: CableSource::StepOutput { step: 0, output: 0 },
              dest: 0,
            },
            InputCable {
              source: CableSource::StepOutput { step: 1, output: 0 },
              dest: 1,
            },
          ],
        },
      ],
      outputs: vec![OutputCable {
        name: "joined".to_string(),
        source: CableSource::StepOutput { step: 2, output: 0 },
      }],
    }
  }

  #[test]
  fn test_entry_points_are_input_fed_cables() {
    let graph = diamond().graph();
    assert_eq!(
      graph.entry_points(),
      &[
        ComponentKey::InputCable { step: 0, cable: 0 },
        ComponentKey::InputCable { step: 1, cable: 0 },
      ]
    );
  }

  #[test]
  fn test_upstream_of_join() {
    let graph = diamond().graph();
    let upstream = graph.upstream(ComponentKey::Step { step: 2 });
    assert_eq!(upstream.len(), 2);
    assert_eq!(
      graph.upstream(ComponentKey::InputCable { step: 2, cable: 1 }),
      &[ComponentKey::Step { step: 1 }]
    );
  }

  #[test]
  fn test_topological_order_respects_dependencies() {
    let graph = diamond().graph();
    let order = graph.topological_order();
    assert_eq!(order.len(), graph.nodes().len());

    let pos = |k: ComponentKey| order.iter().position(|x| *x == k).unwrap();
    for key in graph.nodes() {
      for up in graph.upstream(*key) {
        assert!(pos(*up) < pos(*key), "{} must precede {}", up, key);
      }
    }
    assert_eq!(*order.last().unwrap(), ComponentKey::OutputCable { output: 0 });
  }
}
