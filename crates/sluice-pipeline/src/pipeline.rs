use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::graph::Graph;
use crate::method::Method;

/// Where a cable takes its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum CableSource {
  /// One of the pipeline's own inputs.
  PipelineInput { index: usize },
  /// An output of an earlier step.
  StepOutput { step: usize, output: usize },
}

/// Feeds one input of a step's transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputCable {
  pub source: CableSource,
  /// Input index on the transformation.
  pub dest: usize,
}

/// Exposes a step output as a pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCable {
  pub name: String,
  pub source: CableSource,
}

/// What a step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
  Method(Method),
  Pipeline(Box<Pipeline>),
}

impl Transformation {
  pub fn input_count(&self) -> usize {
    match self {
      Transformation::Method(m) => m.inputs.len(),
      Transformation::Pipeline(p) => p.inputs.len(),
    }
  }

  pub fn output_count(&self) -> usize {
    match self {
      Transformation::Method(m) => m.outputs.len(),
      Transformation::Pipeline(p) => p.outputs.len(),
    }
  }

  pub fn as_method(&self) -> Option<&Method> {
    match self {
      Transformation::Method(m) => Some(m),
      Transformation::Pipeline(_) => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
  pub name: String,
  pub transformation: Transformation,
  #[serde(default)]
  pub cables: Vec<InputCable>,
}

/// A pipeline definition ready to be run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
  pub pipeline_id: String,
  pub name: String,
  pub inputs: Vec<String>,
  pub steps: Vec<PipelineStep>,
  pub outputs: Vec<OutputCable>,
}

impl Pipeline {
  /// Parse and validate a pipeline from JSON.
  pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
    let pipeline: Pipeline = serde_json::from_str(json)?;
    pipeline.validate()?;
    Ok(pipeline)
  }

  /// Read, parse and validate a pipeline file.
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_json_str(&content)
  }

  /// Build the component dependency graph.
  pub fn graph(&self) -> Graph {
    Graph::new(self)
  }

  pub fn get_step(&self, index: usize) -> Option<&PipelineStep> {
    self.steps.get(index)
  }

  /// Check wiring of this pipeline and every nested pipeline.
  pub fn validate(&self) -> Result<(), PipelineError> {
    for (step_idx, step) in self.steps.iter().enumerate() {
      let invalid = |message: String| PipelineError::InvalidStep {
        step: step_idx,
        name: step.name.clone(),
        message,
      };

      match &step.transformation {
        Transformation::Method(m) => m.validate()?,
        Transformation::Pipeline(p) => p.validate()?,
      }

      let input_count = step.transformation.input_count();
      if step.cables.len() != input_count {
        return Err(invalid(format!(
          "{} cables wired for {} inputs",
          step.cables.len(),
          input_count
        )));
      }

      for (cable_idx, cable) in step.cables.iter().enumerate() {
        if cable.dest >= input_count {
          return Err(invalid(format!("cable {} feeds missing input {}", cable_idx, cable.dest)));
        }
        if step.cables[..cable_idx].iter().any(|c| c.dest == cable.dest) {
          return Err(invalid(format!("input {} is wired twice", cable.dest)));
        }
        self
          .check_source(cable.source, step_idx)
          .map_err(|reference| PipelineError::DanglingCable {
            step: step_idx,
            cable: cable_idx,
            reference,
          })?;
      }
    }

    for output in &self.outputs {
      match output.source {
        CableSource::StepOutput { .. } => {
          self
            .check_source(output.source, self.steps.len())
            .map_err(|reference| PipelineError::InvalidOutput {
              name: output.name.clone(),
              message: format!("references missing {}", reference),
            })?;
        }
        CableSource::PipelineInput { .. } => {
          return Err(PipelineError::InvalidOutput {
            name: output.name.clone(),
            message: "output cables must come from a step".to_string(),
          });
        }
      }
    }

    Ok(())
  }

  /// A source is valid for a consumer at `before_step` if it refers to a
  /// pipeline input or to an output of a strictly earlier step.
  fn check_source(&self, source: CableSource, before_step: usize) -> Result<(), String> {
    match source {
      CableSource::PipelineInput { index } if index < self.inputs.len() => Ok(()),
      CableSource::PipelineInput { index } => Err(format!("pipeline input {}", index)),
      CableSource::StepOutput { step, output } => {
        let valid = step < before_step
          && self
            .steps
            .get(step)
            .is_some_and(|s| output < s.transformation.output_count());
        if valid {
          Ok(())
        } else {
          Err(format!("output {} of step {}", output, step))
        }
      }
    }
  }
}
