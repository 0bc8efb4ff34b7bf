//! Sluice Pipeline
//!
//! This crate provides the pipeline definition types for sluice. A pipeline is
//! an ordered list of steps; each step applies a transformation (a containerised
//! [`Method`] or a nested [`Pipeline`]) to inputs wired in by cables.
//!
//! Key properties:
//! - Wiring is validated up front (no forward or dangling references)
//! - Methods are identified by family and revision, which keys the result cache
//! - The [`Graph`] gives the cable → step → cable dispatch order for one run

mod error;
mod graph;
mod method;
mod pipeline;

pub use error::PipelineError;
pub use graph::{ComponentKey, Graph};
pub use method::{ImageRef, InternalStep, Method, MethodId, Reusability};
pub use pipeline::{CableSource, InputCable, OutputCable, Pipeline, PipelineStep, Transformation};
