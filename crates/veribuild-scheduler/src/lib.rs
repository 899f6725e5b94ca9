//! Pipeline stage scheduling for Veribuild.
//!
//! Compiles a stage list into a dependency DAG with ordered execution
//! batches, then drives execution with retries, per-attempt timeouts, and
//! parallel groups.

pub mod graph;
pub mod orchestrator;

pub use graph::{ExecutionBatch, PipelineGraph, StageGroup};
pub use orchestrator::{PipelineOrchestrator, PipelineOutcome, StageExecState, run_instruction_set};
