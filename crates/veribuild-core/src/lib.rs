//! Core domain types and traits for the Veribuild reproducible-build verifier.
//!
//! This crate contains:
//! - Resource identifiers and the (project, version) build key
//! - The shared error taxonomy
//! - Stage and instruction-set definitions
//! - Build request, queue entry and build result types
//! - Executor capabilities, health, and the trait seams to external
//!   collaborators (instruction store, executor registry, stage runner)

pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod stage;
pub mod store;

pub use build::{BuildReport, BuildRequest, BuildResult, QueueEntry, QueueState, QueueStatus};
pub use error::{Error, Result};
pub use executor::{
    ExecutorCapabilities, ExecutorHealth, ExecutorRegistry, ExecutorResources, HealthStatus,
    InstructionStore, StageContext, StageOutput, StageRunner,
};
pub use id::{BuildKey, ExecutorId, ResourceId};
pub use stage::{InstructionSet, ResourceNeeds, Stage};
pub use store::{MemoryInstructionStore, StaticRegistry};
