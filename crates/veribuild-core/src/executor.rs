//! Executor capabilities, health, and the trait seams to external
//! collaborators.
//!
//! Executor membership is externally managed: the registry tells the
//! verifier who exists, the queue enforces each executor's declared
//! capacity, and the stage runner is the only component that touches a
//! real execution environment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BuildKey, ExecutorId, InstructionSet, ResourceNeeds, Result, Stage};

/// Hardware an executor advertises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_space_gb: u64,
    pub network_bandwidth_mbps: u64,
}

impl Default for ExecutorResources {
    fn default() -> Self {
        Self {
            cpu_cores: 4,
            memory_mb: 8192,
            disk_space_gb: 100,
            network_bandwidth_mbps: 1000,
        }
    }
}

/// What an executor declares about itself. Mutated only by the owning
/// executor through an explicit update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCapabilities {
    pub max_concurrent_builds: usize,
    pub available_resources: ExecutorResources,
    pub supported_languages: Vec<String>,
    pub installed_tools: Vec<String>,
    pub labels: Vec<String>,
}

impl Default for ExecutorCapabilities {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 2,
            available_resources: ExecutorResources::default(),
            supported_languages: Vec::new(),
            installed_tools: Vec::new(),
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// Snapshot of one executor's load, reported by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorHealth {
    pub status: HealthStatus,
    pub active_builds: usize,
    pub queue_length: usize,
}

/// Maps (project, version) to immutable build instruction text.
/// Consumed, never mutated, by the build side.
#[async_trait]
pub trait InstructionStore: Send + Sync {
    /// Fetch the instructions for a build key.
    /// Returns `InstructionsNotFound` when nothing is stored.
    async fn get_instructions(&self, key: &BuildKey) -> Result<InstructionSet>;
}

/// Tracks known executors, their capabilities and health.
#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    /// Executors able to satisfy the given resource needs.
    async fn list_capable_executors(&self, needs: &ResourceNeeds) -> Vec<ExecutorId>;

    /// Current health of one executor.
    async fn get_health(&self, executor: &ExecutorId) -> Result<ExecutorHealth>;
}

/// Everything one stage attempt needs from its surroundings.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub key: BuildKey,
    pub stage: Stage,
    /// 1-based attempt number, for logging.
    pub attempt: u32,
    /// Directory whose contents survive across attempts of this stage.
    pub cache_dir: Option<std::path::PathBuf>,
}

/// What one successful stage attempt produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Hash over the stage's captured artifacts, if it produced any.
    pub artifact_hash: Option<String>,
    pub artifact_size: u64,
    pub cycles_consumed: u64,
    pub log: Vec<String>,
}

/// Runs one attempt of one stage in an isolated working environment.
///
/// Implementations must be safe to call concurrently; the scheduler runs
/// grouped stages against the same runner at the same time.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Execute the stage's commands in order. A non-zero exit fails the
    /// attempt; the scheduler owns retry and timeout policy.
    async fn run_stage(&self, ctx: StageContext) -> Result<StageOutput>;
}
