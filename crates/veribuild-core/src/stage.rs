//! Stage and instruction-set definitions.
//!
//! An instruction set is either a structured multi-stage pipeline or a flat
//! script. Flat scripts are expanded into a single-stage degenerate pipeline
//! so the scheduler has exactly one execution model.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default wall-clock bound for a stage attempt when none is configured.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Resources a stage declares it needs from an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceNeeds {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    /// Abstract compute budget for one run of the stage.
    pub cycle_budget: u64,
}

impl Default for ResourceNeeds {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_mb: 512,
            storage_mb: 1024,
            cycle_budget: 1_000_000,
        }
    }
}

impl ResourceNeeds {
    /// Whether an executor advertising `avail` can satisfy these needs.
    pub fn fits_within(&self, avail: &crate::ExecutorResources) -> bool {
        self.cpu_cores <= avail.cpu_cores
            && self.memory_mb <= avail.memory_mb
            && self.storage_mb <= avail.disk_space_gb.saturating_mul(1024)
    }
}

/// One unit of work in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// Commands run in order inside a fresh working environment.
    pub commands: Vec<String>,
    /// Names of stages that must succeed first.
    pub depends_on: Vec<String>,
    /// Stages sharing a group value within one batch may run concurrently.
    /// Ungrouped stages run sequentially relative to batch siblings.
    pub parallel_group: Option<String>,
    pub resources: ResourceNeeds,
    /// Additional attempts after the first failure. Immediate retry.
    pub retry_count: u32,
    /// Wall-clock bound per attempt. A timeout consumes one attempt.
    pub timeout: Duration,
    /// Paths captured on success only.
    pub artifacts: Vec<String>,
    /// Paths preserved across retries and runs of the same stage.
    pub cache_paths: Vec<String>,
    /// Environment seeded into the working environment, in order.
    pub env: Vec<(String, String)>,
}

impl Stage {
    /// A minimal stage running the given commands with default limits.
    pub fn script(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
            depends_on: Vec::new(),
            parallel_group: None,
            resources: ResourceNeeds::default(),
            retry_count: 0,
            timeout: DEFAULT_STAGE_TIMEOUT,
            artifacts: Vec::new(),
            cache_paths: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// Build instructions for one (project, version).
///
/// Stored instruction text may be a structured pipeline or an opaque shell
/// script; both forms execute through the same stage scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstructionSet {
    /// Structured multi-stage pipeline.
    Pipeline(Vec<Stage>),
    /// Flat script, treated as a single-stage degenerate pipeline.
    Script(String),
}

impl InstructionSet {
    /// Expand into the stage list the scheduler compiles.
    ///
    /// A flat script becomes one stage named `build` whose commands are the
    /// non-empty, non-comment lines of the script.
    pub fn into_stages(self) -> Vec<Stage> {
        match self {
            InstructionSet::Pipeline(stages) => stages,
            InstructionSet::Script(text) => {
                let commands: Vec<String> = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(String::from)
                    .collect();
                vec![Stage::script("build", commands)]
            }
        }
    }

    /// Aggregate resource needs, used for executor selection.
    pub fn resource_needs(&self) -> ResourceNeeds {
        match self {
            InstructionSet::Script(_) => ResourceNeeds::default(),
            InstructionSet::Pipeline(stages) => {
                let mut needs = ResourceNeeds::default();
                for stage in stages {
                    needs.cpu_cores = needs.cpu_cores.max(stage.resources.cpu_cores);
                    needs.memory_mb = needs.memory_mb.max(stage.resources.memory_mb);
                    needs.storage_mb = needs.storage_mb.max(stage.resources.storage_mb);
                    needs.cycle_budget = needs
                        .cycle_budget
                        .max(stage.resources.cycle_budget);
                }
                needs
            }
        }
    }
}
