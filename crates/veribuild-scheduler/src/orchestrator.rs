//! Pipeline orchestrator - executes compiled batches in dependency order.

use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use veribuild_core::{BuildKey, BuildResult, Error, Stage, StageContext, StageOutput, StageRunner};

use crate::graph::PipelineGraph;

/// State of a stage during execution.
#[derive(Debug, Clone)]
pub enum StageExecState {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl StageExecState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageExecState::Succeeded
                | StageExecState::Failed { .. }
                | StageExecState::Skipped { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageExecState::Succeeded)
    }
}

/// Result of one pipeline execution.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub success: bool,
    /// Artifact hash of the last successful stage that produced one.
    pub hash: Option<String>,
    pub artifact_size: u64,
    pub cycles_consumed: u64,
    pub build_time: Duration,
    pub stage_states: HashMap<String, StageExecState>,
    pub error: Option<String>,
}

impl PipelineOutcome {
    pub fn to_build_result(&self) -> BuildResult {
        BuildResult {
            hash: self.hash.clone(),
            artifact_size: self.artifact_size,
            build_time: self.build_time,
            cycles_consumed: self.cycles_consumed,
            success: self.success,
            error: self.error.clone(),
        }
    }
}

/// Orchestrates the execution of a compiled pipeline graph.
///
/// Batches run in order. Within a batch, stages sharing a parallel group
/// run concurrently; every other stage runs sequentially. The first batch
/// containing a failure halts the pipeline; later batches never run.
pub struct PipelineOrchestrator {
    runner: Arc<dyn StageRunner>,
    /// Root for per-stage cache directories preserved across attempts.
    cache_root: Option<PathBuf>,
}

impl PipelineOrchestrator {
    pub fn new(runner: Arc<dyn StageRunner>) -> Self {
        Self {
            runner,
            cache_root: None,
        }
    }

    pub fn with_cache_root(runner: Arc<dyn StageRunner>, cache_root: PathBuf) -> Self {
        Self {
            runner,
            cache_root: Some(cache_root),
        }
    }

    /// Execute the whole graph, returning the aggregate outcome.
    pub async fn run(&self, key: &BuildKey, graph: &PipelineGraph) -> PipelineOutcome {
        let started = Instant::now();
        let mut states: HashMap<String, StageExecState> = graph
            .batches()
            .iter()
            .flat_map(|b| b.stage_names())
            .map(|name| (name.to_string(), StageExecState::Pending))
            .collect();

        let mut hash = None;
        let mut artifact_size = 0u64;
        let mut cycles = 0u64;
        let mut failures: Vec<String> = Vec::new();

        'batches: for batch in graph.batches() {
            for group in &batch.groups {
                let attempts = group.stages.iter().map(|name| {
                    // Validated at compile time, every batched name resolves.
                    let stage = graph
                        .stage(name)
                        .cloned()
                        .unwrap_or_else(|| Stage::script(name.clone(), Vec::new()));
                    self.run_stage_with_retries(key.clone(), stage)
                });

                let results: Vec<(String, Result<StageOutput, String>)> =
                    if group.stages.len() > 1 {
                        info!(
                            key = %key,
                            group = group.parallel_group.as_deref().unwrap_or(""),
                            stages = group.stages.len(),
                            "running parallel group"
                        );
                        join_all(attempts).await
                    } else {
                        let mut out = Vec::with_capacity(1);
                        for attempt in attempts {
                            out.push(attempt.await);
                        }
                        out
                    };

                for (name, result) in results {
                    match result {
                        Ok(output) => {
                            states.insert(name.clone(), StageExecState::Succeeded);
                            cycles += output.cycles_consumed;
                            if let Some(stage_hash) = output.artifact_hash {
                                hash = Some(stage_hash);
                                artifact_size = output.artifact_size;
                            }
                        }
                        Err(message) => {
                            error!(key = %key, stage = %name, error = %message, "stage failed");
                            failures.push(format!("{name}: {message}"));
                            states.insert(name, StageExecState::Failed { message });
                        }
                    }
                }
            }

            if !failures.is_empty() {
                // Later batches are never scheduled.
                break 'batches;
            }
        }

        let success = failures.is_empty();
        if !success {
            // Whatever stayed Pending was cut off by the failed batch.
            for state in states.values_mut() {
                if !state.is_terminal() {
                    *state = StageExecState::Skipped {
                        reason: "earlier batch failed".to_string(),
                    };
                }
            }
        }

        PipelineOutcome {
            success,
            hash: if success { hash } else { None },
            artifact_size: if success { artifact_size } else { 0 },
            cycles_consumed: cycles,
            build_time: started.elapsed(),
            stage_states: states,
            error: if success {
                None
            } else {
                Some(failures.join("; "))
            },
        }
    }

    /// Run one stage: up to `retry_count + 1` attempts, immediate retry,
    /// each attempt bounded by the stage timeout. A timeout consumes one
    /// attempt like any other failure.
    async fn run_stage_with_retries(
        &self,
        key: BuildKey,
        stage: Stage,
    ) -> (String, Result<StageOutput, String>) {
        let name = stage.name.clone();
        let cache_dir = self
            .cache_root
            .as_ref()
            .map(|root| root.join(&key.project_id).join(&name));
        let max_attempts = stage.retry_count.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(key = %key, stage = %name, attempt, "running stage");
            let ctx = StageContext {
                key: key.clone(),
                stage: stage.clone(),
                attempt,
                cache_dir: cache_dir.clone(),
            };

            match tokio::time::timeout(stage.timeout, self.runner.run_stage(ctx)).await {
                Ok(Ok(output)) => {
                    info!(key = %key, stage = %name, attempt, "stage succeeded");
                    return (name, Ok(output));
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(key = %key, stage = %name, attempt, error = %last_error, "stage attempt failed");
                }
                Err(_) => {
                    last_error = format!(
                        "timed out after {}s",
                        stage.timeout.as_secs_f64()
                    );
                    warn!(key = %key, stage = %name, attempt, "stage attempt timed out");
                }
            }
        }

        (name, Err(last_error))
    }
}

/// Compile and run an instruction set in one step, for callers holding raw
/// instruction text rather than a prebuilt graph.
pub async fn run_instruction_set(
    orchestrator: &PipelineOrchestrator,
    key: &BuildKey,
    set: veribuild_core::InstructionSet,
) -> Result<PipelineOutcome, Error> {
    let graph = PipelineGraph::compile(set.into_stages())?;
    Ok(orchestrator.run(key, &graph).await)
}
