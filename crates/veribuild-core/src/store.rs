//! In-memory reference implementations of the external collaborators.
//!
//! Both are owned key-value stores behind explicit accessor operations,
//! never ambient globals. Production deployments substitute their own
//! `InstructionStore` / `ExecutorRegistry` implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::{
    BuildKey, Error, ExecutorCapabilities, ExecutorHealth, ExecutorId, ExecutorRegistry,
    HealthStatus, InstructionSet, InstructionStore, ResourceNeeds, Result,
};

/// Instruction store backed by a map of immutable instruction sets.
#[derive(Default)]
pub struct MemoryInstructionStore {
    instructions: Mutex<HashMap<BuildKey, InstructionSet>>,
}

impl MemoryInstructionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the instructions for a build key. Overwrites any previous
    /// entry for the same key.
    pub fn put(&self, key: BuildKey, set: InstructionSet) {
        debug!(key = %key, "storing instruction set");
        self.instructions
            .lock()
            .expect("instruction store lock poisoned")
            .insert(key, set);
    }
}

#[async_trait]
impl InstructionStore for MemoryInstructionStore {
    async fn get_instructions(&self, key: &BuildKey) -> Result<InstructionSet> {
        self.instructions
            .lock()
            .expect("instruction store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| Error::InstructionsNotFound(key.to_string()))
    }
}

struct RegisteredExecutor {
    capabilities: ExecutorCapabilities,
    health: ExecutorHealth,
}

/// Registry over a fixed, externally managed executor membership.
#[derive(Default)]
pub struct StaticRegistry {
    executors: Mutex<HashMap<ExecutorId, RegisteredExecutor>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one executor's registration.
    pub fn register(&self, id: ExecutorId, capabilities: ExecutorCapabilities) {
        debug!(executor = %id, "registering executor");
        self.executors
            .lock()
            .expect("registry lock poisoned")
            .insert(
                id,
                RegisteredExecutor {
                    capabilities,
                    health: ExecutorHealth {
                        status: HealthStatus::Healthy,
                        active_builds: 0,
                        queue_length: 0,
                    },
                },
            );
    }

    /// Administrative health update, e.g. from a monitoring probe.
    pub fn set_health(&self, id: &ExecutorId, health: ExecutorHealth) {
        if let Some(entry) = self
            .executors
            .lock()
            .expect("registry lock poisoned")
            .get_mut(id)
        {
            entry.health = health;
        }
    }
}

#[async_trait]
impl ExecutorRegistry for StaticRegistry {
    async fn list_capable_executors(&self, needs: &ResourceNeeds) -> Vec<ExecutorId> {
        let executors = self.executors.lock().expect("registry lock poisoned");
        let mut capable: Vec<ExecutorId> = executors
            .iter()
            .filter(|(_, e)| e.health.status != HealthStatus::Unreachable)
            .filter(|(_, e)| needs.fits_within(&e.capabilities.available_resources))
            .map(|(id, _)| id.clone())
            .collect();
        // Stable selection order regardless of map iteration.
        capable.sort();
        capable
    }

    async fn get_health(&self, executor: &ExecutorId) -> Result<ExecutorHealth> {
        self.executors
            .lock()
            .expect("registry lock poisoned")
            .get(executor)
            .map(|e| e.health.clone())
            .ok_or_else(|| Error::NotFound(format!("executor {executor}")))
    }
}
