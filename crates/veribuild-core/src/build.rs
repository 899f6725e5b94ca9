//! Build requests, queue entries and build results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{BuildKey, ExecutorId, ResourceId};

/// A request to run one build on one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: ResourceId,
    pub key: BuildKey,
    /// Identity of whoever asked for the build.
    pub requester: String,
    pub submitted_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(key: BuildKey, requester: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            key,
            requester: requester.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a queued build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueState::Completed | QueueState::Failed | QueueState::Cancelled
        )
    }

    /// Pending or Running: the states that make a key a duplicate.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// A build request tracked by one executor's queue. Owned exclusively by
/// that queue; state moves only through the admission protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub request: BuildRequest,
    pub state: QueueState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn pending(request: BuildRequest) -> Self {
        Self {
            request,
            state: QueueState::Pending,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Outcome of one build on one executor. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    /// Artifact hash, present only on success.
    pub hash: Option<String>,
    pub artifact_size: u64,
    pub build_time: Duration,
    pub cycles_consumed: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl BuildResult {
    pub fn failure(error: impl Into<String>, build_time: Duration, cycles: u64) -> Self {
        Self {
            hash: None,
            artifact_size: 0,
            build_time,
            cycles_consumed: cycles,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One executor's attestation for one finished build, delivered to the
/// verifier's inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub key: BuildKey,
    pub executor_id: ExecutorId,
    pub request_id: ResourceId,
    pub result: BuildResult,
}

/// Point-in-time snapshot of one executor's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_builds: usize,
    pub running_builds: usize,
    pub completed_builds: usize,
    pub max_queue_size: usize,
    /// pending / max_queue_size.
    pub queue_utilization: f64,
}
