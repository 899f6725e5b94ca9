//! Dispatching build requests to executor queues.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use veribuild_core::{BuildRequest, Error, ExecutorId, Result};
use veribuild_queue::BuildQueue;

/// Hands one build request to one executor's admission control.
#[async_trait]
pub trait BuildDispatcher: Send + Sync {
    async fn dispatch(&self, executor: &ExecutorId, request: BuildRequest) -> Result<()>;
}

/// Dispatcher over in-process [`BuildQueue`] instances.
pub struct QueueDispatcher {
    queues: HashMap<ExecutorId, Arc<BuildQueue>>,
}

impl QueueDispatcher {
    pub fn new(queues: impl IntoIterator<Item = Arc<BuildQueue>>) -> Self {
        Self {
            queues: queues
                .into_iter()
                .map(|q| (q.executor_id().clone(), q))
                .collect(),
        }
    }

    pub fn queue(&self, executor: &ExecutorId) -> Option<&Arc<BuildQueue>> {
        self.queues.get(executor)
    }
}

#[async_trait]
impl BuildDispatcher for QueueDispatcher {
    async fn dispatch(&self, executor: &ExecutorId, request: BuildRequest) -> Result<()> {
        let queue = self
            .queues
            .get(executor)
            .ok_or_else(|| Error::ExecutorFailure(format!("no queue for executor {executor}")))?;

        match queue.queue_build_request(request) {
            // An already-queued duplicate will still produce an attestation.
            Ok(accepted) => {
                debug!(executor = %executor, accepted, "build request dispatched");
                Ok(())
            }
            Err(Error::ResourceExhausted(msg)) => Err(Error::ExecutorFailure(format!(
                "executor {executor} rejected dispatch: {msg}"
            ))),
            Err(e) => Err(e),
        }
    }
}
