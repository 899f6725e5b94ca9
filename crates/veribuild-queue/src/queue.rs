//! Build queue implementation.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use veribuild_core::{
    BuildKey, BuildReport, BuildRequest, BuildResult, Error, ExecutorCapabilities, ExecutorId,
    InstructionStore, QueueEntry, QueueState, QueueStatus, ResourceId, Result,
};
use veribuild_scheduler::{PipelineGraph, PipelineOrchestrator};

struct TrackedEntry {
    entry: QueueEntry,
    /// Present only while the entry is Running.
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<ResourceId, TrackedEntry>,
    /// Submission order of Pending entries. Strict FIFO.
    pending: VecDeque<ResourceId>,
    running: usize,
    finished: usize,
    history: VecDeque<BuildResult>,
}

impl QueueInner {
    fn has_active(&self, key: &BuildKey) -> bool {
        self.entries
            .values()
            .any(|t| t.entry.request.key == *key && t.entry.state.is_active())
    }
}

/// FIFO admission control for one executor.
///
/// The queue is the exclusive owner of its entries; the mutex is never held
/// across an await, so admission and status queries stay responsive while
/// builds execute.
pub struct BuildQueue {
    /// Self-handle for the execution tasks this queue spawns.
    this: Weak<BuildQueue>,
    executor_id: ExecutorId,
    max_queue_size: usize,
    history_limit: usize,
    capabilities: Mutex<ExecutorCapabilities>,
    inner: Mutex<QueueInner>,
    instructions: Arc<dyn InstructionStore>,
    orchestrator: PipelineOrchestrator,
    report_tx: mpsc::Sender<BuildReport>,
}

impl BuildQueue {
    pub fn new(
        executor_id: ExecutorId,
        capabilities: ExecutorCapabilities,
        max_queue_size: usize,
        history_limit: usize,
        instructions: Arc<dyn InstructionStore>,
        orchestrator: PipelineOrchestrator,
        report_tx: mpsc::Sender<BuildReport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            executor_id,
            max_queue_size,
            history_limit,
            capabilities: Mutex::new(capabilities),
            inner: Mutex::new(QueueInner::default()),
            instructions,
            orchestrator,
            report_tx,
        })
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    /// Admit a build request.
    ///
    /// Returns `Ok(false)` for a duplicate (project, version) already
    /// Pending or Running, `ResourceExhausted` when the pending backlog is
    /// at `max_queue_size`, and `Ok(true)` once the entry is queued.
    pub fn queue_build_request(&self, request: BuildRequest) -> Result<bool> {
        if request.key.project_id.trim().is_empty() || request.key.version.trim().is_empty() {
            return Err(Error::InvalidInput(
                "project_id and version must not be empty".into(),
            ));
        }

        let mut inner = self.lock_inner();
        if inner.has_active(&request.key) {
            info!(executor = %self.executor_id, key = %request.key, "duplicate build request ignored");
            return Ok(false);
        }
        if inner.pending.len() >= self.max_queue_size {
            return Err(Error::ResourceExhausted(format!(
                "queue for executor {} is full ({} pending)",
                self.executor_id, self.max_queue_size
            )));
        }

        let id = request.id;
        info!(executor = %self.executor_id, key = %request.key, build = %id, "build request queued");
        inner.entries.insert(
            id,
            TrackedEntry {
                entry: QueueEntry::pending(request),
                abort: None,
            },
        );
        inner.pending.push_back(id);
        Ok(true)
    }

    /// Pop the oldest Pending entry and start executing it, if a
    /// concurrency slot is free.
    ///
    /// Never blocks; returns `false` when there is no capacity or nothing
    /// pending. Intended to be invoked repeatedly by an external driver.
    pub fn process_next_build(&self) -> bool {
        let Some(queue) = self.this.upgrade() else {
            return false;
        };
        let max_concurrent = self
            .capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .max_concurrent_builds;

        let (id, key) = {
            let mut inner = self.lock_inner();
            if inner.running >= max_concurrent {
                return false;
            }
            let Some(id) = inner.pending.pop_front() else {
                return false;
            };
            let Some(tracked) = inner.entries.get_mut(&id) else {
                return false;
            };
            tracked.entry.state = QueueState::Running;
            tracked.entry.started_at = Some(Utc::now());
            let key = tracked.entry.request.key.clone();
            inner.running += 1;
            (id, key)
        };

        info!(executor = %self.executor_id, key = %key, build = %id, "build started");
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            // Cancellation may land before this task first runs.
            if !queue.is_running(id) {
                return;
            }
            let result = queue.execute(&task_key).await;
            queue.finish(id, result).await;
        });

        // Retain the handle so a running build can be cancelled.
        let mut inner = self.lock_inner();
        if let Some(tracked) = inner.entries.get_mut(&id) {
            if tracked.entry.state == QueueState::Running {
                tracked.abort = Some(handle.abort_handle());
            }
        }
        true
    }

    fn is_running(&self, id: ResourceId) -> bool {
        self.lock_inner()
            .entries
            .get(&id)
            .is_some_and(|t| t.entry.state == QueueState::Running)
    }

    /// Fetch instructions, compile the graph, and run the pipeline.
    /// Every failure mode collapses into a failed [`BuildResult`].
    async fn execute(&self, key: &BuildKey) -> BuildResult {
        let started = std::time::Instant::now();
        let set = match self.instructions.get_instructions(key).await {
            Ok(set) => set,
            Err(e) => {
                warn!(executor = %self.executor_id, key = %key, error = %e, "no instructions for build");
                return BuildResult::failure(e.to_string(), started.elapsed(), 0);
            }
        };

        let graph = match PipelineGraph::compile(set.into_stages()) {
            Ok(graph) => graph,
            Err(e) => {
                // Structural errors are distinguishable from runtime build
                // failures in the result error text.
                error!(executor = %self.executor_id, key = %key, error = %e, "pipeline graph rejected");
                return BuildResult::failure(
                    format!("pipeline compile: {e}"),
                    started.elapsed(),
                    0,
                );
            }
        };

        self.orchestrator.run(key, &graph).await.to_build_result()
    }

    /// Record the outcome, free the slot, and report the attestation.
    async fn finish(&self, id: ResourceId, result: BuildResult) {
        let report = {
            let mut inner = self.lock_inner();
            let Some(tracked) = inner.entries.get_mut(&id) else {
                return;
            };
            // A cancelled entry already released its slot.
            if tracked.entry.state != QueueState::Running {
                return;
            }
            tracked.entry.state = if result.success {
                QueueState::Completed
            } else {
                QueueState::Failed
            };
            tracked.entry.finished_at = Some(Utc::now());
            tracked.abort = None;
            let key = tracked.entry.request.key.clone();

            inner.running -= 1;
            inner.finished += 1;
            inner.history.push_back(result.clone());
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }

            BuildReport {
                key,
                executor_id: self.executor_id.clone(),
                request_id: id,
                result,
            }
        };

        info!(
            executor = %self.executor_id,
            key = %report.key,
            build = %id,
            success = report.result.success,
            "build finished"
        );
        if self.report_tx.send(report).await.is_err() {
            warn!(executor = %self.executor_id, build = %id, "attestation receiver dropped");
        }
    }

    /// Cancel a Pending or Running build.
    ///
    /// Running cancellation aborts in-flight execution best-effort and
    /// releases the concurrency slot. Returns `false` for unknown ids and
    /// entries already terminal.
    pub fn cancel_build(&self, id: ResourceId) -> bool {
        let abort = {
            let mut inner = self.lock_inner();
            let Some(tracked) = inner.entries.get_mut(&id) else {
                return false;
            };
            match tracked.entry.state {
                QueueState::Pending => {
                    tracked.entry.state = QueueState::Cancelled;
                    tracked.entry.finished_at = Some(Utc::now());
                    inner.pending.retain(|p| *p != id);
                    None
                }
                QueueState::Running => {
                    tracked.entry.state = QueueState::Cancelled;
                    tracked.entry.finished_at = Some(Utc::now());
                    let abort = tracked.abort.take();
                    inner.running -= 1;
                    abort
                }
                _ => return false,
            }
        };

        info!(executor = %self.executor_id, build = %id, "build cancelled");
        if let Some(abort) = abort {
            abort.abort();
        }
        true
    }

    /// Point-in-time queue snapshot. Read-only.
    pub fn status(&self) -> QueueStatus {
        let inner = self.lock_inner();
        QueueStatus {
            pending_builds: inner.pending.len(),
            running_builds: inner.running,
            completed_builds: inner.finished,
            max_queue_size: self.max_queue_size,
            queue_utilization: if self.max_queue_size == 0 {
                0.0
            } else {
                inner.pending.len() as f64 / self.max_queue_size as f64
            },
        }
    }

    /// Look up one entry by id.
    pub fn entry(&self, id: ResourceId) -> Option<QueueEntry> {
        self.lock_inner().entries.get(&id).map(|t| t.entry.clone())
    }

    /// The bounded build-result log, oldest first.
    pub fn build_history(&self) -> Vec<BuildResult> {
        self.lock_inner().history.iter().cloned().collect()
    }

    /// The only mutation point for this executor's declared capabilities.
    pub fn update_capabilities(&self, capabilities: ExecutorCapabilities) {
        info!(
            executor = %self.executor_id,
            max_concurrent = capabilities.max_concurrent_builds,
            "capabilities updated"
        );
        *self.capabilities.lock().expect("capabilities lock poisoned") = capabilities;
    }

    pub fn capabilities(&self) -> ExecutorCapabilities {
        self.capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use veribuild_core::{
        InstructionSet, MemoryInstructionStore, StageContext, StageOutput, StageRunner,
    };

    /// Runner that blocks each stage until the test releases it.
    struct GatedRunner {
        gate: Notify,
        started: AtomicUsize,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                started: AtomicUsize::new(0),
            })
        }

        fn release_one(&self) {
            self.gate.notify_one();
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageRunner for GatedRunner {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn run_stage(&self, ctx: StageContext) -> Result<StageOutput> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(StageOutput {
                artifact_hash: Some(format!("hash-{}", ctx.key)),
                artifact_size: 16,
                cycles_consumed: 1,
                log: vec![],
            })
        }
    }

    struct Harness {
        queue: Arc<BuildQueue>,
        runner: Arc<GatedRunner>,
        report_rx: mpsc::Receiver<BuildReport>,
        store: Arc<MemoryInstructionStore>,
    }

    fn harness(max_concurrent: usize, max_queue_size: usize) -> Harness {
        let store = Arc::new(MemoryInstructionStore::new());
        let runner = GatedRunner::new();
        let (report_tx, report_rx) = mpsc::channel(16);
        let caps = ExecutorCapabilities {
            max_concurrent_builds: max_concurrent,
            ..ExecutorCapabilities::default()
        };
        let queue = BuildQueue::new(
            ExecutorId::from("exec-1"),
            caps,
            max_queue_size,
            8,
            store.clone(),
            PipelineOrchestrator::new(runner.clone()),
            report_tx,
        );
        Harness {
            queue,
            runner,
            report_rx,
            store,
        }
    }

    fn request(h: &Harness, project: &str, version: &str) -> BuildRequest {
        let key = BuildKey::new(project, version).unwrap();
        h.store
            .put(key.clone(), InstructionSet::Script("make all".into()));
        BuildRequest::new(key, "tester")
    }

    #[tokio::test]
    async fn test_fifo_order_with_capacity_one() {
        let mut h = harness(1, 10);
        for version in ["a", "b", "c"] {
            let req = request(&h, "proj", version);
            assert!(h.queue.queue_build_request(req).unwrap());
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            assert!(h.queue.process_next_build());
            // Capacity is 1: a second poll makes no progress.
            assert!(!h.queue.process_next_build());
            h.runner.release_one();
            let report = h.report_rx.recv().await.unwrap();
            order.push(report.key.version.clone());
        }

        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(!h.queue.process_next_build());
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected_while_active() {
        let h = harness(1, 10);
        let req = request(&h, "p", "v");
        let dup = BuildRequest::new(req.key.clone(), "tester");

        assert!(h.queue.queue_build_request(req).unwrap());
        assert!(!h.queue.queue_build_request(dup).unwrap());
    }

    #[tokio::test]
    async fn test_resubmission_allowed_after_completion() {
        let mut h = harness(1, 10);
        let req = request(&h, "p", "v");
        let key = req.key.clone();
        assert!(h.queue.queue_build_request(req).unwrap());
        assert!(h.queue.process_next_build());
        h.runner.release_one();
        h.report_rx.recv().await.unwrap();

        assert!(
            h.queue
                .queue_build_request(BuildRequest::new(key, "tester"))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_identifiers_rejected() {
        let h = harness(1, 10);
        let req = BuildRequest {
            id: ResourceId::new(),
            key: BuildKey {
                project_id: "".into(),
                version: "v".into(),
            },
            requester: "tester".into(),
            submitted_at: Utc::now(),
        };
        assert!(matches!(
            h.queue.queue_build_request(req),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_full_is_resource_exhausted() {
        let h = harness(1, 1);
        assert!(h.queue.queue_build_request(request(&h, "p", "1")).unwrap());
        assert!(matches!(
            h.queue.queue_build_request(request(&h, "p", "2")),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_status_tracks_pending_and_running() {
        let mut h = harness(1, 4);
        assert!(h.queue.queue_build_request(request(&h, "p", "1")).unwrap());

        let status = h.queue.status();
        assert_eq!(status.pending_builds, 1);
        assert_eq!(status.running_builds, 0);
        assert_eq!(status.queue_utilization, 0.25);

        assert!(h.queue.queue_build_request(request(&h, "p", "2")).unwrap());
        assert!(h.queue.process_next_build());

        let status = h.queue.status();
        assert_eq!(status.pending_builds, 1);
        assert_eq!(status.running_builds, 1);

        h.runner.release_one();
        let report = h.report_rx.recv().await.unwrap();
        assert!(report.result.success);
        assert_eq!(h.queue.status().completed_builds, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_build() {
        let h = harness(1, 10);
        let req = request(&h, "p", "v");
        let id = req.id;
        assert!(h.queue.queue_build_request(req).unwrap());

        assert!(h.queue.cancel_build(id));
        assert_eq!(h.queue.entry(id).unwrap().state, QueueState::Cancelled);
        assert!(!h.queue.process_next_build());

        // Terminal now: a second cancel is refused.
        assert!(!h.queue.cancel_build(id));
    }

    #[tokio::test]
    async fn test_cancel_running_build_frees_slot() {
        let h = harness(1, 10);
        let req = request(&h, "p", "1");
        let id = req.id;
        assert!(h.queue.queue_build_request(req).unwrap());
        assert!(h.queue.queue_build_request(request(&h, "p", "2")).unwrap());
        assert!(h.queue.process_next_build());

        assert!(h.queue.cancel_build(id));
        assert_eq!(h.queue.status().running_builds, 0);
        // Slot released: the next build can start.
        assert!(h.queue.process_next_build());
    }

    #[tokio::test]
    async fn test_cancel_before_task_starts_skips_execution() {
        let mut h = harness(1, 10);
        let req = request(&h, "p", "v");
        let id = req.id;
        assert!(h.queue.queue_build_request(req).unwrap());
        assert!(h.queue.process_next_build());

        // On a current-thread runtime the spawned task has not run yet;
        // cancel in the window before it first polls.
        assert!(h.queue.cancel_build(id));
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(h.runner.started(), 0);
        assert_eq!(h.queue.entry(id).unwrap().state, QueueState::Cancelled);
        assert!(h.report_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_build_is_false() {
        let h = harness(1, 10);
        assert!(!h.queue.cancel_build(ResourceId::new()));
    }

    #[tokio::test]
    async fn test_missing_instructions_fail_the_build() {
        let mut h = harness(1, 10);
        // Bypass the harness helper so no instructions are stored.
        let key = BuildKey::new("ghost", "v").unwrap();
        let req = BuildRequest::new(key, "tester");
        assert!(h.queue.queue_build_request(req).unwrap());
        assert!(h.queue.process_next_build());

        let report = h.report_rx.recv().await.unwrap();
        assert!(!report.result.success);
        assert!(
            report
                .result
                .error
                .unwrap()
                .contains("instructions not found")
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut h = harness(1, 32);
        for i in 0..12 {
            let req = request(&h, "p", &format!("v{i}"));
            assert!(h.queue.queue_build_request(req).unwrap());
            assert!(h.queue.process_next_build());
            h.runner.release_one();
            h.report_rx.recv().await.unwrap();
        }
        // Harness history limit is 8.
        assert_eq!(h.queue.build_history().len(), 8);
    }
}
