//! The consensus verifier: session creation, fan-out, attestation merge,
//! and threshold resolution.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use veribuild_config::VerifierSettings;
use veribuild_core::{
    BuildKey, BuildReport, BuildRequest, Error, ExecutorId, ExecutorRegistry, InstructionStore,
    Result,
};

use crate::dispatch::BuildDispatcher;
use crate::session::{VerificationSession, VerificationStatus};

/// Insertion-ordered arena of sessions keyed by (project, version).
#[derive(Default)]
struct SessionStore {
    sessions: HashMap<BuildKey, VerificationSession>,
    order: Vec<BuildKey>,
}

impl SessionStore {
    fn insert(&mut self, key: BuildKey, session: VerificationSession) {
        if self.sessions.insert(key.clone(), session).is_some() {
            // Re-verification of a terminal key: keep a single order slot.
            self.order.retain(|k| k != &key);
        }
        self.order.push(key);
    }

    /// Drop the oldest terminal sessions beyond the history bound.
    /// Pending sessions are never evicted.
    fn evict_terminal(&mut self, limit: usize) {
        let mut terminal = self
            .order
            .iter()
            .filter(|k| {
                self.sessions
                    .get(k)
                    .is_some_and(|s| s.status.is_terminal())
            })
            .count();
        while terminal > limit {
            let Some(pos) = self.order.iter().position(|k| {
                self.sessions
                    .get(k)
                    .is_some_and(|s| s.status.is_terminal())
            }) else {
                break;
            };
            let key = self.order.remove(pos);
            self.sessions.remove(&key);
            terminal -= 1;
        }
    }
}

/// Orchestrates fan-out of one logical build to N executors and resolves
/// each session by threshold agreement on the reported hash.
///
/// The verifier is the single writer of its sessions: attestations arrive
/// through [`ConsensusVerifier::record_attestation`] (directly or via the
/// inbox task) and deadlines through [`ConsensusVerifier::resolve_timeout`].
/// Query operations never mutate.
pub struct ConsensusVerifier {
    /// Self-handle for the deadline tasks the verifier spawns.
    this: Weak<ConsensusVerifier>,
    settings: VerifierSettings,
    instructions: Arc<dyn InstructionStore>,
    registry: Arc<dyn ExecutorRegistry>,
    dispatcher: Arc<dyn BuildDispatcher>,
    sessions: Mutex<SessionStore>,
    deadlines: Mutex<HashMap<BuildKey, AbortHandle>>,
}

impl ConsensusVerifier {
    pub fn new(
        settings: VerifierSettings,
        instructions: Arc<dyn InstructionStore>,
        registry: Arc<dyn ExecutorRegistry>,
        dispatcher: Arc<dyn BuildDispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            settings,
            instructions,
            registry,
            dispatcher,
            sessions: Mutex::new(SessionStore::default()),
            deadlines: Mutex::new(HashMap::new()),
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, SessionStore> {
        self.sessions.lock().expect("session lock poisoned")
    }

    fn authorize(&self, requester: &str) -> Result<()> {
        let allowed = &self.settings.authorized_requesters;
        if allowed.is_empty() || allowed.iter().any(|r| r == requester) {
            Ok(())
        } else {
            // Deliberately terse: authorization failures leak nothing.
            Err(Error::Unauthorized("requester not permitted".into()))
        }
    }

    /// Start (or return the in-flight) verification for a build.
    ///
    /// At most one Pending session exists per key: a repeat request while
    /// the first is Pending returns that session unchanged.
    pub async fn request_verification(
        &self,
        project_id: &str,
        version: &str,
        requester: &str,
        timeout: Option<Duration>,
    ) -> Result<VerificationSession> {
        let key = BuildKey::new(project_id, version)?;
        self.authorize(requester)?;

        if let Some(existing) = self.pending_session(&key) {
            debug!(key = %key, "verification already in flight");
            return Ok(existing);
        }

        let set = self.instructions.get_instructions(&key).await?;
        let needs = set.resource_needs();
        let mut executors = self.registry.list_capable_executors(&needs).await;
        if executors.is_empty() {
            return Err(Error::ExecutorFailure(
                "no capable executors available".into(),
            ));
        }
        executors.truncate(self.settings.total_executors);

        {
            let mut store = self.lock_sessions();
            // A concurrent request may have created the session while
            // instructions were being fetched.
            if let Some(existing) = store.sessions.get(&key) {
                if existing.status == VerificationStatus::Pending {
                    return Ok(existing.clone());
                }
            }
            let session = VerificationSession::new(
                key.clone(),
                &executors,
                self.settings.consensus_threshold,
            );
            store.insert(key.clone(), session);
        }
        info!(
            key = %key,
            executors = executors.len(),
            threshold = self.settings.consensus_threshold,
            "verification session created"
        );

        for executor in &executors {
            let request = BuildRequest::new(key.clone(), requester);
            if let Err(e) = self.dispatcher.dispatch(executor, request).await {
                warn!(key = %key, executor = %executor, error = %e, "dispatch failed");
                // Absorbed into the session: one unreachable executor only
                // reduces the available attestations.
                self.merge_attestation(&key, executor, None, Some(e.to_string()), None);
            }
        }

        // Dispatch failures can resolve the session before any deadline
        // exists; only a still-pending session needs one.
        if self.pending_session(&key).is_some() {
            self.arm_deadline(key.clone(), timeout.unwrap_or(self.settings.default_timeout));
        }

        self.session(&key)
    }

    /// Spawn the fan-in inbox: build reports from executor queues merge
    /// into their sessions here, one at a time.
    pub fn spawn_inbox(&self, mut reports: mpsc::Receiver<BuildReport>) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let Some(verifier) = this.upgrade() else {
                    break;
                };
                if let Err(e) = verifier.record_attestation(report) {
                    warn!(error = %e, "discarded attestation");
                }
            }
        })
    }

    /// Merge one executor's attestation into its session.
    ///
    /// Idempotent per executor: a repeat report is a no-op, as is any report
    /// for a session already terminal. A report from an executor that was
    /// never part of the session is a security violation.
    pub fn record_attestation(&self, report: BuildReport) -> Result<()> {
        let hash = report.result.hash.filter(|h| !h.is_empty());
        let error = report.result.error;
        self.merge_result(
            &report.key,
            &report.executor_id,
            hash,
            error,
            Some(report.result.build_time),
        )
    }

    fn merge_attestation(
        &self,
        key: &BuildKey,
        executor: &ExecutorId,
        hash: Option<String>,
        error: Option<String>,
        execution_time: Option<Duration>,
    ) {
        if let Err(e) = self.merge_result(key, executor, hash, error, execution_time) {
            warn!(key = %key, executor = %executor, error = %e, "failed to merge result");
        }
    }

    fn merge_result(
        &self,
        key: &BuildKey,
        executor: &ExecutorId,
        hash: Option<String>,
        error: Option<String>,
        execution_time: Option<Duration>,
    ) -> Result<()> {
        let resolved = {
            let mut store = self.lock_sessions();
            let Some(session) = store.sessions.get_mut(key) else {
                return Err(Error::NotFound(format!("no session for {key}")));
            };

            if session.status.is_terminal() {
                debug!(key = %key, executor = %executor, "late attestation ignored");
                return Ok(());
            }
            let Some(result) = session.executor_results.get_mut(executor) else {
                warn!(
                    key = %key,
                    executor = %executor,
                    security = true,
                    "attestation from non-participant"
                );
                return Err(Error::SecurityViolation(format!(
                    "executor {executor} is not part of session {key}"
                )));
            };
            if result.completed {
                debug!(key = %key, executor = %executor, "repeat attestation ignored");
                return Ok(());
            }

            result.completed = true;
            result.hash = hash;
            result.error = error;
            result.execution_time = execution_time;

            let resolved = Self::try_resolve(session);
            if resolved {
                store.evict_terminal(self.settings.history_limit);
            }
            resolved
        };

        if resolved {
            self.disarm_deadline(key);
        }
        Ok(())
    }

    /// Threshold check after every arrival. `matching_results` is computed
    /// from the set of completed attestations only, so arrival order never
    /// changes the outcome.
    fn try_resolve(session: &mut VerificationSession) -> bool {
        let (count, hash) = session.largest_agreeing_group();
        session.matching_results = count;

        if count >= session.consensus_threshold {
            session.status = VerificationStatus::Verified;
            session.verified_hash = hash;
            session.completed_at = Some(Utc::now());
            info!(
                key = %session.key,
                matching = count,
                hash = session.verified_hash.as_deref().unwrap_or(""),
                "build verified"
            );
            true
        } else if session.all_completed() {
            session.status = VerificationStatus::Failed;
            session.error = Some(format!(
                "consensus failure: no hash reached threshold {} ({})",
                session.consensus_threshold,
                session.breakdown()
            ));
            session.completed_at = Some(Utc::now());
            warn!(key = %session.key, matching = count, "consensus failed");
            true
        } else {
            false
        }
    }

    /// Forced resolution at the session deadline. A no-op unless the
    /// session is still Pending.
    pub fn resolve_timeout(&self, key: &BuildKey) {
        let timed_out = {
            let mut store = self.lock_sessions();
            let Some(session) = store.sessions.get_mut(key) else {
                return;
            };
            if session.status.is_terminal() {
                return;
            }

            let (count, hash) = session.largest_agreeing_group();
            session.matching_results = count;
            if count >= session.consensus_threshold {
                session.status = VerificationStatus::Verified;
                session.verified_hash = hash;
            } else {
                let incomplete: Vec<String> = session
                    .incomplete_executors()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                session.status = VerificationStatus::Failed;
                session.error = Some(format!(
                    "timeout: executors [{}] never completed ({})",
                    incomplete.join(", "),
                    session.breakdown()
                ));
            }
            session.completed_at = Some(Utc::now());
            warn!(
                key = %key,
                verified = session.status == VerificationStatus::Verified,
                "session deadline reached"
            );
            store.evict_terminal(self.settings.history_limit);
            true
        };

        if timed_out {
            self.disarm_deadline(key);
        }
    }

    fn arm_deadline(&self, key: BuildKey, deadline: Duration) {
        let this = self.this.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(verifier) = this.upgrade() {
                verifier.resolve_timeout(&task_key);
            }
        });
        self.deadlines
            .lock()
            .expect("deadline lock poisoned")
            .insert(key, handle.abort_handle());
    }

    fn disarm_deadline(&self, key: &BuildKey) {
        if let Some(handle) = self
            .deadlines
            .lock()
            .expect("deadline lock poisoned")
            .remove(key)
        {
            handle.abort();
        }
    }

    fn pending_session(&self, key: &BuildKey) -> Option<VerificationSession> {
        self.lock_sessions()
            .sessions
            .get(key)
            .filter(|s| s.status == VerificationStatus::Pending)
            .cloned()
    }

    fn session(&self, key: &BuildKey) -> Result<VerificationSession> {
        self.lock_sessions()
            .sessions
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no session for {key}")))
    }

    /// Current session for a build. Read-only.
    pub fn get_verification_status(
        &self,
        project_id: &str,
        version: &str,
    ) -> Result<VerificationSession> {
        let key = BuildKey::new(project_id, version)?;
        self.session(&key)
    }

    /// Sessions in insertion order with optional pagination. Read-only.
    pub fn list_verification_history(
        &self,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Vec<(BuildKey, VerificationSession)> {
        let store = self.lock_sessions();
        store
            .order
            .iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|k| store.sessions.get(k).map(|s| (k.clone(), s.clone())))
            .collect()
    }

    /// Pending sessions only. Read-only.
    pub fn get_active_verifications(&self) -> Vec<(BuildKey, VerificationSession)> {
        let store = self.lock_sessions();
        store
            .order
            .iter()
            .filter_map(|k| store.sessions.get(k).map(|s| (k.clone(), s.clone())))
            .filter(|(_, s)| s.status == VerificationStatus::Pending)
            .collect()
    }
}
