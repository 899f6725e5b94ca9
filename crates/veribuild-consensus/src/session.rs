//! Verification sessions and per-executor results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use veribuild_core::{BuildKey, ExecutorId};

/// Lifecycle of one verification: Pending until resolved, then terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VerificationStatus::Pending)
    }
}

/// One participating executor's slot in a session.
///
/// Created at fan-out time with `completed = false` and finalized exactly
/// once; repeat reports for the same executor are no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub executor_id: ExecutorId,
    pub hash: Option<String>,
    pub error: Option<String>,
    pub completed: bool,
    pub execution_time: Option<Duration>,
}

impl ExecutorResult {
    fn open(executor_id: ExecutorId) -> Self {
        Self {
            executor_id,
            hash: None,
            error: None,
            completed: false,
            execution_time: None,
        }
    }
}

/// The aggregate tracking one verification request's lifecycle and results.
/// Owned exclusively by the verifier; immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSession {
    pub key: BuildKey,
    pub status: VerificationStatus,
    pub total_executors: usize,
    /// Minimum count of executors that must agree on one hash.
    pub consensus_threshold: usize,
    pub executor_results: BTreeMap<ExecutorId, ExecutorResult>,
    /// Size of the largest group of completed executors agreeing on one
    /// non-empty hash. Non-decreasing while the session is Pending.
    pub matching_results: usize,
    pub verified_hash: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VerificationSession {
    pub fn new(key: BuildKey, executors: &[ExecutorId], consensus_threshold: usize) -> Self {
        let executor_results = executors
            .iter()
            .map(|id| (id.clone(), ExecutorResult::open(id.clone())))
            .collect();
        Self {
            key,
            status: VerificationStatus::Pending,
            total_executors: executors.len(),
            consensus_threshold,
            executor_results,
            matching_results: 0,
            verified_hash: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn all_completed(&self) -> bool {
        self.executor_results.values().all(|r| r.completed)
    }

    /// The largest group of completed executors reporting an identical
    /// non-empty hash: (size, hash). Depends only on the set of completed
    /// results, never on arrival order.
    pub fn largest_agreeing_group(&self) -> (usize, Option<String>) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for result in self.executor_results.values() {
            if !result.completed {
                continue;
            }
            if let Some(hash) = result.hash.as_deref() {
                if !hash.is_empty() {
                    *counts.entry(hash).or_insert(0) += 1;
                }
            }
        }
        counts
            .into_iter()
            // Tie-break on the hash itself so the winner is deterministic.
            .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)))
            .map(|(hash, count)| (count, Some(hash.to_string())))
            .unwrap_or((0, None))
    }

    /// Per-executor breakdown used in terminal error messages.
    pub fn breakdown(&self) -> String {
        self.executor_results
            .values()
            .map(|r| {
                let outcome = if !r.completed {
                    "never completed".to_string()
                } else if let Some(hash) = &r.hash {
                    hash.clone()
                } else {
                    r.error.clone().unwrap_or_else(|| "no result".to_string())
                };
                format!("{}: {}", r.executor_id, outcome)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Executors that have not reported, for timeout summaries.
    pub fn incomplete_executors(&self) -> Vec<ExecutorId> {
        self.executor_results
            .values()
            .filter(|r| !r.completed)
            .map(|r| r.executor_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(executors: &[&str], threshold: usize) -> VerificationSession {
        let ids: Vec<ExecutorId> = executors.iter().map(|e| ExecutorId::from(*e)).collect();
        VerificationSession::new(BuildKey::new("p", "v").unwrap(), &ids, threshold)
    }

    fn complete(s: &mut VerificationSession, executor: &str, hash: Option<&str>) {
        let result = s
            .executor_results
            .get_mut(&ExecutorId::from(executor))
            .unwrap();
        result.completed = true;
        result.hash = hash.map(String::from);
    }

    #[test]
    fn test_largest_group_ignores_incomplete_and_empty() {
        let mut s = session(&["a", "b", "c"], 2);
        complete(&mut s, "a", Some("h1"));
        complete(&mut s, "b", Some(""));

        let (count, hash) = s.largest_agreeing_group();
        assert_eq!(count, 1);
        assert_eq!(hash.as_deref(), Some("h1"));
    }

    #[test]
    fn test_largest_group_is_order_independent() {
        let mut forward = session(&["a", "b", "c"], 2);
        complete(&mut forward, "a", Some("h1"));
        complete(&mut forward, "b", Some("h2"));
        complete(&mut forward, "c", Some("h1"));

        let mut backward = session(&["a", "b", "c"], 2);
        complete(&mut backward, "c", Some("h1"));
        complete(&mut backward, "b", Some("h2"));
        complete(&mut backward, "a", Some("h1"));

        assert_eq!(
            forward.largest_agreeing_group(),
            backward.largest_agreeing_group()
        );
        assert_eq!(forward.largest_agreeing_group().0, 2);
    }

    #[test]
    fn test_breakdown_names_every_executor() {
        let mut s = session(&["a", "b"], 2);
        complete(&mut s, "a", Some("h1"));

        let text = s.breakdown();
        assert!(text.contains("a: h1"));
        assert!(text.contains("b: never completed"));
    }
}
