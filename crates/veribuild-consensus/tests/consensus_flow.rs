//! End-to-end verification flow: real queues, real process execution, and
//! threshold resolution across independent executors.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use veribuild_consensus::{ConsensusVerifier, QueueDispatcher, VerificationStatus};
use veribuild_config::VerifierSettings;
use veribuild_core::{
    BuildKey, ExecutorCapabilities, ExecutorId, InstructionSet, MemoryInstructionStore,
    StaticRegistry,
};
use veribuild_executor::ProcessRunner;
use veribuild_queue::BuildQueue;
use veribuild_scheduler::PipelineOrchestrator;

struct Cluster {
    verifier: Arc<ConsensusVerifier>,
}

/// Three executors, each with its own queue and a local process runner,
/// reporting into one verifier inbox. Queue draining is driven by polling
/// tasks standing in for the external driver loop.
fn cluster(store: Arc<MemoryInstructionStore>, settings: VerifierSettings) -> Cluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let registry = Arc::new(StaticRegistry::new());
    let runner = Arc::new(ProcessRunner::new());
    let (report_tx, report_rx) = mpsc::channel(64);

    let mut queues = Vec::new();
    for name in ["exec-a", "exec-b", "exec-c"] {
        let id = ExecutorId::from(name);
        registry.register(id.clone(), ExecutorCapabilities::default());
        let queue = BuildQueue::new(
            id,
            ExecutorCapabilities::default(),
            16,
            16,
            store.clone(),
            PipelineOrchestrator::new(runner.clone()),
            report_tx.clone(),
        );
        queues.push(queue);
    }

    for queue in &queues {
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            loop {
                queue.process_next_build();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    let dispatcher = Arc::new(QueueDispatcher::new(queues));
    let verifier = ConsensusVerifier::new(settings, store, registry, dispatcher);
    verifier.spawn_inbox(report_rx);

    Cluster { verifier }
}

async fn wait_terminal(cluster: &Cluster, project: &str, version: &str) -> veribuild_consensus::VerificationSession {
    for _ in 0..500 {
        if let Ok(session) = cluster.verifier.get_verification_status(project, version) {
            if session.status.is_terminal() {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("verification of {project}@{version} did not resolve");
}

#[tokio::test]
async fn test_reproducible_build_reaches_consensus() {
    let store = Arc::new(MemoryInstructionStore::new());
    store.put(
        BuildKey::new("api-server", "1.0").unwrap(),
        InstructionSet::Script("printf release-payload".into()),
    );
    let cluster = cluster(
        store,
        VerifierSettings {
            consensus_threshold: 2,
            total_executors: 3,
            default_timeout: Duration::from_secs(30),
            ..VerifierSettings::default()
        },
    );

    let session = cluster
        .verifier
        .request_verification("api-server", "1.0", "release-bot", None)
        .await
        .unwrap();
    assert_eq!(session.status, VerificationStatus::Pending);
    assert_eq!(session.total_executors, 3);

    let session = wait_terminal(&cluster, "api-server", "1.0").await;
    assert_eq!(session.status, VerificationStatus::Verified);
    assert!(session.verified_hash.is_some());
    // A deterministic build: every executor agreed, not just the threshold.
    assert_eq!(session.matching_results, 3);
    let hashes: Vec<_> = session
        .executor_results
        .values()
        .filter_map(|r| r.hash.clone())
        .collect();
    assert!(hashes.iter().all(|h| h == &hashes[0]));
}

#[tokio::test]
async fn test_nondeterministic_build_fails_consensus() {
    let store = Arc::new(MemoryInstructionStore::new());
    // Each executor hashes different random bytes.
    store.put(
        BuildKey::new("flaky", "1.0").unwrap(),
        InstructionSet::Script("head -c 16 /dev/urandom".into()),
    );
    let cluster = cluster(
        store,
        VerifierSettings {
            consensus_threshold: 2,
            total_executors: 3,
            default_timeout: Duration::from_secs(30),
            ..VerifierSettings::default()
        },
    );

    cluster
        .verifier
        .request_verification("flaky", "1.0", "release-bot", None)
        .await
        .unwrap();

    let session = wait_terminal(&cluster, "flaky", "1.0").await;
    assert_eq!(session.status, VerificationStatus::Failed);
    assert!(session.error.as_deref().unwrap().contains("consensus failure"));
    assert!(session.executor_results.values().all(|r| r.completed));
}

#[tokio::test]
async fn test_structured_pipeline_verifies_end_to_end() {
    let pipeline = r#"
        pipeline "release"

        stage "prepare" {
            run "printf seed > seed.txt"
            artifacts "seed.txt"
        }

        stage "package" depends="prepare" {
            run "printf payload > out.bin"
            artifacts "out.bin"
        }
    "#;
    let set = veribuild_config::parse_instruction_set(pipeline).unwrap();
    assert!(matches!(set, InstructionSet::Pipeline(_)));

    let store = Arc::new(MemoryInstructionStore::new());
    store.put(BuildKey::new("pkg", "2.0").unwrap(), set);
    let cluster = cluster(
        store,
        VerifierSettings {
            consensus_threshold: 3,
            total_executors: 3,
            default_timeout: Duration::from_secs(30),
            ..VerifierSettings::default()
        },
    );

    cluster
        .verifier
        .request_verification("pkg", "2.0", "release-bot", None)
        .await
        .unwrap();

    let session = wait_terminal(&cluster, "pkg", "2.0").await;
    assert_eq!(session.status, VerificationStatus::Verified);
    assert_eq!(session.matching_results, 3);
}
