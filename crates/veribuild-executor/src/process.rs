//! Local process runner implementation.
//!
//! Runs stage commands through a shell in a fresh temporary workspace,
//! restores declared cache paths before the attempt and saves them after,
//! and hashes captured artifacts with SHA-256. The hash is the value the
//! consensus layer compares across executors, so it must be a pure function
//! of artifact content.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};
use veribuild_core::{Error, Result, StageContext, StageOutput, StageRunner};

/// Wall-clock to abstract-cycles conversion used for budget accounting.
const CYCLES_PER_MILLI: u64 = 1_000;

/// Runs stage commands as local shell processes.
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run_stage(&self, ctx: StageContext) -> Result<StageOutput> {
        let started = Instant::now();
        let workspace = tempfile::tempdir()
            .map_err(|e| Error::Internal(format!("creating workspace: {e}")))?;
        let work_dir = workspace.path();

        if let Some(cache_dir) = &ctx.cache_dir {
            restore_cache(cache_dir, work_dir, &ctx.stage.cache_paths)?;
        }

        let mut log = Vec::new();
        let mut stdout_capture = Vec::new();
        for command in &ctx.stage.commands {
            debug!(
                key = %ctx.key,
                stage = %ctx.stage.name,
                attempt = ctx.attempt,
                command = %command,
                "running command"
            );
            let output = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .current_dir(work_dir)
                .env_clear()
                .env("PATH", std::env::var("PATH").unwrap_or_default())
                .env("HOME", work_dir)
                .envs(ctx.stage.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| Error::ExecutorFailure(format!("spawning '{command}': {e}")))?;

            for line in String::from_utf8_lossy(&output.stdout).lines() {
                log.push(line.to_string());
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                log.push(line.to_string());
            }
            stdout_capture.extend_from_slice(&output.stdout);

            if !output.status.success() {
                // Cache is still saved so a retry does not redo cached work.
                if let Some(cache_dir) = &ctx.cache_dir {
                    save_cache(work_dir, cache_dir, &ctx.stage.cache_paths);
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::ExecutorFailure(format!(
                    "command '{command}' exited with {}: {}",
                    output.status,
                    stderr.trim_end()
                )));
            }
        }

        if let Some(cache_dir) = &ctx.cache_dir {
            save_cache(work_dir, cache_dir, &ctx.stage.cache_paths);
        }

        let (artifact_hash, artifact_size) = if ctx.stage.artifacts.is_empty() {
            // No declared artifacts: attest over captured stdout so flat
            // scripts still produce a comparable hash.
            let mut hasher = Sha256::new();
            hasher.update(&stdout_capture);
            (
                Some(hex::encode(hasher.finalize())),
                stdout_capture.len() as u64,
            )
        } else {
            hash_artifacts(work_dir, &ctx.stage.artifacts)?
        };

        let elapsed = started.elapsed();
        Ok(StageOutput {
            artifact_hash,
            artifact_size,
            cycles_consumed: elapsed.as_millis() as u64 * CYCLES_PER_MILLI,
            log,
        })
    }
}

/// Hash declared artifact files in sorted path order. Every declared
/// artifact must exist; an absent one fails the attempt.
fn hash_artifacts(work_dir: &Path, artifacts: &[String]) -> Result<(Option<String>, u64)> {
    let mut paths: Vec<&String> = artifacts.iter().collect();
    paths.sort();

    let mut hasher = Sha256::new();
    let mut total_size = 0u64;
    for rel in paths {
        let path = work_dir.join(rel);
        let bytes = std::fs::read(&path).map_err(|e| {
            Error::ExecutorFailure(format!("artifact '{rel}' not produced: {e}"))
        })?;
        // Path is part of the attestation: renaming an artifact is a change.
        hasher.update(rel.as_bytes());
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
        total_size += bytes.len() as u64;
    }
    Ok((Some(hex::encode(hasher.finalize())), total_size))
}

fn restore_cache(cache_dir: &Path, work_dir: &Path, cache_paths: &[String]) -> Result<()> {
    for rel in cache_paths {
        let src = cache_dir.join(rel);
        if src.exists() {
            copy_recursive(&src, &work_dir.join(rel))
                .map_err(|e| Error::Internal(format!("restoring cache '{rel}': {e}")))?;
        }
    }
    Ok(())
}

/// Best-effort: a failed cache save never fails the attempt.
fn save_cache(work_dir: &Path, cache_dir: &Path, cache_paths: &[String]) {
    for rel in cache_paths {
        let src = work_dir.join(rel);
        if !src.exists() {
            continue;
        }
        if let Err(e) = copy_recursive(&src, &cache_dir.join(rel)) {
            warn!(path = %rel, error = %e, "failed to save cache path");
        }
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veribuild_core::{BuildKey, Stage};

    fn ctx(stage: Stage) -> StageContext {
        StageContext {
            key: BuildKey::new("proj", "1.0").unwrap(),
            stage,
            attempt: 1,
            cache_dir: None,
        }
    }

    fn stage_with(commands: Vec<&str>) -> Stage {
        Stage::script("build", commands.into_iter().map(String::from).collect())
    }

    #[tokio::test]
    async fn test_successful_commands_produce_stdout_hash() {
        let runner = ProcessRunner::new();
        let output = runner
            .run_stage(ctx(stage_with(vec!["echo hello"])))
            .await
            .unwrap();

        assert!(output.artifact_hash.is_some());
        assert_eq!(output.log, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_identical_commands_hash_identically() {
        let runner = ProcessRunner::new();
        let a = runner
            .run_stage(ctx(stage_with(vec!["printf deterministic"])))
            .await
            .unwrap();
        let b = runner
            .run_stage(ctx(stage_with(vec!["printf deterministic"])))
            .await
            .unwrap();
        assert_eq!(a.artifact_hash, b.artifact_hash);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_attempt() {
        let runner = ProcessRunner::new();
        let result = runner
            .run_stage(ctx(stage_with(vec!["echo first", "exit 3"])))
            .await;
        assert!(matches!(result, Err(Error::ExecutorFailure(msg)) if msg.contains("exit")));
    }

    #[tokio::test]
    async fn test_artifact_hashing_and_size() {
        let mut stage = stage_with(vec!["printf abc > out.bin"]);
        stage.artifacts.push("out.bin".to_string());

        let runner = ProcessRunner::new();
        let output = runner.run_stage(ctx(stage)).await.unwrap();
        assert!(output.artifact_hash.is_some());
        assert_eq!(output.artifact_size, 3);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_attempt() {
        let mut stage = stage_with(vec!["true"]);
        stage.artifacts.push("never-made.bin".to_string());

        let runner = ProcessRunner::new();
        let result = runner.run_stage(ctx(stage)).await;
        assert!(matches!(result, Err(Error::ExecutorFailure(msg)) if msg.contains("never-made")));
    }

    #[tokio::test]
    async fn test_environment_is_seeded() {
        let mut stage = stage_with(vec!["printf \"$GREETING\""]);
        stage.env.push(("GREETING".to_string(), "hi".to_string()));

        let runner = ProcessRunner::new();
        let output = runner.run_stage(ctx(stage)).await.unwrap();
        assert_eq!(output.log, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_cache_paths_survive_across_attempts() {
        let cache_root = tempfile::tempdir().unwrap();
        let mut stage = stage_with(vec!["echo once >> state/log.txt; wc -l < state/log.txt"]);
        stage.commands.insert(0, "mkdir -p state".to_string());
        stage.cache_paths.push("state".to_string());

        let runner = ProcessRunner::new();
        let mut first = ctx(stage.clone());
        first.cache_dir = Some(cache_root.path().to_path_buf());
        let out1 = runner.run_stage(first).await.unwrap();
        assert!(out1.log.iter().any(|l| l.trim() == "1"));

        let mut second = ctx(stage);
        second.attempt = 2;
        second.cache_dir = Some(cache_root.path().to_path_buf());
        let out2 = runner.run_stage(second).await.unwrap();
        // The cached state directory carried the first attempt's line over.
        assert!(out2.log.iter().any(|l| l.trim() == "2"));
    }
}
