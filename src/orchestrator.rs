//! Distributed test execution across forks.
//!
//! # Architecture
//!
//! ```text
//!   ForkPlan (frozen)
//!       │
//!       ▼
//!   Orchestrator::run
//!       │  delete orphans of the same stable id (best effort)
//!       │
//!       ├── tokio::spawn ──► WorkerLifecycle::run(fork 0) ──► ExecutionResult
//!       ├── tokio::spawn ──► WorkerLifecycle::run(fork 1) ──► ExecutionResult
//!       │        ...                 (retries whole attempts)
//!       └── tokio::spawn ──► WorkerLifecycle::run(fork N-1)
//!       │
//!       ▼  join all, in completion order
//!   RunReport { results (fork order), failures, result dirs }
//! ```
//!
//! A failing fork never cancels the others. The run as a whole fails with
//! the first unrecoverable failure in fork order, while the results of
//! every fork that did complete are still reported.
//!
//! # Key Components
//!
//! - [`Orchestrator`]: spawns and joins the forks
//! - [`worker::WorkerLifecycle`]: one fork's pod, build and results
//! - [`cleanup::CleanupRegistry`]: resources to delete on interruption
//! - [`pool::PreWarmPool`]: optional capacity reservation
//! - [`RunReport`]: aggregated outcome

pub mod cleanup;
pub mod exec_status;
pub mod pool;
pub mod results;
pub mod retry;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterClient;
use crate::identity::RunIdentity;
use crate::report::ForkProgress;
use crate::scheduler::{ForkAssignment, ForkPlan};

pub use cleanup::{
    CleanupRegistry, RemainingPods, ResourceGuard, ResourceKind, delete_run_resources,
};
pub use pool::{PreWarmPool, prewarm_spec};
pub use retry::{RetryError, RetryPolicy};
pub use worker::{ExecutionResult, Worker, WorkerError, WorkerLifecycle, WorkerSettings, WorkerState};

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("Fork {fork} failed after {attempts} attempt(s): {message}")]
    ForkFailed {
        fork: usize,
        attempts: usize,
        message: String,
    },

    #[error("Fork {fork} (pod {pod}) exited with code {code}")]
    NonZeroExit { fork: usize, pod: String, code: i32 },

    #[error("Fork {fork} panicked: {message}")]
    Panicked { fork: usize, message: String },

    #[error("Run was interrupted")]
    Interrupted,
}

/// A fork that produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkFailure {
    pub fork_index: usize,
    pub attempts: usize,
    pub error: String,
    pub panicked: bool,
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stable_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// Completed forks, in fork order.
    pub results: Vec<ExecutionResult>,
    /// Forks without a result, in fork order.
    pub failures: Vec<ForkFailure>,
    /// Every result directory of every completed fork.
    pub result_artifact_dirs: Vec<PathBuf>,
    pub interrupted: bool,
}

impl RunReport {
    /// The first unrecoverable failure, in fork order.
    ///
    /// A fork without a result and a fork with a non-zero exit compete on
    /// fork index alone.
    pub fn first_error(&self) -> Option<RunError> {
        if self.interrupted {
            return Some(RunError::Interrupted);
        }

        let failed = self.failures.first().map(|f| {
            let error = if f.panicked {
                RunError::Panicked {
                    fork: f.fork_index,
                    message: f.error.clone(),
                }
            } else {
                RunError::ForkFailed {
                    fork: f.fork_index,
                    attempts: f.attempts,
                    message: f.error.clone(),
                }
            };
            (f.fork_index, error)
        });
        let non_zero = self.results.iter().find(|r| r.exit_code != 0).map(|r| {
            (
                r.fork_index,
                RunError::NonZeroExit {
                    fork: r.fork_index,
                    pod: r.pod_name.clone(),
                    code: r.exit_code,
                },
            )
        });

        match (failed, non_zero) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a.1 } else { b.1 }),
            (a, b) => a.or(b).map(|(_, e)| e),
        }
    }

    pub fn success(&self) -> bool {
        self.first_error().is_none()
    }

    /// Fails with the first unrecoverable failure.
    pub fn ensure_success(&self) -> Result<(), RunError> {
        match self.first_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Local result directories of the pods this run completed.
    ///
    /// Skipped forks had no pod and contribute nothing. Directories left
    /// under `output_dir` by earlier runs are not included.
    pub fn result_roots(&self, output_dir: &Path) -> Vec<PathBuf> {
        self.results
            .iter()
            .filter(|r| !r.pod_name.is_empty())
            .map(|r| results::results_dir(output_dir, &r.pod_name))
            .collect()
    }

    /// 0 on success, 130 when interrupted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.first_error() {
            None => 0,
            Some(RunError::Interrupted) => 130,
            Some(_) => 1,
        }
    }
}

enum ForkOutcome {
    Completed(ExecutionResult),
    Failed { attempts: usize, error: String },
    Cancelled,
}

/// Runs a [`ForkPlan`] on the cluster.
pub struct Orchestrator {
    cluster: Arc<dyn ClusterClient>,
    identity: RunIdentity,
    lifecycle: WorkerLifecycle,
    remaining: RemainingPods,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Orchestrator {
    pub fn new(cluster: Arc<dyn ClusterClient>, identity: RunIdentity, lifecycle: WorkerLifecycle) -> Self {
        let remaining = RemainingPods::new();
        Self {
            cluster,
            identity,
            lifecycle: lifecycle.with_remaining(remaining.clone()),
            remaining,
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }

    /// Stops all forks when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Shows a progress bar of finished forks.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Deletes pods left over by an earlier run with the same stable id.
    ///
    /// Best effort: failures are logged and ignored. Returns the number of
    /// pods deleted.
    pub async fn delete_orphans(&self) -> usize {
        let pods = match self.cluster.list_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Could not list pods to clean up earlier runs: {}", e);
                return 0;
            }
        };

        let mut deleted = 0;
        for pod in pods.iter().filter(|p| self.identity.owns(p)) {
            info!("deleting: {}", pod);
            match self.cluster.delete_pod(pod).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete {}: {}", pod, e),
            }
        }
        deleted
    }

    /// Runs every fork of the plan and waits for all of them.
    pub async fn run(&self, plan: &ForkPlan) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let fork_count = plan.fork_count();

        self.delete_orphans().await;

        info!(
            "Running {} forks with {} test filters (run id {})",
            fork_count,
            plan.total_filters(),
            self.identity.stable_id()
        );

        let progress = ForkProgress::new(fork_count, self.show_progress);
        let mut pending: FuturesUnordered<_> = plan
            .forks()
            .iter()
            .map(|fork| {
                let handle = self.spawn_fork(fork.clone());
                let index = fork.fork_index;
                async move { (index, handle.await) }
            })
            .collect();

        let mut outcomes: Vec<(usize, Result<ForkOutcome, String>)> = Vec::with_capacity(fork_count);
        while let Some((index, joined)) = pending.next().await {
            let outcome = joined.map_err(panic_message);
            progress.fork_finished(index, matches!(outcome, Ok(ForkOutcome::Completed(ref r)) if r.exit_code == 0));
            outcomes.push((index, outcome));

            if !self.remaining.is_empty() {
                debug!("Still running: {}", self.remaining.snapshot().join(", "));
            }
        }
        progress.finish();

        outcomes.sort_by_key(|(index, _)| *index);
        let mut report = RunReport {
            stable_id: self.identity.stable_id().to_string(),
            started_at,
            duration_secs: 0,
            results: Vec::new(),
            failures: Vec::new(),
            result_artifact_dirs: Vec::new(),
            interrupted: self.cancel.is_cancelled(),
        };
        for (fork_index, outcome) in outcomes {
            match outcome {
                Ok(ForkOutcome::Completed(result)) => {
                    report
                        .result_artifact_dirs
                        .extend(result.result_artifact_dirs.iter().cloned());
                    report.results.push(result);
                }
                Ok(ForkOutcome::Failed { attempts, error }) => {
                    report.failures.push(ForkFailure {
                        fork_index,
                        attempts,
                        error,
                        panicked: false,
                    });
                }
                Ok(ForkOutcome::Cancelled) => {
                    report.failures.push(ForkFailure {
                        fork_index,
                        attempts: 0,
                        error: "cancelled".to_string(),
                        panicked: false,
                    });
                }
                Err(message) => {
                    error!("Fork {} panicked: {}", fork_index, message);
                    report.failures.push(ForkFailure {
                        fork_index,
                        attempts: 0,
                        error: message,
                        panicked: true,
                    });
                }
            }
        }
        report.duration_secs = start.elapsed().as_secs();
        report
    }

    fn spawn_fork(&self, fork: ForkAssignment) -> tokio::task::JoinHandle<ForkOutcome> {
        let lifecycle = self.lifecycle.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if fork.is_empty() {
                info!("Fork {} has no tests, not requesting a pod", fork.fork_index);
                return ForkOutcome::Completed(ExecutionResult::skipped(fork.fork_index));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => ForkOutcome::Cancelled,
                result = lifecycle.run(&fork) => match result {
                    Ok(result) => ForkOutcome::Completed(result),
                    Err(e) => ForkOutcome::Failed {
                        attempts: e.attempts,
                        error: e.last.to_string(),
                    },
                },
            }
        })
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::command::BuildCommand;
    use crate::config::load_config_str;
    use crate::durations::TestDurations;
    use crate::scheduler::{CandidateGroup, ShardSeed, plan_forks};

    fn orchestrator(fake: Arc<FakeCluster>, output_dir: &std::path::Path, forks: usize) -> Orchestrator {
        let mut config = load_config_str(
            r#"
            [podfork]
            retry_attempts = 2

            [cluster]
            image = "registry/tests:1"
            "#,
        )
        .unwrap();
        config.podfork.fork_count = forks;
        config.podfork.output_dir = output_dir.to_path_buf();

        let identity = RunIdentity::with_suffix("7", "ci", ":core:test", "xyz");
        let lifecycle = WorkerLifecycle::new(
            fake.clone(),
            identity.clone(),
            WorkerSettings::from_config(&config),
            BuildCommand::from_config(&config),
            CleanupRegistry::new(),
            RetryPolicy::fixed(config.podfork.retry_attempts),
        );
        Orchestrator::new(fake, identity, lifecycle)
    }

    fn plan_with(forks: usize, candidates: usize) -> ForkPlan {
        let durations = TestDurations::new();
        let candidates: Vec<_> = (0..candidates)
            .map(|i| CandidateGroup::new(":core:test", format!("a.T{}", i)))
            .collect();
        plan_forks(forks, &durations, &candidates, &ShardSeed::default()).unwrap()
    }

    fn plan(forks: usize) -> ForkPlan {
        plan_with(forks, forks)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_forks_succeed() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new());
        let report = orchestrator(fake.clone(), out.path(), 3).run(&plan(3)).await;

        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 3);
        let order: Vec<usize> = report.results.iter().map(|r| r.fork_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report.result_artifact_dirs.len(), 3);
        assert_eq!(fake.count("create_pod"), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_fork_does_not_cancel_others() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new().configure(|s| {
            s.exit_codes.push(("-1".into(), 2));
        }));
        let report = orchestrator(fake.clone(), out.path(), 3).run(&plan(3)).await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.exit_code(), 1);
        match report.ensure_success() {
            Err(RunError::NonZeroExit { fork, code, .. }) => {
                assert_eq!(fork, 1);
                assert_eq!(code, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exhausted_fork_is_reported_with_attempts() {
        let out = tempfile::tempdir().unwrap();
        // Both attempts time out.
        let fake = Arc::new(FakeCluster::new().configure(|s| s.ready_timeouts = 2));
        let report = orchestrator(fake.clone(), out.path(), 1).run(&plan(1)).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.first_error(),
            Some(RunError::ForkFailed {
                fork: 0,
                attempts: 2,
                message: report.failures[0].error.clone(),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_orphans_are_deleted_before_start() {
        let out = tempfile::tempdir().unwrap();
        let identity = RunIdentity::with_suffix("7", "ci", ":core:test", "old");
        let orphan = identity.pod_name(4);
        let fake = Arc::new(FakeCluster::new().configure(|s| {
            s.pods.insert(orphan.clone());
            s.pods.insert("unrelated-pod".into());
        }));

        let report = orchestrator(fake.clone(), out.path(), 1).run(&plan(1)).await;
        assert!(report.success());

        let calls = fake.calls();
        assert_eq!(calls[0], "list_pods ");
        assert_eq!(calls[1], format!("delete_pod {}", orphan));
        assert!(fake.with_state(|s| s.pods.contains("unrelated-pod")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_orphan_listing_failure_is_ignored() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new().configure(|s| s.list_fails = true));
        let report = orchestrator(fake, out.path(), 1).run(&plan(1)).await;
        assert!(report.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_fork_skips_provisioning() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new());
        // Two forks, one candidate: one fork is empty.
        let report = orchestrator(fake.clone(), out.path(), 2).run(&plan_with(2, 1)).await;

        assert!(report.success());
        assert_eq!(report.results.len(), 2);
        assert_eq!(fake.count("create_pod"), 1);
        assert!(report.results.iter().any(|r| r.log_file.is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_fork_is_reported() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new().configure(|s| s.exec_panics.push("-1".into())));
        let report = orchestrator(fake.clone(), out.path(), 2).run(&plan(2)).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].fork_index, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].panicked);
        assert_eq!(report.exit_code(), 1);
        match report.first_error() {
            Some(RunError::Panicked { fork, message }) => {
                assert_eq!(fork, 1);
                assert!(message.starts_with("exec crashed in "), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_result_roots_cover_only_this_run() {
        let out = tempfile::tempdir().unwrap();
        let earlier = results::results_dir(out.path(), "earlier-run-pod-0");
        std::fs::create_dir_all(&earlier).unwrap();

        let fake = Arc::new(FakeCluster::new());
        let report = orchestrator(fake, out.path(), 2).run(&plan_with(2, 1)).await;

        let roots = report.result_roots(out.path());
        assert_eq!(roots.len(), 1);
        assert!(!roots.contains(&earlier));
        let pod = report
            .results
            .iter()
            .find(|r| !r.pod_name.is_empty())
            .map(|r| r.pod_name.clone())
            .unwrap();
        assert_eq!(roots[0], results::results_dir(out.path(), &pod));

        let mut durations = TestDurations::new();
        assert_eq!(durations.ingest_junit_dirs(roots.iter().map(|p| p.as_path())), 1);
        assert_eq!(durations.get("a.B.c").unwrap().run_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_marks_run_interrupted() {
        let out = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeCluster::new());
        let token = CancellationToken::new();
        token.cancel();

        let report = orchestrator(fake, out.path(), 2)
            .with_cancellation(token)
            .run(&plan(2))
            .await;

        assert!(report.interrupted);
        assert_eq!(report.exit_code(), 130);
        assert_eq!(report.first_error(), Some(RunError::Interrupted));
    }

    #[test]
    fn test_first_error_prefers_lowest_fork() {
        let result = |fork: usize, code: i32| ExecutionResult {
            fork_index: fork,
            pod_name: format!("p-{}", fork),
            exit_code: code,
            log_file: None,
            result_artifact_dirs: vec![],
            attempts: 1,
            duration_secs: 0,
        };
        let report = RunReport {
            stable_id: "s".into(),
            started_at: Utc::now(),
            duration_secs: 0,
            results: vec![result(0, 0), result(2, 3)],
            failures: vec![ForkFailure {
                fork_index: 1,
                attempts: 3,
                error: "boom".into(),
                panicked: false,
            }],
            result_artifact_dirs: vec![],
            interrupted: false,
        };

        assert!(matches!(
            report.first_error(),
            Some(RunError::ForkFailed { fork: 1, attempts: 3, .. })
        ));
    }
}
