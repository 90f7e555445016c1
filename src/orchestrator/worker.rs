//! Lifecycle of one fork: provision a pod, run the build, collect results.
//!
//! ```text
//! Requested ──► Provisioning ──► Ready ──► Executing ──► Completed(exit)
//!     │              │             │           │
//!     └──────────────┴─────────────┴───────────┴──────► Failed(error)
//! ```
//!
//! A failed attempt deletes its pod and claim; the retry wrapper then starts
//! a brand-new [`Worker`] for the same fork index. A non-zero exit code is a
//! completed attempt, not a failure, and is never retried.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cleanup::{CleanupRegistry, RemainingPods, ResourceGuard, ResourceKind};
use super::exec_status::{ExecStatusError, decode_exit_code};
use super::results::{archive_log, find_result_dirs, log_path, results_dir};
use super::retry::{RetryError, RetryPolicy};
use crate::cluster::{
    ClaimMount, ClusterClient, ClusterError, HostPathMount, LineStream, PodSpec, Toleration,
    VolumeClaimSpec,
};
use crate::command::BuildCommand;
use crate::config::Config;
use crate::identity::{RUN_LABEL, RunIdentity};
use crate::scheduler::ForkAssignment;

/// Polls while waiting for a stale resource to disappear.
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DELETION_POLL_LIMIT: usize = 120;

/// Per-run settings shared by every fork.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub host_cache_dir: String,
    pub claim_size: String,
    pub image_pull_secret: Option<String>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
    pub pod_start_timeout: Duration,
    /// Source checkout inside the image.
    pub workdir: String,
    pub output_dir: PathBuf,
    pub echo_output: bool,
    pub fork_count: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        let secret = config.cluster.image_pull_secret.trim();
        Self {
            image: config.cluster.image.clone(),
            cpu: config.cluster.cpu_per_fork.to_string(),
            memory: format!("{}Gi", config.cluster.memory_gb_per_fork),
            host_cache_dir: config.cluster.host_cache_dir.clone(),
            claim_size: config.cluster.results_claim_size.clone(),
            image_pull_secret: (!secret.is_empty()).then(|| secret.to_string()),
            tolerations: config.cluster.tolerations.clone(),
            node_selector: config.cluster.node_selector.clone(),
            pod_start_timeout: Duration::from_secs(config.cluster.pod_start_timeout_secs),
            workdir: config.runner.workdir.clone(),
            output_dir: config.podfork.output_dir.clone(),
            echo_output: config.podfork.echo_output,
            fork_count: config.podfork.fork_count.max(1),
        }
    }

    /// Where the report volume is mounted in the container.
    pub fn results_mount_path(&self) -> PathBuf {
        Path::new(&self.workdir).join("test-runs")
    }

    /// The directory copied back after the build.
    pub fn remote_reports_dir(&self) -> PathBuf {
        self.results_mount_path().join("test-reports")
    }
}

/// Where a worker is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Requested,
    Provisioning,
    Ready,
    Executing,
    Completed(i32),
    Failed(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Completed(_) | WorkerState::Failed(_))
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: &WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Requested, Provisioning)
            | (Provisioning, Ready)
            | (Ready, Executing)
            | (Executing, Completed(_)) => true,
            (current, Failed(_)) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// One attempt at running a fork on one pod.
#[derive(Debug, Clone)]
pub struct Worker {
    pub fork_index: usize,
    pub attempt: usize,
    pub pod_name: String,
    pub volume_claim_name: String,
    state: WorkerState,
}

impl Worker {
    pub fn new(fork_index: usize, attempt: usize, identity: &RunIdentity) -> Self {
        Self {
            fork_index,
            attempt,
            pod_name: identity.pod_name(fork_index),
            volume_claim_name: identity.claim_name(fork_index),
            state: WorkerState::Requested,
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    fn advance(&mut self, next: WorkerState) {
        if !self.state.can_advance_to(&next) {
            warn!(
                "Pod {}: unexpected transition {:?} -> {:?}",
                self.pod_name, self.state, next
            );
        }
        debug!("Pod {}: {:?} -> {:?}", self.pod_name, self.state, next);
        self.state = next;
    }
}

/// Why an attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("pod {pod} did not become ready: {source}")]
    NotReady {
        pod: String,
        #[source]
        source: ClusterError,
    },

    #[error("cluster operation on pod {pod} failed: {source}")]
    Cluster {
        pod: String,
        #[source]
        source: ClusterError,
    },

    #[error("pod {pod}: {source}")]
    Status {
        pod: String,
        #[source]
        source: ExecStatusError,
    },

    #[error("exec channel of pod {pod} closed without a status")]
    StatusLost { pod: String },

    #[error("local I/O for pod {pod} failed: {source}")]
    Io {
        pod: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a fork that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub fork_index: usize,
    pub pod_name: String,
    pub exit_code: i32,
    /// Archived build output; `None` when the fork had nothing to run.
    pub log_file: Option<PathBuf>,
    /// Directories holding a results marker.
    pub result_artifact_dirs: Vec<PathBuf>,
    pub attempts: usize,
    pub duration_secs: u64,
}

impl ExecutionResult {
    /// Result for a fork that received no tests.
    pub fn skipped(fork_index: usize) -> Self {
        Self {
            fork_index,
            pod_name: String::new(),
            exit_code: 0,
            log_file: None,
            result_artifact_dirs: Vec::new(),
            attempts: 0,
            duration_secs: 0,
        }
    }
}

/// Aborts the watch task when the attempt ends, however it ends.
struct WatchTask(JoinHandle<()>);

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives forks through their lifecycle.
#[derive(Clone)]
pub struct WorkerLifecycle {
    cluster: Arc<dyn ClusterClient>,
    identity: RunIdentity,
    settings: Arc<WorkerSettings>,
    command: Arc<BuildCommand>,
    registry: CleanupRegistry,
    remaining: RemainingPods,
    retry: RetryPolicy,
}

impl WorkerLifecycle {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        identity: RunIdentity,
        settings: WorkerSettings,
        command: BuildCommand,
        registry: CleanupRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            identity,
            settings: Arc::new(settings),
            command: Arc::new(command),
            registry,
            remaining: RemainingPods::new(),
            retry,
        }
    }

    /// Shares a diagnostics registry with other lifecycles.
    pub fn with_remaining(mut self, remaining: RemainingPods) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Runs one fork, retrying whole attempts on failure.
    pub async fn run(
        &self,
        fork: &ForkAssignment,
    ) -> Result<ExecutionResult, RetryError<WorkerError>> {
        let started = Instant::now();
        let result = self
            .retry
            .run(|attempt| self.attempt(fork, attempt))
            .await;

        match &result {
            Ok(done) => info!(
                "Fork {} finished with exit code {} after {} attempt(s)",
                fork.fork_index, done.exit_code, done.attempts
            ),
            Err(e) => error!(
                "Failed to build in pod {} ({}/{}) within retry limit: {}",
                self.identity.pod_name(fork.fork_index),
                fork.fork_index,
                self.settings.fork_count,
                e
            ),
        }
        result.map(|mut done| {
            done.duration_secs = started.elapsed().as_secs();
            done
        })
    }

    async fn attempt(
        &self,
        fork: &ForkAssignment,
        attempt: usize,
    ) -> Result<ExecutionResult, WorkerError> {
        let mut worker = Worker::new(fork.fork_index, attempt, &self.identity);
        let mut guards: Vec<ResourceGuard> = Vec::new();

        let outcome = self.drive(&mut worker, fork, &mut guards).await;

        // Pod before claim.
        while let Some(guard) = guards.pop() {
            let (kind, name) = (guard.kind(), guard.name().to_string());
            if let Err(e) = guard.release().await {
                warn!("Failed to delete {} {}: {}", kind, name, e);
            }
        }
        self.remaining.remove(&worker.pod_name);

        match outcome {
            Ok(result) => {
                worker.advance(WorkerState::Completed(result.exit_code));
                Ok(result)
            }
            Err(e) => {
                error!(
                    "Encountered error during testing cycle on pod {} ({}/{}): {}",
                    worker.pod_name, worker.fork_index, self.settings.fork_count, e
                );
                worker.advance(WorkerState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        worker: &mut Worker,
        fork: &ForkAssignment,
        guards: &mut Vec<ResourceGuard>,
    ) -> Result<ExecutionResult, WorkerError> {
        let pod = worker.pod_name.clone();
        let cluster_err = |source: ClusterError| WorkerError::Cluster {
            pod: pod.clone(),
            source,
        };

        worker.advance(WorkerState::Provisioning);
        self.remove_stale(worker).await;

        self.cluster
            .create_volume_claim(&self.claim_spec(worker))
            .await
            .map_err(cluster_err)?;
        guards.push(self.guard(ResourceKind::VolumeClaim, &worker.volume_claim_name));

        info!("requesting pod: {}", pod);
        self.cluster
            .create_pod(&self.pod_spec(worker))
            .await
            .map_err(cluster_err)?;
        guards.push(self.guard(ResourceKind::Pod, &pod));
        self.remaining.insert(&pod);
        info!("scheduled pod: {}", pod);

        let _watch = self.watch(&pod).await;

        info!("Waiting for pod {} to start before executing build", pod);
        self.cluster
            .wait_pod_ready(&pod, self.settings.pod_start_timeout)
            .await
            .map_err(|source| WorkerError::NotReady {
                pod: pod.clone(),
                source,
            })?;
        worker.advance(WorkerState::Ready);
        info!("pod {} has started, executing build", pod);

        let argv = self.command.argv(fork, self.settings.fork_count);
        debug!(
            "Build command for pod {}: {}",
            pod,
            self.command.redacted(fork, self.settings.fork_count)
        );

        let io_err = |source: std::io::Error| WorkerError::Io {
            pod: pod.clone(),
            source,
        };
        let logs_dir = log_path(&self.settings.output_dir, &pod)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings.output_dir.clone());
        tokio::fs::create_dir_all(&logs_dir).await.map_err(io_err)?;
        let temp_log = tempfile::Builder::new()
            .prefix(&format!("{}-", pod))
            .suffix(".log.tmp")
            .tempfile_in(&logs_dir)
            .map_err(io_err)?;

        let started = Instant::now();
        let session = self.cluster.exec(&pod, &argv).await.map_err(cluster_err)?;
        worker.advance(WorkerState::Executing);
        info!("Build started on pod {}", pod);

        let pump = spawn_log_pump(
            session.stdout,
            temp_log.reopen().map_err(io_err)?,
            worker.fork_index,
            self.settings.echo_output,
        );

        let status = session.status.await;
        let pumped = pump.await;
        info!(
            "build has ended on pod {} ({}/{}), build took: {} seconds",
            pod,
            worker.fork_index,
            self.settings.fork_count,
            started.elapsed().as_secs()
        );
        if let Ok(Err(e)) = pumped {
            warn!("Log pump for pod {} stopped early: {}", pod, e);
        }

        let raw = match status {
            Ok(Ok(raw)) => raw,
            Ok(Err(source)) => return Err(cluster_err(source)),
            Err(_) => return Err(WorkerError::StatusLost { pod: pod.clone() }),
        };
        let exit_code = decode_exit_code(&raw).map_err(|source| WorkerError::Status {
            pod: pod.clone(),
            source,
        })?;

        let local_results = results_dir(&self.settings.output_dir, &pod);
        info!(
            "Saving {} results to: {}",
            pod,
            local_results.display()
        );
        // The build already ran; a failed copy must not rerun it.
        let result_artifact_dirs = match self
            .cluster
            .copy_from_pod(&pod, &self.settings.remote_reports_dir(), &local_results)
            .await
        {
            Ok(()) => find_result_dirs(&local_results),
            Err(e) => {
                warn!("Could not copy results out of {}: {}", pod, e);
                Vec::new()
            }
        };
        if result_artifact_dirs.is_empty() {
            warn!("No binary results found for pod {}", pod);
        }

        let log_file = log_path(&self.settings.output_dir, &pod);
        archive_log(temp_log.path(), &log_file)
            .await
            .map_err(io_err)?;

        Ok(ExecutionResult {
            fork_index: worker.fork_index,
            pod_name: pod.clone(),
            exit_code,
            log_file: Some(log_file),
            result_artifact_dirs,
            attempts: worker.attempt,
            duration_secs: 0,
        })
    }

    /// Deletes a pod or claim left behind under this worker's names and
    /// waits for them to go away. Best effort.
    async fn remove_stale(&self, worker: &Worker) {
        let pod = &worker.pod_name;
        match self.cluster.pod_exists(pod).await {
            Ok(true) => {
                info!("Deleting stale pod {}", pod);
                if let Err(e) = self.cluster.delete_pod(pod).await {
                    warn!("Failed to delete stale pod {}: {}", pod, e);
                }
                for _ in 0..DELETION_POLL_LIMIT {
                    match self.cluster.pod_exists(pod).await {
                        Ok(false) | Err(_) => break,
                        Ok(true) => {
                            warn!("pod {} has not been deleted, waiting 1s", pod);
                            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
                        }
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Could not check for stale pod {}: {}", pod, e),
        }

        let claim = &worker.volume_claim_name;
        let claim_exists = |claims: &[String]| claims.iter().any(|c| c == claim);
        if let Ok(claims) = self.cluster.list_volume_claims().await
            && claim_exists(&claims)
        {
            info!("Deleting stale volume claim {}", claim);
            if let Err(e) = self.cluster.delete_volume_claim(claim).await {
                warn!("Failed to delete stale volume claim {}: {}", claim, e);
            }
            for _ in 0..DELETION_POLL_LIMIT {
                match self.cluster.list_volume_claims().await {
                    Ok(claims) if claim_exists(&claims) => {
                        tokio::time::sleep(DELETION_POLL_INTERVAL).await;
                    }
                    _ => break,
                }
            }
        }
    }

    async fn watch(&self, pod: &str) -> Option<WatchTask> {
        match self.cluster.watch_pod(pod).await {
            Ok(mut events) => Some(WatchTask(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    info!("{}", event);
                }
            }))),
            Err(e) => {
                warn!("Could not watch pod {}: {}", pod, e);
                None
            }
        }
    }

    fn guard(&self, kind: ResourceKind, name: &str) -> ResourceGuard {
        ResourceGuard::new(
            kind,
            name,
            self.registry.clone(),
            Arc::clone(&self.cluster),
        )
    }

    fn labels(&self, worker: &Worker) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RUN_LABEL.to_string(), self.identity.stable_id().to_string()),
            ("podfork/fork".to_string(), worker.fork_index.to_string()),
        ])
    }

    fn claim_spec(&self, worker: &Worker) -> VolumeClaimSpec {
        VolumeClaimSpec {
            name: worker.volume_claim_name.clone(),
            storage: self.settings.claim_size.clone(),
            labels: self.labels(worker),
        }
    }

    fn pod_spec(&self, worker: &Worker) -> PodSpec {
        let s = &self.settings;
        PodSpec {
            name: worker.pod_name.clone(),
            image: s.image.clone(),
            command: vec![
                "bash".to_string(),
                "-c".to_string(),
                "sleep infinity".to_string(),
            ],
            cpu: s.cpu.clone(),
            memory: s.memory.clone(),
            env: vec![
                ("DRIVER_NODE_MEMORY".to_string(), "1024m".to_string()),
                ("DRIVER_WEB_MEMORY".to_string(), "1024m".to_string()),
            ],
            cache: HostPathMount {
                volume_name: "buildcache".to_string(),
                host_path: s.host_cache_dir.clone(),
                mount_path: s.host_cache_dir.clone(),
            },
            results: ClaimMount {
                volume_name: "testruns".to_string(),
                claim_name: worker.volume_claim_name.clone(),
                mount_path: s.results_mount_path().to_string_lossy().into_owned(),
            },
            image_pull_secret: s.image_pull_secret.clone(),
            tolerations: s.tolerations.clone(),
            node_selector: s.node_selector.clone(),
            labels: self.labels(worker),
        }
    }
}

/// Copies exec output into the log file, optionally echoing it.
///
/// Runs until the stream ends. Returns the number of lines written.
fn spawn_log_pump(
    mut lines: LineStream,
    file: std::fs::File,
    fork_index: usize,
    echo: bool,
) -> JoinHandle<std::io::Result<usize>> {
    tokio::spawn(async move {
        let mut out = tokio::io::BufWriter::new(tokio::fs::File::from_std(file));
        let mut count = 0;
        while let Some(line) = lines.next().await {
            if echo {
                info!("{}", format!("Container{}:   {}", fork_index, line).trim());
            }
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            count += 1;
        }
        out.flush().await?;
        Ok(count)
    })
}
