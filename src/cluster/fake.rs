//! In-memory cluster used by the orchestrator tests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use tokio::sync::oneshot;

use super::{
    ClusterClient, ClusterError, ClusterResult, ExecSession, JobSpec, PodEvent, PodEventStream,
    PodSpec, VolumeClaimSpec, WatchAction,
};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub pods: BTreeSet<String>,
    pub claims: BTreeSet<String>,
    pub jobs: BTreeSet<String>,
    /// Every call, as `"<operation> <name>"`.
    pub calls: Vec<String>,
    /// Commands passed to `exec`, per pod.
    pub execs: Vec<(String, Vec<String>)>,
    /// Number of upcoming `create_pod` calls that fail.
    pub create_pod_failures: usize,
    /// Number of upcoming `wait_pod_ready` calls that time out.
    pub ready_timeouts: usize,
    /// Exit code for pods whose name ends with the key, e.g. `"-1"`.
    pub exit_codes: Vec<(String, i32)>,
    /// Raw status payload for pods whose name ends with the key.
    pub raw_status: Vec<(String, Vec<u8>)>,
    /// Lines each exec prints.
    pub output: Vec<String>,
    /// When set, `copy_from_pod` writes no report directories.
    pub no_results: bool,
    /// When set, `copy_from_pod` fails.
    pub copy_fails: bool,
    /// `exec` panics for pods whose name ends with one of these.
    pub exec_panics: Vec<String>,
    /// When set, `list_pods` fails.
    pub list_fails: bool,
    /// How many `job_exists` calls report a deleted job as still present.
    pub job_linger_polls: usize,
}

/// Records calls and simulates pods, claims and jobs in memory.
#[derive(Debug)]
pub(crate) struct FakeCluster {
    namespace: String,
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            namespace: "test".to_string(),
            state: Mutex::new(FakeState {
                output: vec!["BUILD SUCCESSFUL".to_string()],
                ..Default::default()
            }),
        }
    }

    pub fn configure(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    /// Number of calls to `operation`.
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{} ", operation);
        self.with_state(|s| s.calls.iter().filter(|c| c.starts_with(&prefix)).count())
    }

    fn record(&self, operation: &str, name: &str) {
        self.with_state(|s| s.calls.push(format!("{} {}", operation, name)));
    }
}

fn status_for(code: i32) -> Vec<u8> {
    if code == 0 {
        return Vec::new();
    }
    serde_json::to_vec(&json!({
        "kind": "Status",
        "status": "Failure",
        "details": { "causes": [{ "reason": "ExitCode", "message": code.to_string() }] }
    }))
    .unwrap()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_pods(&self) -> ClusterResult<Vec<String>> {
        self.record("list_pods", "");
        self.with_state(|s| {
            if s.list_fails {
                Err(ClusterError::Connection("api unreachable".to_string()))
            } else {
                Ok(s.pods.iter().cloned().collect())
            }
        })
    }

    async fn pod_exists(&self, name: &str) -> ClusterResult<bool> {
        Ok(self.with_state(|s| s.pods.contains(name)))
    }

    async fn create_pod(&self, spec: &PodSpec) -> ClusterResult<()> {
        self.record("create_pod", &spec.name);
        self.with_state(|s| {
            if s.create_pod_failures > 0 {
                s.create_pod_failures -= 1;
                return Err(ClusterError::CreateFailed(format!(
                    "pod {}: insufficient cpu",
                    spec.name
                )));
            }
            if !s.pods.insert(spec.name.clone()) {
                return Err(ClusterError::CreateFailed(format!(
                    "pod {} already exists",
                    spec.name
                )));
            }
            Ok(())
        })
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.record("delete_pod", name);
        self.with_state(|s| s.pods.remove(name));
        Ok(())
    }

    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> ClusterResult<()> {
        self.record("wait_pod_ready", name);
        self.with_state(|s| {
            if s.ready_timeouts > 0 {
                s.ready_timeouts -= 1;
                return Err(ClusterError::Timeout(format!(
                    "pod {} not ready after {:?}",
                    name, timeout
                )));
            }
            if !s.pods.contains(name) {
                return Err(ClusterError::NotFound(name.to_string()));
            }
            Ok(())
        })
    }

    async fn watch_pod(&self, name: &str) -> ClusterResult<PodEventStream> {
        let events = vec![
            PodEvent {
                action: WatchAction::Added,
                pod: name.to_string(),
                phase: Some("Pending".to_string()),
            },
            PodEvent {
                action: WatchAction::Modified,
                pod: name.to_string(),
                phase: Some("Running".to_string()),
            },
        ];
        Ok(Box::pin(stream::iter(events)))
    }

    async fn list_volume_claims(&self) -> ClusterResult<Vec<String>> {
        Ok(self.with_state(|s| s.claims.iter().cloned().collect()))
    }

    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> ClusterResult<()> {
        self.record("create_volume_claim", &spec.name);
        self.with_state(|s| s.claims.insert(spec.name.clone()));
        Ok(())
    }

    async fn delete_volume_claim(&self, name: &str) -> ClusterResult<()> {
        self.record("delete_volume_claim", name);
        self.with_state(|s| s.claims.remove(name));
        Ok(())
    }

    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecSession> {
        self.record("exec", pod);
        // Outside the lock so the other forks can still use the fake.
        if self.with_state(|s| s.exec_panics.iter().any(|key| pod.ends_with(key.as_str()))) {
            panic!("exec crashed in {}", pod);
        }
        let (output, status) = self.with_state(|s| {
            s.execs.push((pod.to_string(), command.to_vec()));
            let status = s
                .raw_status
                .iter()
                .find(|(key, _)| pod.ends_with(key.as_str()))
                .map(|(_, raw)| raw.clone())
                .unwrap_or_else(|| {
                    let code = s
                        .exit_codes
                        .iter()
                        .find(|(key, _)| pod.ends_with(key.as_str()))
                        .map(|(_, code)| *code)
                        .unwrap_or(0);
                    status_for(code)
                });
            (s.output.clone(), status)
        });

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(status));
        Ok(ExecSession {
            stdout: Box::pin(stream::iter(output)),
            status: rx,
        })
    }

    async fn copy_from_pod(&self, pod: &str, _remote: &Path, local: &Path) -> ClusterResult<()> {
        self.record("copy_from_pod", pod);
        if self.with_state(|s| s.copy_fails) {
            return Err(ClusterError::CopyFailed(format!("{}: connection reset", pod)));
        }
        if self.with_state(|s| s.no_results) {
            return Ok(());
        }

        let with_results = local.join("test");
        std::fs::create_dir_all(&with_results)?;
        std::fs::write(with_results.join("results.bin"), b"bin")?;
        std::fs::write(
            with_results.join("TEST-a.B.xml"),
            r#"<testsuite><testcase classname="a.B" name="c" time="1.5"/></testsuite>"#,
        )?;
        std::fs::create_dir_all(local.join("binary"))?;
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()> {
        self.record("create_job", &spec.name);
        self.with_state(|s| s.jobs.insert(spec.name.clone()));
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        self.record("delete_job", name);
        self.with_state(|s| s.jobs.remove(name));
        Ok(())
    }

    async fn job_exists(&self, name: &str) -> ClusterResult<bool> {
        self.record("job_exists", name);
        Ok(self.with_state(|s| {
            if s.job_linger_polls > 0 {
                s.job_linger_polls -= 1;
                return true;
            }
            s.jobs.contains(name)
        }))
    }
}
