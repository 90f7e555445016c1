//! Cluster abstraction for provisioning and driving test pods.
//!
//! The execution engine never talks to Kubernetes directly. It goes through
//! [`ClusterClient`], which exposes exactly the operations a fork needs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ClusterClient                           │
//! │                                                              │
//! │  create_volume_claim / delete_volume_claim                   │
//! │  create_pod / delete_pod / pod_exists / list_pods            │
//! │  wait_pod_ready(timeout)                                     │
//! │  watch_pod ─────────► PodEventStream   (diagnostics only)    │
//! │  exec ──────────────► ExecSession                            │
//! │                         ├── stdout: LineStream               │
//! │                         └── status: oneshot (raw Status doc) │
//! │  copy_from_pod(remote dir, local dir)                        │
//! │  create_job / delete_job / job_exists  (pre-warm pool only)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The shipped implementation is [`kubectl::KubectlCluster`], which shells
//! out to `kubectl`. Specs in this module render to plain Kubernetes
//! manifests with [`PodSpec::to_manifest`] and friends, so any client that
//! accepts manifests can reuse them.

pub mod kubectl;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by cluster operations.
///
/// Every variant is treated as transient by the fork retry loop; only the
/// caller decides when an error is final.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Creating a pod, claim or job failed.
    #[error("Failed to create resource: {0}")]
    CreateFailed(String),

    /// Deleting a resource failed.
    #[error("Failed to delete resource: {0}")]
    DeleteFailed(String),

    /// The exec channel could not be opened or failed mid-stream.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// Copying files out of a pod failed.
    #[error("Failed to copy from pod: {0}")]
    CopyFailed(String),

    /// The named resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A bounded wait expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The cluster API could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("Cluster error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A stream of output lines from an exec session.
pub type LineStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A stream of status changes for a pod.
pub type PodEventStream = Pin<Box<dyn Stream<Item = PodEvent> + Send>>;

/// A running command inside a pod.
///
/// `stdout` yields lines until the exec channel closes. `status` resolves
/// once, on close, with the raw contents of the status ("error") channel.
/// An empty payload means the command exited cleanly; otherwise it is a
/// Kubernetes `Status` document, decoded by
/// [`crate::orchestrator::exec_status::decode_exit_code`].
pub struct ExecSession {
    pub stdout: LineStream,
    pub status: oneshot::Receiver<ClusterResult<Vec<u8>>>,
}

/// Kind of watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
    Error,
}

impl WatchAction {
    /// Parses the `type` field of a watch event.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A pod status change observed through a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub action: WatchAction,
    pub pod: String,
    pub phase: Option<String>,
}

impl fmt::Display for PodEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[StatusChange]  pod {} {} ({})",
            self.pod,
            self.action,
            self.phase.as_deref().unwrap_or("Unknown")
        )
    }
}

/// A node taint the test pods tolerate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Toleration {
    pub key: String,

    #[serde(default = "default_toleration_operator")]
    pub operator: String,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub effect: Option<String>,
}

fn default_toleration_operator() -> String {
    "Equal".to_string()
}

impl Toleration {
    fn to_manifest(&self) -> Value {
        let mut t = json!({ "key": self.key, "operator": self.operator });
        if let Some(value) = &self.value {
            t["value"] = json!(value);
        }
        if let Some(effect) = &self.effect {
            t["effect"] = json!(effect);
        }
        t
    }
}

/// Host directory shared between pods on a node (build cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPathMount {
    pub volume_name: String,
    pub host_path: String,
    pub mount_path: String,
}

/// Claim-backed volume holding the test reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMount {
    pub volume_name: String,
    pub claim_name: String,
    pub mount_path: String,
}

/// Everything needed to create one test pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub image: String,
    /// Container entrypoint; keeps the pod alive until the build is exec'd.
    pub command: Vec<String>,
    /// CPU request, e.g. `"4"`.
    pub cpu: String,
    /// Memory request, e.g. `"6Gi"`.
    pub memory: String,
    pub env: Vec<(String, String)>,
    pub cache: HostPathMount,
    pub results: ClaimMount,
    pub image_pull_secret: Option<String>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl PodSpec {
    /// Renders the pod as a Kubernetes manifest.
    pub fn to_manifest(&self, namespace: &str) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut spec = json!({
            "restartPolicy": "Never",
            "volumes": [
                {
                    "name": self.cache.volume_name,
                    "hostPath": { "path": self.cache.host_path, "type": "DirectoryOrCreate" }
                },
                {
                    "name": self.results.volume_name,
                    "persistentVolumeClaim": { "claimName": self.results.claim_name }
                }
            ],
            "containers": [{
                "name": self.name,
                "image": self.image,
                "command": self.command,
                "env": env,
                "resources": {
                    "requests": { "cpu": self.cpu, "memory": self.memory }
                },
                "volumeMounts": [
                    { "name": self.cache.volume_name, "mountPath": self.cache.mount_path },
                    { "name": self.results.volume_name, "mountPath": self.results.mount_path }
                ]
            }]
        });

        if let Some(secret) = &self.image_pull_secret {
            spec["imagePullSecrets"] = json!([{ "name": secret }]);
        }
        if !self.tolerations.is_empty() {
            spec["tolerations"] =
                Value::Array(self.tolerations.iter().map(Toleration::to_manifest).collect());
        }
        if !self.node_selector.is_empty() {
            spec["nodeSelector"] = json!(self.node_selector);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels
            },
            "spec": spec
        })
    }
}

/// A persistent volume claim for one fork's reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimSpec {
    pub name: String,
    /// Requested storage, e.g. `"100Mi"`.
    pub storage: String,
    pub labels: BTreeMap<String, String>,
}

impl VolumeClaimSpec {
    /// Renders the claim as a Kubernetes manifest.
    pub fn to_manifest(&self, namespace: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": { "requests": { "storage": self.storage } }
            }
        })
    }
}

/// A job of placeholder pods that reserve capacity ahead of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub parallelism: usize,
    pub cpu: String,
    pub memory: String,
    pub command: Vec<String>,
    pub image_pull_secret: Option<String>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl JobSpec {
    /// Renders the job as a Kubernetes manifest.
    pub fn to_manifest(&self, namespace: &str) -> Value {
        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": "placeholder",
                "image": self.image,
                "command": self.command,
                "resources": {
                    "requests": { "cpu": self.cpu, "memory": self.memory }
                }
            }]
        });
        if let Some(secret) = &self.image_pull_secret {
            pod_spec["imagePullSecrets"] = json!([{ "name": secret }]);
        }
        if !self.tolerations.is_empty() {
            pod_spec["tolerations"] =
                Value::Array(self.tolerations.iter().map(Toleration::to_manifest).collect());
        }
        if !self.node_selector.is_empty() {
            pod_spec["nodeSelector"] = json!(self.node_selector);
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
                "labels": self.labels
            },
            "spec": {
                "parallelism": self.parallelism,
                "completions": self.parallelism,
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": pod_spec
                }
            }
        })
    }
}

/// Operations the execution engine needs from a cluster.
///
/// All methods are scoped to the client's namespace. Implementations must
/// be shareable across fork tasks.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// The namespace every operation targets.
    fn namespace(&self) -> &str;

    /// Names of all pods in the namespace.
    async fn list_pods(&self) -> ClusterResult<Vec<String>>;

    /// Whether a pod with this name currently exists.
    async fn pod_exists(&self, name: &str) -> ClusterResult<bool>;

    /// Creates a pod. Fails if the name is taken.
    async fn create_pod(&self, spec: &PodSpec) -> ClusterResult<()>;

    /// Requests deletion of a pod. Deleting a missing pod succeeds.
    async fn delete_pod(&self, name: &str) -> ClusterResult<()>;

    /// Waits until the pod reports ready, failing with
    /// [`ClusterError::Timeout`] after `timeout`.
    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> ClusterResult<()>;

    /// Streams status changes of a pod until the stream is dropped.
    async fn watch_pod(&self, name: &str) -> ClusterResult<PodEventStream>;

    /// Names of all volume claims in the namespace.
    async fn list_volume_claims(&self) -> ClusterResult<Vec<String>>;

    /// Creates a persistent volume claim.
    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> ClusterResult<()>;

    /// Requests deletion of a claim. Deleting a missing claim succeeds.
    async fn delete_volume_claim(&self, name: &str) -> ClusterResult<()>;

    /// Starts `command` inside the pod's container.
    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecSession>;

    /// Copies the directory `remote` out of the pod into `local`.
    async fn copy_from_pod(&self, pod: &str, remote: &Path, local: &Path) -> ClusterResult<()>;

    /// Creates a job.
    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()>;

    /// Requests deletion of a job and its pods.
    async fn delete_job(&self, name: &str) -> ClusterResult<()>;

    /// Whether a job with this name currently exists.
    async fn job_exists(&self, name: &str) -> ClusterResult<bool>;
}
