//! Cluster client that shells out to `kubectl`.
//!
//! Every operation is a `kubectl` invocation scoped with `--namespace`
//! (and `--context` when configured). Manifests are rendered from the
//! specs in [`crate::cluster`] and piped to `kubectl create -f -`.
//!
//! `kubectl exec` has no status channel of its own; the remote exit code
//! surfaces as kubectl's exit code together with a
//! `command terminated with exit code N` line on stderr. The client turns
//! that back into the Kubernetes `Status` document a websocket exec would
//! have delivered, so callers decode one format regardless of transport.
//!
//! # Example Configuration
//!
//! ```toml
//! [cluster]
//! kubectl = "/usr/local/bin/kubectl"
//! context = "ci-cluster"
//! namespace = "thisisatest"
//! ```

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{
    ClusterClient, ClusterError, ClusterResult, ExecSession, JobSpec, LineStream, PodEvent,
    PodEventStream, PodSpec, VolumeClaimSpec, WatchAction,
};

static EXIT_CODE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"command terminated with exit code (\d+)").ok());

/// Extra time granted to `kubectl wait` beyond its own `--timeout`.
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// [`ClusterClient`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    program: String,
    namespace: String,
    context: Option<String>,
}

impl KubectlCluster {
    /// Creates a client for `namespace`, invoking `program` (usually
    /// `"kubectl"`).
    pub fn new(program: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            namespace: namespace.into(),
            context: None,
        }
    }

    /// Uses a specific kubeconfig context instead of the current one.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("--namespace").arg(&self.namespace);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs kubectl to completion and returns stdout.
    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.program, e))?;

        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Pipes a manifest into `kubectl create -f -`.
    async fn create(&self, manifest: &Value) -> Result<(), String> {
        let body = serde_json::to_vec(manifest).map_err(|e| e.to_string())?;

        let mut child = self
            .command()
            .args(["create", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to run {}: {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&body).await.map_err(|e| e.to_string())?;
        }

        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(())
    }

    async fn names(&self, kind: &str) -> ClusterResult<Vec<String>> {
        let stdout = self
            .run(&["get", kind, "-o", "jsonpath={.items[*].metadata.name}"])
            .await
            .map_err(ClusterError::Connection)?;
        Ok(stdout.split_whitespace().map(str::to_string).collect())
    }

    async fn exists(&self, kind: &str, name: &str) -> ClusterResult<bool> {
        let stdout = self
            .run(&["get", kind, name, "--ignore-not-found", "-o", "name"])
            .await
            .map_err(ClusterError::Connection)?;
        Ok(!stdout.trim().is_empty())
    }

    async fn delete(&self, kind: &str, name: &str) -> ClusterResult<()> {
        self.run(&["delete", kind, name, "--ignore-not-found", "--wait=false"])
            .await
            .map_err(|e| ClusterError::DeleteFailed(format!("{} {}: {}", kind, name, e)))?;
        Ok(())
    }
}

/// Builds the `Status` document for a finished `kubectl exec`.
///
/// Returns `None` when kubectl itself failed rather than the remote
/// command.
fn exec_status_document(exit_code: Option<i32>, stderr: &str) -> Option<Vec<u8>> {
    if exit_code == Some(0) {
        return Some(Vec::new());
    }

    let remote_code = EXIT_CODE_PATTERN
        .as_ref()?
        .captures(stderr)?
        .get(1)?
        .as_str()
        .to_string();

    let status = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "reason": "NonZeroExitCode",
        "message": format!("command terminated with non-zero exit code: {}", remote_code),
        "details": {
            "causes": [{ "reason": "ExitCode", "message": remote_code }]
        }
    });
    serde_json::to_vec(&status).ok()
}

/// Splits output into lines, replacing invalid UTF-8 instead of stopping.
///
/// Ends at end of input or at the first read error.
fn lossy_lines<R>(reader: R) -> LineStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(futures::stream::unfold(reader, |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((String::from_utf8_lossy(&buf).into_owned(), reader))
            }
        }
    }))
}

/// Parses one line of `kubectl get pod --watch --output-watch-events`
/// rendered with the jsonpath `{.type} {.object.metadata.name} {.object.status.phase}`.
fn parse_watch_line(line: &str) -> Option<PodEvent> {
    let mut parts = line.split_whitespace();
    let action = WatchAction::parse(parts.next()?)?;
    let pod = parts.next()?.to_string();
    let phase = parts.next().map(str::to_string);
    Some(PodEvent { action, pod, phase })
}

#[async_trait]
impl ClusterClient for KubectlCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_pods(&self) -> ClusterResult<Vec<String>> {
        self.names("pods").await
    }

    async fn pod_exists(&self, name: &str) -> ClusterResult<bool> {
        self.exists("pod", name).await
    }

    async fn create_pod(&self, spec: &PodSpec) -> ClusterResult<()> {
        debug!("Creating pod {}", spec.name);
        self.create(&spec.to_manifest(&self.namespace))
            .await
            .map_err(|e| ClusterError::CreateFailed(format!("pod {}: {}", spec.name, e)))
    }

    async fn delete_pod(&self, name: &str) -> ClusterResult<()> {
        self.delete("pod", name).await
    }

    async fn wait_pod_ready(&self, name: &str, timeout: Duration) -> ClusterResult<()> {
        let target = format!("pod/{}", name);
        let limit = format!("--timeout={}s", timeout.as_secs().max(1));
        let args = ["wait", "--for=condition=Ready", target.as_str(), limit.as_str()];

        match tokio::time::timeout(timeout + WAIT_GRACE, self.run(&args)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.contains("timed out") => Err(ClusterError::Timeout(format!(
                "pod {} not ready after {:?}",
                name, timeout
            ))),
            Ok(Err(e)) if e.contains("NotFound") || e.contains("not found") => {
                Err(ClusterError::NotFound(format!("pod {}", name)))
            }
            Ok(Err(e)) => Err(ClusterError::Connection(e)),
            Err(_) => Err(ClusterError::Timeout(format!(
                "pod {} not ready after {:?}",
                name, timeout
            ))),
        }
    }

    async fn watch_pod(&self, name: &str) -> ClusterResult<PodEventStream> {
        let mut child = self
            .command()
            .args([
                "get",
                "pod",
                name,
                "--watch",
                "--output-watch-events",
                "-o",
                r#"jsonpath={.type} {.object.metadata.name} {.object.status.phase}{"\n"}"#,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Connection("watch stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Owning the child here ties the watch process to the receiver.
            let _child = child;
            let mut lines = lossy_lines(BufReader::new(stdout));
            while let Some(line) = lines.next().await {
                if let Some(event) = parse_watch_line(&line)
                    && tx.send(event).await.is_err()
                {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_volume_claims(&self) -> ClusterResult<Vec<String>> {
        self.names("pvc").await
    }

    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> ClusterResult<()> {
        debug!("Creating volume claim {}", spec.name);
        self.create(&spec.to_manifest(&self.namespace))
            .await
            .map_err(|e| ClusterError::CreateFailed(format!("pvc {}: {}", spec.name, e)))
    }

    async fn delete_volume_claim(&self, name: &str) -> ClusterResult<()> {
        self.delete("pvc", name).await
    }

    async fn exec(&self, pod: &str, command: &[String]) -> ClusterResult<ExecSession> {
        let mut child = self
            .command()
            .arg("exec")
            .arg(pod)
            .arg("--")
            .args(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClusterError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::ExecFailed("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClusterError::ExecFailed("stderr not captured".to_string()))?;

        let (status_tx, status_rx) = oneshot::channel();
        let pod_name = pod.to_string();
        tokio::spawn(async move {
            let mut raw = Vec::new();
            let _ = stderr.read_to_end(&mut raw).await;
            let captured = String::from_utf8_lossy(&raw);

            let outcome = match child.wait().await {
                Ok(status) => exec_status_document(status.code(), &captured).ok_or_else(|| {
                    ClusterError::ExecFailed(format!(
                        "exec in pod {} failed ({}): {}",
                        pod_name,
                        status,
                        captured.trim()
                    ))
                }),
                Err(e) => Err(ClusterError::Io(e)),
            };
            let _ = status_tx.send(outcome);
        });

        Ok(ExecSession {
            stdout: lossy_lines(BufReader::new(stdout)),
            status: status_rx,
        })
    }

    async fn copy_from_pod(&self, pod: &str, remote: &Path, local: &Path) -> ClusterResult<()> {
        tokio::fs::create_dir_all(local).await?;

        let source = format!("{}:{}", pod, remote.display());
        let destination = local.display().to_string();
        self.run(&["cp", &source, &destination])
            .await
            .map_err(|e| ClusterError::CopyFailed(format!("{} from {}: {}", remote.display(), pod, e)))?;
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> ClusterResult<()> {
        debug!("Creating job {} with parallelism {}", spec.name, spec.parallelism);
        self.create(&spec.to_manifest(&self.namespace))
            .await
            .map_err(|e| ClusterError::CreateFailed(format!("job {}: {}", spec.name, e)))
    }

    async fn delete_job(&self, name: &str) -> ClusterResult<()> {
        self.run(&[
            "delete",
            "job",
            name,
            "--ignore-not-found",
            "--wait=false",
            "--cascade=background",
        ])
        .await
        .map_err(|e| ClusterError::DeleteFailed(format!("job {}: {}", name, e)))?;
        Ok(())
    }

    async fn job_exists(&self, name: &str) -> ClusterResult<bool> {
        self.exists("job", name).await
    }
}
