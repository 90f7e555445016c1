//! Capacity reservation ahead of a run.
//!
//! A [`PreWarmPool`] asks the cluster for a job of placeholder pods with the
//! same resource requests as the real forks. Scheduling them makes the node
//! autoscaler add capacity while the build image is still being prepared.
//! Tearing the pool down releases that capacity just before the forks are
//! requested.
//!
//! # Example
//!
//! ```ignore
//! let pool = PreWarmPool::start(cluster.clone(), spec, registry.clone()).await?;
//! // ... build and push the test image ...
//! pool.tear_down(Duration::from_secs(600)).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tracing::{info, warn};

use super::cleanup::{CleanupRegistry, ResourceGuard, ResourceKind};
use super::worker::WorkerSettings;
use crate::cluster::{ClusterClient, ClusterError, ClusterResult, JobSpec};
use crate::identity::{RUN_LABEL, RunIdentity};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Placeholder job requesting the same resources as `pods` forks.
pub fn prewarm_spec(identity: &RunIdentity, settings: &WorkerSettings, pods: usize) -> JobSpec {
    JobSpec {
        name: identity.prewarm_job_name(),
        image: settings.image.clone(),
        parallelism: pods,
        cpu: settings.cpu.clone(),
        memory: settings.memory.clone(),
        command: vec!["sleep".to_string(), "infinity".to_string()],
        image_pull_secret: settings.image_pull_secret.clone(),
        tolerations: settings.tolerations.clone(),
        node_selector: settings.node_selector.clone(),
        labels: BTreeMap::from([(RUN_LABEL.to_string(), identity.stable_id().to_string())]),
    }
}

/// A running job of placeholder pods.
pub struct PreWarmPool {
    cluster: Arc<dyn ClusterClient>,
    job: ResourceGuard,
    pods: usize,
}

impl PreWarmPool {
    /// Creates the placeholder job.
    pub async fn start(
        cluster: Arc<dyn ClusterClient>,
        spec: JobSpec,
        registry: CleanupRegistry,
    ) -> ClusterResult<Self> {
        info!(
            "Pre-warming {} pods with job {}",
            spec.parallelism, spec.name
        );
        cluster.create_job(&spec).await?;
        let job = ResourceGuard::new(
            ResourceKind::Job,
            &spec.name,
            registry,
            Arc::clone(&cluster),
        );
        Ok(Self {
            cluster,
            job,
            pods: spec.parallelism,
        })
    }

    pub fn job_name(&self) -> &str {
        self.job.name()
    }

    /// Number of placeholder pods requested.
    pub fn len(&self) -> usize {
        self.pods
    }

    pub fn is_empty(&self) -> bool {
        self.pods == 0
    }

    /// Deletes the job and waits until the cluster reports it gone.
    ///
    /// Fails with [`ClusterError::Timeout`] if the job is still present
    /// after `timeout`.
    pub async fn tear_down(self, timeout: Duration) -> ClusterResult<()> {
        let name = self.job.name().to_string();
        info!("Tearing down pre-warm job {}", name);
        self.job.release().await?;

        let deadline = Instant::now() + timeout;
        loop {
            match self.cluster.job_exists(&name).await {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(e) => warn!("Could not check pre-warm job {}: {}", name, e),
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!(
                    "pre-warm job {} still present after {:?}",
                    name, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
