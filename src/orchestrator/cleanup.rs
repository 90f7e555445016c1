//! Tracking of cluster resources that must not outlive the run.
//!
//! Every pod, claim and job the run creates is wrapped in a
//! [`ResourceGuard`] and recorded in a process-wide [`CleanupRegistry`].
//!
//! - Orderly teardown calls [`ResourceGuard::release`], which deletes the
//!   resource and forgets it.
//! - A guard dropped while still armed (a panicking or cancelled fork task)
//!   spawns a best-effort delete on the current runtime.
//! - On Ctrl-C the CLI calls [`CleanupRegistry::drain`] to delete whatever
//!   is still recorded before exiting.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterResult};
use crate::identity::RunIdentity;

/// Kind of cluster resource under guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Pod,
    VolumeClaim,
    Job,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pod => f.write_str("pod"),
            ResourceKind::VolumeClaim => f.write_str("pvc"),
            ResourceKind::Job => f.write_str("job"),
        }
    }
}

async fn delete(cluster: &dyn ClusterClient, kind: ResourceKind, name: &str) -> ClusterResult<()> {
    match kind {
        ResourceKind::Pod => cluster.delete_pod(name).await,
        ResourceKind::VolumeClaim => cluster.delete_volume_claim(name).await,
        ResourceKind::Job => cluster.delete_job(name).await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resources created by this process and not yet deleted.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    resources: Arc<Mutex<BTreeSet<(ResourceKind, String)>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ResourceKind, name: &str) {
        lock(&self.resources).insert((kind, name.to_string()));
    }

    pub fn unregister(&self, kind: ResourceKind, name: &str) {
        lock(&self.resources).remove(&(kind, name.to_string()));
    }

    /// Everything still recorded, pods first.
    pub fn pending(&self) -> Vec<(ResourceKind, String)> {
        lock(&self.resources).iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.resources).is_empty()
    }

    /// Deletes every recorded resource. Failures are logged and skipped.
    ///
    /// Returns the number of resources deleted.
    pub async fn drain(&self, cluster: &dyn ClusterClient) -> usize {
        let pending = std::mem::take(&mut *lock(&self.resources));
        let mut deleted = 0;
        for (kind, name) in pending {
            info!("Deleting {}: {}", kind, name);
            match delete(cluster, kind, &name).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete {} {}: {}", kind, name, e),
            }
        }
        deleted
    }
}

/// Owns one cluster resource until it is released.
pub struct ResourceGuard {
    kind: ResourceKind,
    name: String,
    registry: CleanupRegistry,
    cluster: Arc<dyn ClusterClient>,
    armed: bool,
}

impl ResourceGuard {
    /// Records `name` in the registry and arms the guard.
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        registry: CleanupRegistry,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let name = name.into();
        registry.register(kind, &name);
        Self {
            kind,
            name,
            registry,
            cluster,
            armed: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Deletes the resource now.
    ///
    /// The guard is disarmed even if the delete fails; the error is
    /// returned for the caller to log.
    pub async fn release(mut self) -> ClusterResult<()> {
        self.armed = false;
        self.registry.unregister(self.kind, &self.name);
        delete(self.cluster.as_ref(), self.kind, &self.name).await
    }

    /// Forgets the resource without deleting it.
    pub fn disarm(mut self) {
        self.armed = false;
        self.registry.unregister(self.kind, &self.name);
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        // Without a runtime the entry stays registered for `drain`.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let kind = self.kind;
        let name = std::mem::take(&mut self.name);
        let registry = self.registry.clone();
        let cluster = Arc::clone(&self.cluster);
        debug!("Guard for {} {} dropped while armed, deleting", kind, name);
        handle.spawn(async move {
            match delete(cluster.as_ref(), kind, &name).await {
                Ok(()) => registry.unregister(kind, &name),
                Err(e) => warn!("Failed to delete {} {}: {}", kind, name, e),
            }
        });
    }
}

/// Deletes every pod and volume claim of any run sharing `identity`'s
/// stable id. Best effort; returns the number of resources deleted.
pub async fn delete_run_resources(cluster: &dyn ClusterClient, identity: &RunIdentity) -> usize {
    let mut owned: Vec<(ResourceKind, String)> = Vec::new();
    match cluster.list_pods().await {
        Ok(pods) => owned.extend(
            pods.into_iter()
                .filter(|p| identity.owns(p))
                .map(|p| (ResourceKind::Pod, p)),
        ),
        Err(e) => warn!("Could not list pods: {}", e),
    }
    match cluster.list_volume_claims().await {
        Ok(claims) => owned.extend(
            claims
                .into_iter()
                .filter(|c| identity.owns(c))
                .map(|c| (ResourceKind::VolumeClaim, c)),
        ),
        Err(e) => warn!("Could not list volume claims: {}", e),
    }

    let mut deleted = 0;
    for (kind, name) in owned {
        info!("Deleting {}: {}", kind, name);
        match delete(cluster, kind, &name).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!("Failed to delete {} {}: {}", kind, name, e),
        }
    }
    deleted
}

/// Pods whose forks have not finished yet, for progress diagnostics.
#[derive(Debug, Clone, Default)]
pub struct RemainingPods {
    pods: Arc<Mutex<BTreeSet<String>>>,
}

impl RemainingPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: &str) {
        lock(&self.pods).insert(pod.to_string());
    }

    pub fn remove(&self, pod: &str) {
        lock(&self.pods).remove(pod);
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.pods).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.pods).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pods).is_empty()
    }
}
