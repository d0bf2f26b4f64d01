//! Replicated pod sets running the MongoDB processes.
//!
//! Manifest construction belongs to the [`WorkloadApplier`]; the engine only
//! supplies the set layout, security mounts and agent environment.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::control_plane::MemoryControlPlane;
use crate::error::OperatorResult;

/// Environment variable with the control plane URL.
pub const ENV_BASE_URL: &str = "BASE_URL";
/// Environment variable with the project ID.
pub const ENV_PROJECT_ID: &str = "GROUP_ID";
/// Environment variable with the agent API key.
pub const ENV_AGENT_API_KEY: &str = "AGENT_API_KEY";

/// Desired state of one replicated set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRequest {
    /// Namespace of the resource.
    pub namespace: String,
    /// Set name.
    pub set_name: String,
    /// Headless service name.
    pub service_name: String,
    /// Declared replicas.
    pub replicas: u32,
    /// Hostnames of the declared replicas.
    pub hostnames: Vec<String>,
    /// Secret with server certificates, when TLS is enabled.
    pub certificate_secret: Option<String>,
    /// Secret with member certificates, when internal cluster auth is x509.
    pub cluster_file_secret: Option<String>,
    /// Agent environment.
    pub environment: BTreeMap<String, String>,
}

impl WorkloadRequest {
    /// Whether pods mount server certificates.
    #[must_use]
    pub const fn tls_enabled(&self) -> bool {
        self.certificate_secret.is_some()
    }
}

/// Observed state of a replicated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadState {
    /// Replicas the set is scaled to.
    pub replicas: u32,
    /// Replicas reporting ready.
    pub ready_replicas: u32,
    /// Whether pods mount server certificates.
    pub tls_enabled: bool,
}

impl WorkloadState {
    /// Whether every replica is ready.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready_replicas == self.replicas
    }
}

/// Applies replicated sets to the cluster.
#[async_trait]
pub trait WorkloadApplier: Send + Sync {
    /// Current state of a set; `None` when it does not exist.
    async fn current(&self, namespace: &str, set_name: &str)
        -> OperatorResult<Option<WorkloadState>>;

    /// Create or update a set and report its state.
    async fn apply(&self, request: WorkloadRequest) -> OperatorResult<WorkloadState>;

    /// Delete a set, returning whether it existed.
    async fn delete(&self, namespace: &str, set_name: &str) -> OperatorResult<bool>;
}

/// Workload applier that keeps sets in memory.
///
/// Sets become ready as soon as they are applied unless readiness is
/// switched off. When attached to a [`MemoryControlPlane`], applying a set
/// registers an automation agent on each of its hosts, as starting pods do.
#[derive(Debug, Clone)]
pub struct MemoryWorkload {
    sets: Arc<RwLock<HashMap<String, WorkloadState>>>,
    applied: Arc<RwLock<Vec<WorkloadRequest>>>,
    ready: Arc<AtomicBool>,
    agents: Option<MemoryControlPlane>,
}

impl Default for MemoryWorkload {
    fn default() -> Self {
        Self {
            sets: Arc::default(),
            applied: Arc::default(),
            ready: Arc::new(AtomicBool::new(true)),
            agents: None,
        }
    }
}

impl MemoryWorkload {
    /// An empty workload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register agents with `control_plane` whenever a set is applied.
    #[must_use]
    pub fn registering_agents_with(mut self, control_plane: MemoryControlPlane) -> Self {
        self.agents = Some(control_plane);
        self
    }

    /// Whether applied replicas become ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Every request applied so far, oldest first.
    pub async fn applied(&self) -> Vec<WorkloadRequest> {
        self.applied.read().await.clone()
    }
}

fn set_key(namespace: &str, set_name: &str) -> String {
    format!("{namespace}/{set_name}")
}

#[async_trait]
impl WorkloadApplier for MemoryWorkload {
    async fn current(
        &self,
        namespace: &str,
        set_name: &str,
    ) -> OperatorResult<Option<WorkloadState>> {
        let sets = self.sets.read().await;
        Ok(sets.get(&set_key(namespace, set_name)).copied())
    }

    async fn apply(&self, request: WorkloadRequest) -> OperatorResult<WorkloadState> {
        if let Some(control_plane) = &self.agents {
            control_plane.register_agents(&request.hostnames).await;
        }

        let key = set_key(&request.namespace, &request.set_name);
        let mut sets = self.sets.write().await;
        let previous_ready = sets.get(&key).map_or(0, |s| s.ready_replicas);
        let ready_replicas = if self.ready.load(Ordering::SeqCst) {
            request.replicas
        } else {
            previous_ready.min(request.replicas)
        };
        let state = WorkloadState {
            replicas: request.replicas,
            ready_replicas,
            tls_enabled: request.tls_enabled(),
        };
        sets.insert(key, state);
        debug!(set = %request.set_name, replicas = request.replicas, "applied workload");
        self.applied.write().await.push(request);
        Ok(state)
    }

    async fn delete(&self, namespace: &str, set_name: &str) -> OperatorResult<bool> {
        let mut sets = self.sets.write().await;
        Ok(sets.remove(&set_key(namespace, set_name)).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::control_plane::ControlPlane;

    fn request(replicas: u32) -> WorkloadRequest {
        WorkloadRequest {
            namespace: "ns".to_owned(),
            set_name: "rs".to_owned(),
            service_name: "rs-svc".to_owned(),
            replicas,
            hostnames: (0..replicas).map(|i| format!("rs-{i}.rs-svc")).collect(),
            certificate_secret: None,
            cluster_file_secret: None,
            environment: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn readiness_can_lag() {
        let workload = MemoryWorkload::new();
        assert!(workload.current("ns", "rs").await.unwrap().is_none());

        let state = workload.apply(request(3)).await.unwrap();
        assert!(state.is_ready());

        workload.set_ready(false);
        let state = workload.apply(request(5)).await.unwrap();
        assert_eq!(state.ready_replicas, 3);
        assert!(!state.is_ready());

        assert!(workload.delete("ns", "rs").await.unwrap());
        assert_eq!(workload.applied().await.len(), 2);
    }

    #[tokio::test]
    async fn applying_registers_agents() {
        let control_plane = MemoryControlPlane::new();
        let project = control_plane.seed_project("p").await;
        let workload = MemoryWorkload::new().registering_agents_with(control_plane.clone());
        workload.apply(request(2)).await.unwrap();

        let agents = control_plane.read_automation_agents(&project, 1).await.unwrap();
        assert_eq!(agents.results.len(), 2);
    }
}
