//! Common test utilities for reconciliation integration tests.

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use mongodb_operator::{
    Collaborators, DeclaredSpec, DeploymentDocument, MemoryCertificateAuthority,
    MemoryControlPlane, MemorySecrets, MemoryStatusStore, MemoryWorkload, ObservedStatus,
    OperatorConfig, ProjectId, ProjectMutexes, Reconciler, StatusStore, WorkloadApplier,
};

/// Reconciler wired to in-memory collaborators the test can inspect.
pub struct TestOperator {
    pub control_plane: MemoryControlPlane,
    pub certificate_authority: MemoryCertificateAuthority,
    pub secrets: MemorySecrets,
    pub workload: MemoryWorkload,
    pub status: MemoryStatusStore,
    pub mutexes: Arc<ProjectMutexes>,
    pub reconciler: Reconciler,
}

impl TestOperator {
    /// Creates an operator with no delays and an auto-approving CA.
    pub fn new() -> Self {
        Self::with_control_plane(MemoryControlPlane::new())
    }

    /// Creates an operator whose control plane answers after `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_control_plane(MemoryControlPlane::new().with_latency(latency))
    }

    fn with_control_plane(control_plane: MemoryControlPlane) -> Self {
        let certificate_authority = MemoryCertificateAuthority::auto_approving();
        let secrets = MemorySecrets::new();
        let workload = MemoryWorkload::new().registering_agents_with(control_plane.clone());
        let status = MemoryStatusStore::new();
        let mutexes = Arc::new(ProjectMutexes::new());
        let reconciler = Reconciler::new(
            OperatorConfig::without_delays(),
            Collaborators {
                control_plane: Arc::new(control_plane.clone()),
                certificate_authority: Arc::new(certificate_authority.clone()),
                secrets: Arc::new(secrets.clone()),
                workload: Arc::new(workload.clone()),
                status: Arc::new(status.clone()),
            },
            Arc::clone(&mutexes),
        );

        Self {
            control_plane,
            certificate_authority,
            secrets,
            workload,
            status,
            mutexes,
            reconciler,
        }
    }

    /// A second reconciler sharing collaborators and project mutexes, with
    /// `workload` in place of the recorded one.
    pub fn reconciler_with_workload(&self, workload: Arc<dyn WorkloadApplier>) -> Reconciler {
        Reconciler::new(
            OperatorConfig::without_delays(),
            Collaborators {
                control_plane: Arc::new(self.control_plane.clone()),
                certificate_authority: Arc::new(self.certificate_authority.clone()),
                secrets: Arc::new(self.secrets.clone()),
                workload,
                status: Arc::new(self.status.clone()),
            },
            Arc::clone(&self.mutexes),
        )
    }

    /// ID of the project `spec` belongs to; panics if it was never created.
    pub async fn project_id(&self, spec: &DeclaredSpec) -> ProjectId {
        self.control_plane
            .project_named(&spec.project.project_name)
            .await
            .expect("project exists")
            .id
    }

    /// Current deployment document of the project `spec` belongs to.
    pub async fn document(&self, spec: &DeclaredSpec) -> DeploymentDocument {
        let project = self.project_id(spec).await;
        self.control_plane.document(&project).await
    }

    /// Every document published to the project `spec` belongs to.
    pub async fn history(&self, spec: &DeclaredSpec) -> Vec<DeploymentDocument> {
        let project = self.project_id(spec).await;
        self.control_plane.history(&project).await
    }

    /// Persisted status of `spec`.
    pub async fn status_of(&self, spec: &DeclaredSpec) -> ObservedStatus {
        self.status
            .get(&spec.key())
            .await
            .unwrap()
            .expect("status was written")
            .status
    }
}

impl Default for TestOperator {
    fn default() -> Self {
        Self::new()
    }
}
