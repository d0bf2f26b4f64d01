//! Integration tests for creating, resizing and deleting replica sets.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{fixtures::resized, fixtures::SpecBuilder, TestOperator};
use mongodb_operator::workload::{WorkloadRequest, WorkloadState, ENV_AGENT_API_KEY, ENV_PROJECT_ID};
use mongodb_operator::{
    ControlPlane, MemoryControlPlane, MemoryWorkload, OperatorResult, Phase, ProjectId,
    ReconcileOutcome, WorkloadApplier,
};

#[tokio::test]
async fn new_replica_set_is_published_once_and_runs() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();

    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);
    assert_eq!(report.outcome, ReconcileOutcome::Done);

    let document = operator.document(&spec).await;
    assert_eq!(document.version, 1);
    assert_eq!(document.processes.len(), 3);
    assert_eq!(document.replica_sets.len(), 1);
    assert_eq!(document.replica_set("my-rs").unwrap().members.len(), 3);
    assert_eq!(document.monitoring_versions.len(), 1);
    assert_eq!(document.backup_versions.len(), 3);

    let status = operator.status_of(&spec).await;
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(status.members, 3);
    assert_eq!(status.version, "6.0.5");
    assert!(status.message.is_none());
    assert!(status.last_transition.is_some());
    let project = operator.project_id(&spec).await;
    assert_eq!(
        status.link.as_deref(),
        Some(format!("http://ops-manager:8080/v2/{project}").as_str())
    );
}

#[tokio::test]
async fn pods_receive_agent_environment() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();
    operator.reconciler.reconcile(&spec).await;

    let applied = operator.workload.applied().await;
    let request = applied.last().unwrap();
    let project = operator.project_id(&spec).await;
    assert_eq!(request.environment[ENV_PROJECT_ID], project.to_string());
    assert!(!request.environment[ENV_AGENT_API_KEY].is_empty());
    assert_eq!(request.service_name, "my-rs-svc");
    assert_eq!(
        request.hostnames[0],
        "my-rs-0.my-rs-svc.mongodb.svc.cluster.local"
    );
    assert!(request.certificate_secret.is_none());
}

#[tokio::test]
async fn repeated_reconcile_publishes_nothing_new() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();

    operator.reconciler.reconcile(&spec).await;
    let before = operator.document(&spec).await;

    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok());
    assert_eq!(operator.history(&spec).await.len(), 1);
    assert!(operator.document(&spec).await.same_content(&before));
    assert_eq!(operator.control_plane.project_creates(), 1);
}

#[tokio::test]
async fn scale_down_unvotes_before_removing() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();
    operator.reconciler.reconcile(&spec).await;

    let smaller = resized(&spec, 2);
    let report = operator.reconciler.reconcile(&smaller).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);

    let history = operator.history(&spec).await;
    assert_eq!(history.len(), 3);

    // First the leaving member loses its vote while still in the set.
    let unvoted = history[1].replica_set("my-rs").unwrap();
    assert_eq!(unvoted.members.len(), 3);
    let leaving = unvoted.members.iter().find(|m| m.host == "my-rs-2").unwrap();
    assert!(!leaving.is_voting());
    assert_eq!(leaving.priority, 0.0);

    // Then it is removed.
    let removed = history[2].replica_set("my-rs").unwrap();
    assert_eq!(removed.member_names(), ["my-rs-0", "my-rs-1"]);
    assert!(history[2].process("my-rs-2").is_none());

    let versions: Vec<u64> = history.iter().map(|d| d.version).collect();
    assert_eq!(versions, [1, 2, 3]);

    let status = operator.status_of(&spec).await;
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(status.members, 2);

    let project = operator.project_id(&spec).await;
    let hosts = operator.control_plane.get_hosts(&project).await.unwrap();
    assert!(hosts.iter().all(|h| !h.hostname.starts_with("my-rs-2.")));
    assert_eq!(hosts.len(), 2);
}

/// Records how many processes the document held whenever a set was applied.
struct OrderProbe {
    inner: MemoryWorkload,
    control_plane: MemoryControlPlane,
    seen: Arc<Mutex<Vec<(u32, usize)>>>,
}

#[async_trait]
impl WorkloadApplier for OrderProbe {
    async fn current(
        &self,
        namespace: &str,
        set_name: &str,
    ) -> OperatorResult<Option<WorkloadState>> {
        self.inner.current(namespace, set_name).await
    }

    async fn apply(&self, request: WorkloadRequest) -> OperatorResult<WorkloadState> {
        let project = ProjectId::new(request.environment[ENV_PROJECT_ID].clone());
        let processes = self.control_plane.document(&project).await.processes.len();
        self.seen.lock().unwrap().push((request.replicas, processes));
        self.inner.apply(request).await
    }

    async fn delete(&self, namespace: &str, set_name: &str) -> OperatorResult<bool> {
        self.inner.delete(namespace, set_name).await
    }
}

#[tokio::test]
async fn document_shrinks_before_pods_and_pods_grow_before_document() {
    let operator = TestOperator::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let reconciler = operator.reconciler_with_workload(Arc::new(OrderProbe {
        inner: operator.workload.clone(),
        control_plane: operator.control_plane.clone(),
        seen: Arc::clone(&seen),
    }));
    let spec = SpecBuilder::replica_set("my-rs", 3).build();

    reconciler.reconcile(&spec).await;
    reconciler.reconcile(&resized(&spec, 5)).await;
    reconciler.reconcile(&resized(&spec, 2)).await;

    let seen = seen.lock().unwrap().clone();
    // Growing: pods first, the document still holds the old shape.
    assert_eq!(seen[0], (3, 0));
    assert_eq!(seen[1], (5, 3));
    // Shrinking: the document has already dropped the members.
    assert_eq!(seen[2], (2, 2));
}

#[tokio::test]
async fn pods_not_ready_requeue_quickly() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();
    operator.workload.set_ready(false);

    let report = operator.reconciler.reconcile(&spec).await;
    let retry = mongodb_operator::OperatorConfig::without_delays()
        .reconcile
        .workload_retry_delay();
    assert_eq!(report.outcome, ReconcileOutcome::RequeueAfter(retry));
    assert_eq!(report.status.phase(), Phase::Pending);
    assert!(report.status.message().unwrap().contains("my-rs not ready"));
    assert!(operator.history(&spec).await.is_empty());

    operator.workload.set_ready(true);
    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok());
}

#[tokio::test]
async fn delete_removes_processes_agents_and_pods() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).build();
    operator.reconciler.reconcile(&spec).await;

    operator.reconciler.delete(&spec).await.unwrap();

    let document = operator.document(&spec).await;
    assert!(document.processes.is_empty());
    assert!(document.replica_sets.is_empty());
    assert!(document.monitoring_versions.is_empty());
    assert!(document.backup_versions.is_empty());

    let project = operator.project_id(&spec).await;
    assert!(operator.control_plane.get_hosts(&project).await.unwrap().is_empty());
    assert!(operator
        .workload
        .current("mongodb", "my-rs")
        .await
        .unwrap()
        .is_none());

    // Deleting again is harmless.
    operator.reconciler.delete(&spec).await.unwrap();
}

#[tokio::test]
async fn standalone_runs_as_a_single_process() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::standalone("single").build();

    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);

    let document = operator.document(&spec).await;
    assert_eq!(document.processes.len(), 1);
    assert!(document.replica_sets.is_empty());
    assert_eq!(
        document.process("single").unwrap().hostname,
        "single-0.single-svc.mongodb.svc.cluster.local"
    );
    assert_eq!(operator.status_of(&spec).await.members, 1);
}

#[tokio::test]
async fn invalid_spec_is_not_retried() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).with_x509().build();

    let report = operator.reconciler.reconcile(&spec).await;
    assert_eq!(report.outcome, ReconcileOutcome::Done);
    assert_eq!(report.status.phase(), Phase::Failed);

    let status = operator.status_of(&spec).await;
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.message.unwrap().contains("x509"));
    assert_eq!(operator.control_plane.project_creates(), 0);
}

#[tokio::test]
async fn malformed_version_or_memory_is_retried() {
    let operator = TestOperator::new();
    let bad_version = SpecBuilder::replica_set("my-rs", 3)
        .with_version("six")
        .build();
    let mut bad_memory = SpecBuilder::replica_set("other-rs", 3).build();
    bad_memory.memory_limit = Some("lots".to_owned());

    for (spec, input) in [(bad_version, "six"), (bad_memory, "lots")] {
        let report = operator.reconciler.reconcile(&spec).await;
        assert_eq!(report.status.phase(), Phase::Failed);
        assert!(matches!(report.outcome, ReconcileOutcome::RequeueAfter(_)));
        let message = report.status.message().unwrap();
        assert!(message.contains(input), "{message}");
        assert_eq!(operator.status_of(&spec).await.phase, Phase::Failed);
    }
    assert_eq!(operator.control_plane.project_creates(), 0);
}

#[tokio::test]
async fn second_replica_set_in_a_project_waits() {
    let operator = TestOperator::new();
    let first = SpecBuilder::replica_set("my-rs", 3).build();
    assert!(operator.reconciler.reconcile(&first).await.status.is_ok());
    let published = operator.history(&first).await.len();

    let second = SpecBuilder::replica_set("other-rs", 1).build();
    let report = operator.reconciler.reconcile(&second).await;
    assert_eq!(report.status.phase(), Phase::Pending);
    assert!(matches!(report.outcome, ReconcileOutcome::RequeueAfter(_)));
    let message = report.status.message().unwrap();
    assert!(
        message.contains("cannot have more than 1 MongoDB Cluster per project"),
        "{message}"
    );
    assert!(message.contains("found 3 processes not belonging to other-rs"), "{message}");

    assert_eq!(operator.history(&first).await.len(), published);
    assert!(operator
        .workload
        .current("mongodb", "other-rs")
        .await
        .unwrap()
        .is_none());
    let project = operator
        .control_plane
        .project_named(&first.project.project_name)
        .await
        .unwrap();
    assert!(project.tags.is_empty(), "tags left: {:?}", project.tags);
    assert_eq!(operator.status_of(&second).await.phase, Phase::Pending);
}
