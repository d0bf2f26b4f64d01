//! Integration tests for TLS, x509 and certificate issuance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{fixtures::SpecBuilder, TestOperator};
use mongodb_operator::workflow::MULTI_STAGE_MESSAGE;
use mongodb_operator::{Phase, ReconcileOutcome, SecretStore};

#[tokio::test]
async fn tls_and_x509_on_existing_set_take_two_passes() {
    let operator = TestOperator::new();
    let plain = SpecBuilder::replica_set("my-rs", 3).build();
    assert!(operator.reconciler.reconcile(&plain).await.status.is_ok());

    let secured = SpecBuilder::replica_set("my-rs", 3)
        .with_tls()
        .with_x509()
        .build();

    let first = operator.reconciler.reconcile(&secured).await;
    assert_eq!(first.status.phase(), Phase::Pending);
    assert!(matches!(first.outcome, ReconcileOutcome::RequeueAfter(_)));
    let status = operator.status_of(&secured).await;
    assert_eq!(status.phase, Phase::Pending);
    assert!(status.message.unwrap().starts_with(MULTI_STAGE_MESSAGE));

    let document = operator.document(&secured).await;
    assert!(document.all_processes_are_tls_enabled());
    assert!(!document.is_x509_enabled());

    let second = operator.reconciler.reconcile(&secured).await;
    assert!(second.status.is_ok(), "unexpected status: {:?}", second.status);
    let document = operator.document(&secured).await;
    assert!(document.is_x509_enabled());
    assert_eq!(operator.status_of(&secured).await.phase, Phase::Running);
}

#[tokio::test]
async fn new_set_gets_tls_and_x509_in_one_pass() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3)
        .with_tls()
        .with_x509()
        .build();

    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);

    let document = operator.document(&spec).await;
    assert!(document.all_processes_are_tls_enabled());
    assert!(document.is_x509_enabled());
    assert_eq!(operator.history(&spec).await.len(), 1);

    let secret = operator
        .secrets
        .get("mongodb", "my-rs-cert")
        .await
        .unwrap()
        .expect("certificate secret");
    assert_eq!(secret.len(), 3);

    let applied = operator.workload.applied().await;
    let request = applied.last().unwrap();
    assert_eq!(request.certificate_secret.as_deref(), Some("my-rs-cert"));
    assert!(request.cluster_file_secret.is_none());
}

#[tokio::test]
async fn certificates_awaiting_approval_hold_the_pass() {
    let operator = TestOperator::new();
    operator.certificate_authority.set_auto_approve(false);
    let spec = SpecBuilder::replica_set("my-rs", 3).with_tls().build();

    let report = operator.reconciler.reconcile(&spec).await;
    assert_eq!(report.status.phase(), Phase::Pending);
    assert!(report
        .status
        .message()
        .unwrap()
        .contains("Not all certificates have been approved by Kubernetes CA for my-rs"));
    assert!(operator.history(&spec).await.is_empty());
    assert!(operator.workload.applied().await.is_empty());

    // A second pass does not submit the requests again.
    operator.reconciler.reconcile(&spec).await;
    assert_eq!(operator.certificate_authority.create_count(), 3);

    operator.certificate_authority.approve_all().await;
    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);
    assert!(operator.document(&spec).await.all_processes_are_tls_enabled());
}

#[tokio::test]
async fn internal_cluster_authentication_cannot_be_switched_off() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3)
        .with_tls()
        .with_internal_cluster_x509()
        .build();
    let report = operator.reconciler.reconcile(&spec).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);

    let document = operator.document(&spec).await;
    assert!(document.existing_processes_have_internal_cluster_authentication(&[
        "my-rs-0".to_owned()
    ]));
    let published = operator.history(&spec).await.len();

    let without = SpecBuilder::replica_set("my-rs", 3).with_tls().build();
    let report = operator.reconciler.reconcile(&without).await;
    assert_eq!(report.status.phase(), Phase::Failed);
    assert!(report
        .status
        .message()
        .unwrap()
        .contains("cannot disable x509 internal cluster authentication"));

    assert_eq!(operator.history(&spec).await.len(), published);
    let status = operator.status_of(&spec).await;
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.members, 3);
}

#[tokio::test]
async fn member_certificates_are_mounted_for_internal_cluster_authentication() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3)
        .with_tls()
        .with_internal_cluster_x509()
        .build();
    operator.reconciler.reconcile(&spec).await;

    assert!(operator
        .secrets
        .get("mongodb", "my-rs-clusterfile")
        .await
        .unwrap()
        .is_some());
    let applied = operator.workload.applied().await;
    assert_eq!(
        applied.last().unwrap().cluster_file_secret.as_deref(),
        Some("my-rs-clusterfile")
    );
}

#[tokio::test]
async fn disabling_tls_updates_document_and_pods() {
    let operator = TestOperator::new();
    let spec = SpecBuilder::replica_set("my-rs", 3).with_tls().build();
    assert!(operator.reconciler.reconcile(&spec).await.status.is_ok());
    assert!(operator.document(&spec).await.tls.is_some());

    let plain = SpecBuilder::replica_set("my-rs", 3).build();
    let report = operator.reconciler.reconcile(&plain).await;
    assert!(report.status.is_ok(), "unexpected status: {:?}", report.status);

    let document = operator.document(&plain).await;
    assert!(document.tls.is_none());
    let applied = operator.workload.applied().await;
    assert!(applied.last().unwrap().certificate_secret.is_none());
}
