//! The reconciliation pipeline.
//!
//! One pass takes a declared spec to the control plane and the workload:
//!
//! ```text
//! Reconciling ─▶ validate ─▶ project ─▶ certificates ─▶ scale-down prep
//!                                                            │
//!                      ┌─────────────────────────────────────┘
//!                      ▼
//!        publish ◀──▶ workload (order depends on the change) ─▶ persist status
//! ```
//!
//! The side-effecting part of a pass runs in its own task so a panic
//! becomes a `Failed` status instead of taking the worker down.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use ulid::Ulid;

use crate::certs::{CertificateAuthority, CertificatePurpose, CertificateSequencer};
use crate::config::OperatorConfig;
use crate::control_plane::{ControlPlane, ControlPlaneUpdater, ProjectContext, ProjectMutexes};
use crate::deployment::DeploymentDocument;
use crate::error::{OperatorError, OperatorResult};
use crate::scale::ScaleCoordinator;
use crate::secrets::SecretStore;
use crate::status::{StatusStore, StatusUpdater};
use crate::topology::{ResolvedTopology, TopologyResolver, WorkloadSet};
use crate::types::{DeclaredSpec, ObservedStatus, Phase, ResourceKey, ResourceKind, ShardedSize};
use crate::workflow::{run_in_given_order, ReconcileOutcome, Step, WorkflowStatus};
use crate::workload::{
    WorkloadApplier, WorkloadRequest, ENV_AGENT_API_KEY, ENV_BASE_URL, ENV_PROJECT_ID,
};

/// External systems the reconciler talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Automation control plane.
    pub control_plane: Arc<dyn ControlPlane>,
    /// Cluster certificate authority.
    pub certificate_authority: Arc<dyn CertificateAuthority>,
    /// Secret storage for keys, certificates and agent keys.
    pub secrets: Arc<dyn SecretStore>,
    /// Replicated pod sets.
    pub workload: Arc<dyn WorkloadApplier>,
    /// Resource status storage.
    pub status: Arc<dyn StatusStore>,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Folded status of the pass.
    pub status: WorkflowStatus,
    /// What the work queue should do next.
    pub outcome: ReconcileOutcome,
}

/// Drives declared specs to their applied state.
///
/// Cheap to clone; clones share collaborators, project mutexes and the set
/// of resources currently being reconciled.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    config: OperatorConfig,
    resolver: TopologyResolver,
    updater: Arc<ControlPlaneUpdater>,
    certificates: CertificateSequencer,
    scale: ScaleCoordinator,
    workload: Arc<dyn WorkloadApplier>,
    secrets: Arc<dyn SecretStore>,
    status: StatusUpdater,
    in_flight: Mutex<HashSet<ResourceKey>>,
}

/// Removes the resource from the in-flight set when the pass ends.
struct InFlight {
    inner: Arc<Inner>,
    key: ResourceKey,
}

impl InFlight {
    fn acquire(inner: &Arc<Inner>, key: &ResourceKey) -> Option<Self> {
        if !inner.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            key: key.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

/// A resolved project plus the agent key the pods authenticate with.
struct ProjectSetup {
    context: ProjectContext,
    agent_key: String,
}

/// What a publish left for later passes.
#[derive(Debug, Default, Clone, Copy)]
struct Published {
    x509_deferred: bool,
    removing_shards: bool,
}

impl Reconciler {
    /// Create a new reconciler.
    ///
    /// `mutexes` must be shared by every reconciler of the process so that
    /// publishes to one project are serialised.
    #[must_use]
    pub fn new(
        config: OperatorConfig,
        collaborators: Collaborators,
        mutexes: Arc<ProjectMutexes>,
    ) -> Self {
        let updater = Arc::new(ControlPlaneUpdater::new(
            collaborators.control_plane,
            mutexes,
            config.control_plane.clone(),
        ));
        let certificates = CertificateSequencer::new(
            collaborators.certificate_authority,
            Arc::clone(&collaborators.secrets),
            config.certificates.clone(),
        );
        let inner = Inner {
            resolver: TopologyResolver::new(&config.certificates),
            scale: ScaleCoordinator::new(Arc::clone(&updater)),
            status: StatusUpdater::new(collaborators.status, config.status.conflict_retries),
            updater,
            certificates,
            workload: collaborators.workload,
            secrets: collaborators.secrets,
            in_flight: Mutex::new(HashSet::new()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Run one reconciliation pass for `spec` and persist its outcome.
    pub async fn reconcile(&self, spec: &DeclaredSpec) -> ReconcileReport {
        let key = spec.key();
        let span = info_span!("reconcile", resource = %key, reconcile_id = %Ulid::new());
        self.reconcile_resource(spec, key).instrument(span).await
    }

    async fn reconcile_resource(&self, spec: &DeclaredSpec, key: ResourceKey) -> ReconcileReport {
        let inner = &self.inner;
        let reconcile = &inner.config.reconcile;

        let Some(_in_flight) = InFlight::acquire(inner, &key) else {
            debug!("resource is already being reconciled");
            return ReconcileReport {
                status: WorkflowStatus::pending("reconciliation already in progress"),
                outcome: ReconcileOutcome::RequeueAfter(reconcile.requeue_delay()),
            };
        };

        info!(kind = %spec.kind, version = %spec.version, "reconciling resource");
        let observed = match inner
            .status
            .update(&key, |s| s.set_phase(Phase::Reconciling, Utc::now()))
            .await
        {
            Ok(observed) => observed,
            Err(e) => {
                warn!(error = %e, "failed to mark resource as reconciling");
                let status = WorkflowStatus::failed(format!("failed to update status: {e}"));
                return ReconcileReport {
                    status,
                    outcome: ReconcileOutcome::RequeueAfter(reconcile.status_retry_delay()),
                };
            }
        };

        let task_inner = Arc::clone(inner);
        let task_spec = spec.clone();
        let task = tokio::spawn(
            async move { task_inner.run(&task_spec, &observed).await }.instrument(Span::current()),
        );
        let (status, link) = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(panic = %message, "reconciliation panicked");
                (WorkflowStatus::failed(format!("reconciliation panicked: {message}")), None)
            }
            Err(e) => (WorkflowStatus::failed(format!("reconciliation was cancelled: {e}")), None),
        };
        status.log();

        let outcome = match inner.persist(spec, &key, &status, link).await {
            Ok(()) => status.reconcile_outcome(reconcile.requeue_delay()),
            Err(e) => {
                error!(error = %e, "failed to persist status");
                ReconcileOutcome::RequeueAfter(reconcile.status_retry_delay())
            }
        };
        info!(phase = %status.phase(), outcome = ?outcome, "reconciliation finished");
        ReconcileReport { status, outcome }
    }

    /// Remove everything `spec` put into the project and the workload.
    ///
    /// Processes, replica sets or the sharded cluster and their agents
    /// leave the document, hosts stop being monitored and the replicated
    /// sets are deleted. Parts that are already gone are skipped.
    pub async fn delete(&self, spec: &DeclaredSpec) -> OperatorResult<()> {
        let key = spec.key();
        let span = info_span!("delete", resource = %key, reconcile_id = %Ulid::new());
        self.inner.delete(spec).instrument(span).await
    }

    /// Number of resources with a pass in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic".to_owned())
}

fn excess_processes(spec: &DeclaredSpec, document: &DeploymentDocument) -> OperatorResult<()> {
    match document.number_of_excess_processes(&spec.name) {
        0 => Ok(()),
        excess => Err(OperatorError::ProjectOccupied {
            excess,
            resource: spec.name.clone(),
        }),
    }
}

impl Inner {
    async fn run(&self, spec: &DeclaredSpec, observed: &ObservedStatus) -> (WorkflowStatus, Option<String>) {
        match spec.validate() {
            Ok(()) => {}
            Err(OperatorError::Validation(message)) => return (WorkflowStatus::invalid(message), None),
            Err(e) => return (WorkflowStatus::invalid(e.to_string()), None),
        }
        // Unparsable versions and quantities are retried.
        let topology = match self.resolver.resolve(spec) {
            Ok(topology) => topology,
            Err(e) => return (WorkflowStatus::failed(e.to_string()), None),
        };

        let project = match self.prepare_project(spec).await {
            Ok(project) => project,
            Err(e) => {
                return (
                    WorkflowStatus::failed(format!("failed to prepare project: {e}")),
                    None,
                )
            }
        };
        let link = Some(project.context.link());

        let status = self.converge(spec, observed, &topology, &project).await;
        (status, link)
    }

    async fn prepare_project(&self, spec: &DeclaredSpec) -> OperatorResult<ProjectSetup> {
        let context = self.updater.read_or_create_project(&spec.project).await?;
        self.updater.declare_controlled_features(&context).await?;
        let agent_key = self
            .updater
            .ensure_agent_key(self.secrets.as_ref(), &spec.namespace, &context)
            .await?;
        debug!(project = %context.project.id, "project ready");
        Ok(ProjectSetup { context, agent_key })
    }

    async fn converge(
        &self,
        spec: &DeclaredSpec,
        observed: &ObservedStatus,
        topology: &ResolvedTopology,
        project: &ProjectSetup,
    ) -> WorkflowStatus {
        let context = &project.context;

        let mut status = self.certificates.ensure_for_topology(spec, topology).await;
        if !status.allows_continuation() {
            return status;
        }

        status = status.merge(self.check_excess_processes(spec, context).await);
        if !status.allows_continuation() {
            return status;
        }

        let draining = self.resolver.draining_members(spec, observed);
        if !draining.is_empty() {
            let mut wait_for = topology.process_names();
            wait_for.extend(draining.values().flatten().cloned());
            status = status.merge(self.scale.prepare(context, &draining, &wait_for).await);
            if !status.allows_continuation() {
                return status;
            }
        }

        let sets = self.resolver.workload_sets(spec);
        let publish_first = self.publish_before_workload(spec, context, &sets).await;
        if publish_first {
            info!("publishing the deployment before updating the workload");
        }
        let publish: Step<'_> = Box::pin(self.publish(spec, topology, context));
        let workload: Step<'_> = Box::pin(self.apply_workload(spec, &sets, project));
        status = status.merge(run_in_given_order(publish_first, vec![publish, workload]).await);
        if !status.allows_continuation() {
            return status;
        }

        status.merge(self.clean_up(spec, observed, context).await)
    }

    /// A resource must be alone in its project.
    async fn check_excess_processes(
        &self,
        spec: &DeclaredSpec,
        context: &ProjectContext,
    ) -> WorkflowStatus {
        let document = match self
            .updater
            .control_plane()
            .read_deployment(&context.project.id)
            .await
        {
            Ok(document) => document,
            Err(e) => return WorkflowStatus::failed(e.context("read deployment").to_string()),
        };
        match excess_processes(spec, &document) {
            Ok(()) => WorkflowStatus::ok(),
            Err(e) => self.project_occupied(context, &e).await,
        }
    }

    async fn project_occupied(&self, context: &ProjectContext, e: &OperatorError) -> WorkflowStatus {
        warn!(error = %e, "project holds processes of other deployments");
        self.updater.clear_project_tags(context).await;
        WorkflowStatus::pending(e.to_string())
    }

    /// The document goes first when pods are about to disappear or stop
    /// serving TLS, so agents never chase processes that no longer exist.
    async fn publish_before_workload(
        &self,
        spec: &DeclaredSpec,
        context: &ProjectContext,
        sets: &[WorkloadSet],
    ) -> bool {
        let tls = spec.security.tls.enabled;
        let mut exists = false;
        for set in sets {
            match self.workload.current(&spec.namespace, &set.name).await {
                Ok(Some(state)) => {
                    if state.replicas > set.replicas || (state.tls_enabled && !tls) {
                        return true;
                    }
                    exists = true;
                }
                Ok(None) => {}
                Err(e) => warn!(set = %set.name, error = %e, "failed to read workload state"),
            }
        }
        if !exists {
            return false;
        }
        match self.updater.control_plane().read_deployment(&context.project.id).await {
            Ok(document) => document.tls_configuration_will_be_disabled(tls),
            Err(e) => {
                warn!(error = %e, "failed to read deployment");
                false
            }
        }
    }

    async fn publish(
        &self,
        spec: &DeclaredSpec,
        topology: &ResolvedTopology,
        context: &ProjectContext,
    ) -> WorkflowStatus {
        let project_id = &context.project.id;
        let hostnames = self.resolver.target_hostnames(spec);
        if let Err(e) = self
            .updater
            .wait_for_agents_registration(project_id, &hostnames)
            .await
        {
            return WorkflowStatus::failed(e.to_string());
        }

        let mut published = match self.publish_document(spec, topology, context, false).await {
            Ok(published) => published,
            Err(e @ OperatorError::ProjectOccupied { .. }) => {
                return self.project_occupied(context, &e).await
            }
            Err(e) => return WorkflowStatus::failed(format!("failed to publish deployment: {e}")),
        };

        if published.removing_shards {
            let wait_for = match self.draining_shard_processes(spec, topology, context).await {
                Ok(names) => names,
                Err(e) => return WorkflowStatus::failed(e.to_string()),
            };
            if let Err(e) = self.updater.wait_for_ready_state(project_id, &wait_for).await {
                info!(error = %e, "shards are still draining");
                return WorkflowStatus::pending("shards removal in progress");
            }
            match self.publish_document(spec, topology, context, true).await {
                Ok(finalized) => published.x509_deferred |= finalized.x509_deferred,
                Err(e) => {
                    return WorkflowStatus::failed(format!("failed to remove drained shards: {e}"))
                }
            }
        }

        if let Err(e) = self
            .updater
            .wait_for_ready_state(project_id, &topology.process_names())
            .await
        {
            return WorkflowStatus::failed(e.to_string());
        }

        if published.x509_deferred {
            info!("x509 authentication deferred until TLS is enabled on every process");
            return WorkflowStatus::incomplete(
                "x509 authentication will be enabled once TLS is enabled on every process",
            );
        }
        WorkflowStatus::ok()
    }

    async fn draining_shard_processes(
        &self,
        spec: &DeclaredSpec,
        topology: &ResolvedTopology,
        context: &ProjectContext,
    ) -> OperatorResult<Vec<String>> {
        let document = self
            .updater
            .control_plane()
            .read_deployment(&context.project.id)
            .await
            .map_err(|e| e.context("read deployment"))?;
        let mut names = topology.process_names();
        for rs in document.replica_sets_removed_from_cluster(&spec.name) {
            if let Some(rs) = document.replica_set(&rs) {
                names.extend(rs.member_names());
            }
        }
        Ok(names)
    }

    async fn publish_document(
        &self,
        spec: &DeclaredSpec,
        topology: &ResolvedTopology,
        context: &ProjectContext,
        finalizing: bool,
    ) -> OperatorResult<Published> {
        let mut published = Published::default();
        self.updater
            .read_update_deployment(&context.identity, &context.project.id, |document| {
                published = self.merge_into(spec, topology, document, finalizing)?;
                Ok(())
            })
            .await?;
        Ok(published)
    }

    /// Merge the declared processes and security settings into `document`.
    fn merge_into(
        &self,
        spec: &DeclaredSpec,
        topology: &ResolvedTopology,
        document: &mut DeploymentDocument,
        finalizing: bool,
    ) -> OperatorResult<Published> {
        let certificates = &self.config.certificates;
        let authentication = &spec.security.authentication;
        let tls = spec.security.tls.enabled;
        let names = topology.process_names();

        // Another resource may have published since the pass started.
        excess_processes(spec, document)?;

        let mode = authentication.cluster_auth_mode();
        let had_cluster_auth = document.existing_processes_have_internal_cluster_authentication(&names);
        if mode.is_empty() && had_cluster_auth {
            return Err(OperatorError::Validation(
                "cannot disable x509 internal cluster authentication once it has been enabled"
                    .to_owned(),
            ));
        }
        // Decided on the document as it was before this change.
        let x509_ready = document.x509_can_be_enabled();

        let removing_shards = match topology {
            ResolvedTopology::Standalone(process) => {
                document.merge_standalone(process.clone());
                false
            }
            ResolvedTopology::ReplicaSet(rs) => {
                document.merge_replica_set(rs.clone());
                false
            }
            ResolvedTopology::ShardedCluster(sharded) => document.merge_sharded_cluster(
                &spec.name,
                sharded.mongos.clone(),
                sharded.config.clone(),
                sharded.shards.clone(),
                finalizing,
            )?,
        };

        document.configure_tls(tls, &certificates.ca_file_path);

        let mut x509_deferred = false;
        if !mode.is_empty() {
            if had_cluster_auth || x509_ready {
                document.configure_internal_cluster_authentication(
                    &names,
                    mode,
                    &certificates.cluster_cert_mount,
                );
            } else {
                x509_deferred = true;
            }
        }
        if authentication.x509_enabled() {
            if document.is_x509_enabled() || x509_ready {
                document.enable_x509_authentication(&certificates.ca_file_path);
            } else {
                x509_deferred = true;
            }
        } else if document.is_x509_enabled() {
            document.disable_x509_authentication();
        }

        if let Some(hostname) = topology.representative_hostname() {
            let ca = tls.then_some(certificates.ca_file_path.as_str());
            document.add_monitoring_and_backup(hostname, ca, &self.config.agents);
        }

        Ok(Published {
            x509_deferred,
            removing_shards,
        })
    }

    async fn apply_workload(
        &self,
        spec: &DeclaredSpec,
        sets: &[WorkloadSet],
        project: &ProjectSetup,
    ) -> WorkflowStatus {
        let context = &project.context;
        let environment = BTreeMap::from([
            (ENV_BASE_URL.to_owned(), context.base_url.clone()),
            (ENV_PROJECT_ID.to_owned(), context.project.id.to_string()),
            (ENV_AGENT_API_KEY.to_owned(), project.agent_key.clone()),
        ]);
        let tls = spec.security.tls.enabled;
        let cluster_x509 = spec.security.authentication.internal_cluster_x509();

        for set in sets {
            let request = WorkloadRequest {
                namespace: spec.namespace.clone(),
                set_name: set.name.clone(),
                service_name: set.service.clone(),
                replicas: set.replicas,
                hostnames: set.hostnames.clone(),
                certificate_secret: tls.then(|| CertificatePurpose::Server.secret_name(&set.name)),
                cluster_file_secret: cluster_x509
                    .then(|| CertificatePurpose::InternalCluster.secret_name(&set.name)),
                environment: environment.clone(),
            };
            let state = match self.workload.apply(request).await {
                Ok(state) => state,
                Err(e) => {
                    return WorkflowStatus::failed(format!("failed to apply {}: {e}", set.name))
                }
            };
            // Later sets depend on earlier ones, mongos on the config servers and shards.
            if !state.is_ready() {
                info!(set = %set.name, ready = state.ready_replicas, replicas = state.replicas, "workload not ready");
                return WorkflowStatus::pending_with_retry(
                    format!(
                        "StatefulSet {} not ready: {} of {} replicas ready",
                        set.name, state.ready_replicas, state.replicas
                    ),
                    self.config.reconcile.workload_retry_delay(),
                );
            }
            debug!(set = %set.name, replicas = state.replicas, "workload ready");
        }
        WorkflowStatus::ok()
    }

    /// Stop monitoring hosts that left the shape and delete retired sets.
    async fn clean_up(
        &self,
        spec: &DeclaredSpec,
        observed: &ObservedStatus,
        context: &ProjectContext,
    ) -> WorkflowStatus {
        let target = self.resolver.target_hostnames(spec);
        let removed: Vec<String> = self
            .resolver
            .observed_hostnames(spec, observed)
            .into_iter()
            .filter(|h| !target.contains(h))
            .collect();
        if let Err(e) = self
            .updater
            .stop_monitoring(&context.project.id, &removed)
            .await
        {
            return WorkflowStatus::failed(format!("failed to stop monitoring removed hosts: {e}"));
        }

        for set in self.resolver.retired_workload_sets(spec, observed) {
            match self.workload.delete(&spec.namespace, &set).await {
                Ok(true) => info!(set = %set, "deleted workload of removed shard"),
                Ok(false) => {}
                Err(e) => return WorkflowStatus::failed(format!("failed to delete {set}: {e}")),
            }
        }
        WorkflowStatus::ok()
    }

    async fn persist(
        &self,
        spec: &DeclaredSpec,
        key: &ResourceKey,
        status: &WorkflowStatus,
        link: Option<String>,
    ) -> OperatorResult<()> {
        let now = Utc::now();
        let (members, sharded) = match spec.kind {
            ResourceKind::Standalone => (1, ShardedSize::default()),
            ResourceKind::ReplicaSet => (spec.members, ShardedSize::default()),
            ResourceKind::ShardedCluster => (0, spec.sharded),
        };
        self.status
            .update(key, |s| {
                s.set_phase(status.phase(), now);
                s.message = status.message();
                s.set_warnings(status.warnings());
                if let Some(link) = &link {
                    s.link = Some(link.clone());
                }
                if status.is_ok() {
                    s.version.clone_from(&spec.version);
                    s.members = members;
                    s.sharded = sharded;
                }
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, spec: &DeclaredSpec) -> OperatorResult<()> {
        let context = self.updater.read_or_create_project(&spec.project).await?;
        let project_id = &context.project.id;

        let mut removed_hosts = Vec::new();
        self.updater
            .read_update_deployment(&context.identity, project_id, |document| {
                let names = document.process_names_for(&spec.name);
                removed_hosts = document.hostnames_of(&names);
                document.remove_monitoring_and_backup(&names);
                let removed = match spec.kind {
                    ResourceKind::Standalone => document.remove_process_by_name(&spec.name),
                    ResourceKind::ReplicaSet => document.remove_replica_set_by_name(&spec.name),
                    ResourceKind::ShardedCluster => {
                        document.remove_sharded_cluster_by_name(&spec.name)
                    }
                };
                match removed {
                    Err(OperatorError::NotFound(what)) => {
                        debug!(missing = %what, "already removed from the deployment");
                        Ok(())
                    }
                    other => other,
                }
            })
            .await?;

        let remaining = self
            .updater
            .control_plane()
            .read_deployment(project_id)
            .await
            .map_err(|e| e.context("read deployment"))?;
        let remaining: Vec<String> = remaining.processes.iter().map(|p| p.name.clone()).collect();
        self.updater.wait_for_ready_state(project_id, &remaining).await?;
        self.updater.stop_monitoring(project_id, &removed_hosts).await?;

        for set in self.resolver.workload_sets(spec) {
            if self.workload.delete(&spec.namespace, &set.name).await? {
                debug!(set = %set.name, "deleted workload");
            }
        }
        info!("removed deployment from the project");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_owned())), "bang");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
