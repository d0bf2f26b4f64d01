//! Serialised, conflict-retrying publishes and bounded convergence polls.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::ControlPlane;
use crate::config::ControlPlaneConfig;
use crate::deployment::DeploymentDocument;
use crate::error::{OperatorError, OperatorResult};
use crate::types::ProjectId;

/// Process-wide registry of per-project mutexes.
///
/// Every operation that reads and writes the same remote project holds
/// that project's mutex; unrelated projects never wait on each other.
#[derive(Debug, Default)]
pub struct ProjectMutexes {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProjectMutexes {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex for the project `identity`, created on first use.
    #[must_use]
    pub fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of projects seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no project has been locked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Result of a read-modify-publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The mutation left the document unchanged; nothing was written.
    Unchanged,
    /// A new document version was stored.
    Published {
        /// The stored version.
        version: u64,
    },
}

/// Publishes deployment documents and waits for agents to converge.
pub struct ControlPlaneUpdater {
    control_plane: Arc<dyn ControlPlane>,
    mutexes: Arc<ProjectMutexes>,
    config: ControlPlaneConfig,
}

impl ControlPlaneUpdater {
    /// Create a new updater.
    #[must_use]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        mutexes: Arc<ProjectMutexes>,
        config: ControlPlaneConfig,
    ) -> Self {
        Self {
            control_plane,
            mutexes,
            config,
        }
    }

    /// The wrapped control plane.
    #[must_use]
    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    pub(super) fn mutexes(&self) -> &ProjectMutexes {
        &self.mutexes
    }

    /// Read the document, apply `mutate`, and publish the result.
    ///
    /// Runs under the project mutex. An unchanged document is not
    /// published. On a version conflict the document is re-read and
    /// `mutate` applied again, up to the configured number of retries.
    pub async fn read_update_deployment<F>(
        &self,
        identity: &str,
        project: &ProjectId,
        mut mutate: F,
    ) -> OperatorResult<PublishOutcome>
    where
        F: FnMut(&mut DeploymentDocument) -> OperatorResult<()> + Send,
    {
        let lock = self.mutexes.lock_for(identity);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            let current = self
                .control_plane
                .read_deployment(project)
                .await
                .map_err(|e| e.context("read deployment"))?;
            let mut updated = current.clone();
            mutate(&mut updated)?;

            if updated.same_content(&current) {
                debug!(project = %project, "deployment has not changed, not publishing");
                return Ok(PublishOutcome::Unchanged);
            }

            match self.control_plane.update_deployment(project, &updated).await {
                Ok(version) => {
                    info!(project = %project, version, "published deployment");
                    return Ok(PublishOutcome::Published { version });
                }
                Err(e @ OperatorError::VersionConflict { .. })
                    if attempt < self.config.publish_retries =>
                {
                    attempt += 1;
                    warn!(project = %project, attempt, error = %e, "deployment changed concurrently, retrying");
                }
                Err(e @ OperatorError::VersionConflict { .. }) => {
                    error!(project = %project, error = %e, "giving up publishing deployment");
                    return Err(OperatorError::control_plane(format!(
                        "failed to publish deployment after {attempt} retries due to intensive concurrent modification"
                    )));
                }
                Err(e) => {
                    error!(project = %project, error = %e, "failed to publish deployment");
                    return Err(e.context("publish deployment"));
                }
            }
        }
    }

    /// Wait until every named process has applied the current document.
    pub async fn wait_for_ready_state(
        &self,
        project: &ProjectId,
        process_names: &[String],
    ) -> OperatorResult<()> {
        if process_names.is_empty() {
            return Ok(());
        }
        info!(project = %project, processes = process_names.len(), "waiting for agents to reach goal state");

        let mut not_ready = Vec::new();
        for attempt in 0..self.config.ready_state_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.ready_state_interval()).await;
            }
            let status = self
                .control_plane
                .read_automation_status(project)
                .await
                .map_err(|e| e.context("read automation status"))?;
            not_ready = status.processes_not_ready(process_names);
            if not_ready.is_empty() {
                debug!(project = %project, "agents reached goal state");
                return Ok(());
            }
            debug!(project = %project, attempt, not_ready = ?not_ready, "agents not ready yet");
        }

        warn!(project = %project, not_ready = ?not_ready, "agents did not reach goal state");
        Err(OperatorError::control_plane(format!(
            "agents did not reach ready state, processes not ready: {not_ready:?}"
        )))
    }

    /// Wait until an agent has registered on every one of `hostnames`.
    pub async fn wait_for_agents_registration(
        &self,
        project: &ProjectId,
        hostnames: &[String],
    ) -> OperatorResult<()> {
        if hostnames.is_empty() {
            return Ok(());
        }
        info!(project = %project, agents = hostnames.len(), "waiting for agents to register");

        let mut message = String::new();
        for attempt in 0..self.config.agent_registration_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.agent_registration_interval()).await;
            }
            let registered = self.registered_hostnames(project, hostnames).await?;
            if registered.len() == hostnames.len() {
                debug!(project = %project, "all agents registered");
                return Ok(());
            }
            message = if registered.is_empty() {
                format!(
                    "None of {} expected agents has registered, expected hostnames: {hostnames:?}",
                    hostnames.len()
                )
            } else {
                let missing: Vec<&String> = hostnames
                    .iter()
                    .filter(|h| !registered.contains(h))
                    .collect();
                format!(
                    "Only {} of {} expected agents have registered, missing hostnames: {missing:?}",
                    registered.len(),
                    hostnames.len()
                )
            };
            debug!(project = %project, attempt, "{message}");
        }

        Err(OperatorError::control_plane(format!(
            "{message}. Make sure the cluster domain is set if it differs from the default"
        )))
    }

    async fn registered_hostnames(
        &self,
        project: &ProjectId,
        hostnames: &[String],
    ) -> OperatorResult<Vec<String>> {
        let mut registered: Vec<String> = Vec::new();
        let mut page = 1;
        loop {
            let agents = self
                .control_plane
                .read_automation_agents(project, page)
                .await
                .map_err(|e| e.context("read automation agents"))?;
            for agent in agents.results {
                if hostnames.contains(&agent.hostname) && !registered.contains(&agent.hostname) {
                    registered.push(agent.hostname);
                }
            }
            if registered.len() == hostnames.len() {
                return Ok(registered);
            }
            match agents.next_page {
                Some(next) => page = next,
                None => return Ok(registered),
            }
        }
    }

    /// Stop monitoring `hostnames`; hosts that are not monitored are ignored.
    pub async fn stop_monitoring(
        &self,
        project: &ProjectId,
        hostnames: &[String],
    ) -> OperatorResult<()> {
        if hostnames.is_empty() {
            return Ok(());
        }
        let hosts = self
            .control_plane
            .get_hosts(project)
            .await
            .map_err(|e| e.context("read monitored hosts"))?;
        for host in hosts.iter().filter(|h| hostnames.contains(&h.hostname)) {
            self.control_plane
                .remove_host(project, &host.id)
                .await
                .map_err(|e| e.context("remove monitored host"))?;
            info!(project = %project, host = %host.hostname, "stopped monitoring host");
        }
        Ok(())
    }
}
