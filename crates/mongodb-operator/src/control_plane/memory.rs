//! In-memory control plane.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    AgentPage, AgentStatus, AutomationStatus, ControlPlane, ControlledFeatures, Host, NewProject,
    Organization, ProcessStatus, Project,
};
use crate::deployment::DeploymentDocument;
use crate::error::{OperatorError, OperatorResult};
use crate::types::ProjectId;

const AGENTS_PAGE_SIZE: usize = 2;
const MONGODB_PORT: u16 = 27017;

#[derive(Debug, Default)]
struct ProjectState {
    document: DeploymentDocument,
    history: Vec<DeploymentDocument>,
    goal_versions: HashMap<String, u64>,
    hosts: Vec<Host>,
    controlled_features: Option<ControlledFeatures>,
    agent_key: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    organizations: Vec<Organization>,
    projects: Vec<Project>,
    deployments: HashMap<ProjectId, ProjectState>,
    agents: BTreeSet<String>,
}

/// Control plane that keeps everything in memory.
///
/// Published documents are kept in order so tests can inspect the publish
/// sequence. Agents reach the goal state as soon as a document is
/// published, or once readiness is switched back on.
#[derive(Debug, Clone)]
pub struct MemoryControlPlane {
    state: Arc<RwLock<State>>,
    ready: Arc<AtomicBool>,
    reject_tags: Arc<AtomicBool>,
    pending_conflicts: Arc<AtomicU32>,
    project_creates: Arc<AtomicU64>,
    latency: Duration,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            ready: Arc::new(AtomicBool::new(true)),
            reject_tags: Arc::default(),
            pending_conflicts: Arc::default(),
            project_creates: Arc::default(),
            latency: Duration::ZERO,
        }
    }
}

impl MemoryControlPlane {
    /// An empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, to widen race windows in tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Create a project with its organization and return its ID.
    pub async fn seed_project(&self, name: &str) -> ProjectId {
        let mut state = self.state.write().await;
        let org = Organization {
            id: ulid::Ulid::new().to_string(),
            name: name.to_owned(),
        };
        let project = Project {
            id: ProjectId::generate(),
            name: name.to_owned(),
            org_id: org.id.clone(),
            tags: Vec::new(),
        };
        let id = project.id.clone();
        state.organizations.push(org);
        state.projects.push(project);
        state.deployments.insert(id.clone(), ProjectState::default());
        id
    }

    /// Whether agents apply published documents.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Reject projects created or updated with tags.
    pub fn set_reject_tags(&self, reject: bool) {
        self.reject_tags.store(reject, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes with a version conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Register automation agents on `hostnames`.
    pub async fn register_agents(&self, hostnames: &[String]) {
        let mut state = self.state.write().await;
        state.agents.extend(hostnames.iter().cloned());
    }

    /// Number of project creations that succeeded.
    #[must_use]
    pub fn project_creates(&self) -> u64 {
        self.project_creates.load(Ordering::SeqCst)
    }

    /// All projects.
    pub async fn projects(&self) -> Vec<Project> {
        self.state.read().await.projects.clone()
    }

    /// Project named `name`, if any.
    pub async fn project_named(&self, name: &str) -> Option<Project> {
        let state = self.state.read().await;
        state.projects.iter().find(|p| p.name == name).cloned()
    }

    /// Current document of a project.
    pub async fn document(&self, project: &ProjectId) -> DeploymentDocument {
        let state = self.state.read().await;
        state
            .deployments
            .get(project)
            .map(|p| p.document.clone())
            .unwrap_or_default()
    }

    /// Every document published to a project, oldest first.
    pub async fn history(&self, project: &ProjectId) -> Vec<DeploymentDocument> {
        let state = self.state.read().await;
        state
            .deployments
            .get(project)
            .map(|p| p.history.clone())
            .unwrap_or_default()
    }

    /// Number of publishes across all projects.
    pub async fn publish_count(&self) -> usize {
        let state = self.state.read().await;
        state.deployments.values().map(|p| p.history.len()).sum()
    }

    /// Controlled features declared for a project.
    pub async fn controlled_features(&self, project: &ProjectId) -> Option<ControlledFeatures> {
        let state = self.state.read().await;
        state
            .deployments
            .get(project)
            .and_then(|p| p.controlled_features.clone())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn unknown_project(project: &ProjectId) -> OperatorError {
    OperatorError::NotFound(format!("project {project}"))
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn read_deployment(&self, project: &ProjectId) -> OperatorResult<DeploymentDocument> {
        self.delay().await;
        let state = self.state.read().await;
        state
            .deployments
            .get(project)
            .map(|p| p.document.clone())
            .ok_or_else(|| unknown_project(project))
    }

    async fn update_deployment(
        &self,
        project: &ProjectId,
        document: &DeploymentDocument,
    ) -> OperatorResult<u64> {
        self.delay().await;
        let mut state = self.state.write().await;
        let entry = state
            .deployments
            .get_mut(project)
            .ok_or_else(|| unknown_project(project))?;

        let conflicts = self.pending_conflicts.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.pending_conflicts.store(conflicts - 1, Ordering::SeqCst);
            return Err(OperatorError::VersionConflict {
                expected: document.version,
                actual: entry.document.version + 1,
            });
        }
        if document.version != entry.document.version {
            return Err(OperatorError::VersionConflict {
                expected: document.version,
                actual: entry.document.version,
            });
        }

        let mut stored = document.clone();
        stored.version = entry.document.version + 1;
        let version = stored.version;

        for process in &stored.processes {
            let achieved = entry.goal_versions.entry(process.name.clone()).or_insert(0);
            if self.ready.load(Ordering::SeqCst) {
                *achieved = version;
            }
            if !entry.hosts.iter().any(|h| h.hostname == process.hostname) {
                entry.hosts.push(Host {
                    id: ulid::Ulid::new().to_string(),
                    hostname: process.hostname.clone(),
                    port: MONGODB_PORT,
                });
            }
        }
        entry
            .goal_versions
            .retain(|name, _| stored.processes.iter().any(|p| &p.name == name));

        entry.history.push(stored.clone());
        entry.document = stored;
        Ok(version)
    }

    async fn read_automation_status(
        &self,
        project: &ProjectId,
    ) -> OperatorResult<AutomationStatus> {
        self.delay().await;
        let state = self.state.read().await;
        let entry = state
            .deployments
            .get(project)
            .ok_or_else(|| unknown_project(project))?;
        // Ready agents catch up with the current document.
        let ready = self.ready.load(Ordering::SeqCst);
        let processes = entry
            .document
            .processes
            .iter()
            .map(|p| ProcessStatus {
                name: p.name.clone(),
                hostname: p.hostname.clone(),
                last_goal_version_achieved: if ready {
                    entry.document.version
                } else {
                    entry.goal_versions.get(&p.name).copied().unwrap_or(0)
                },
            })
            .collect();
        Ok(AutomationStatus {
            goal_version: entry.document.version,
            processes,
        })
    }

    async fn read_automation_agents(
        &self,
        _project: &ProjectId,
        page: u32,
    ) -> OperatorResult<AgentPage> {
        self.delay().await;
        let state = self.state.read().await;
        let skip = usize::try_from(page.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .saturating_mul(AGENTS_PAGE_SIZE);
        let results: Vec<AgentStatus> = state
            .agents
            .iter()
            .skip(skip)
            .take(AGENTS_PAGE_SIZE)
            .map(|hostname| AgentStatus {
                hostname: hostname.clone(),
                last_conf: Some(Utc::now()),
            })
            .collect();
        let next_page = (skip.saturating_add(AGENTS_PAGE_SIZE) < state.agents.len())
            .then_some(page.saturating_add(1));
        Ok(AgentPage { results, next_page })
    }

    async fn get_hosts(&self, project: &ProjectId) -> OperatorResult<Vec<Host>> {
        self.delay().await;
        let state = self.state.read().await;
        state
            .deployments
            .get(project)
            .map(|p| p.hosts.clone())
            .ok_or_else(|| unknown_project(project))
    }

    async fn add_host(&self, project: &ProjectId, hostname: &str) -> OperatorResult<Host> {
        self.delay().await;
        let mut state = self.state.write().await;
        let entry = state
            .deployments
            .get_mut(project)
            .ok_or_else(|| unknown_project(project))?;
        let host = Host {
            id: ulid::Ulid::new().to_string(),
            hostname: hostname.to_owned(),
            port: MONGODB_PORT,
        };
        entry.hosts.push(host.clone());
        Ok(host)
    }

    async fn remove_host(&self, project: &ProjectId, host_id: &str) -> OperatorResult<()> {
        self.delay().await;
        let mut state = self.state.write().await;
        let entry = state
            .deployments
            .get_mut(project)
            .ok_or_else(|| unknown_project(project))?;
        let before = entry.hosts.len();
        entry.hosts.retain(|h| h.id != host_id);
        if entry.hosts.len() == before {
            return Err(OperatorError::NotFound(format!("host {host_id}")));
        }
        Ok(())
    }

    async fn read_organization(&self, org_id: &str) -> OperatorResult<Option<Organization>> {
        self.delay().await;
        let state = self.state.read().await;
        Ok(state.organizations.iter().find(|o| o.id == org_id).cloned())
    }

    async fn find_organizations_by_name(&self, name: &str) -> OperatorResult<Vec<Organization>> {
        self.delay().await;
        let state = self.state.read().await;
        Ok(state
            .organizations
            .iter()
            .filter(|o| o.name.starts_with(name))
            .cloned()
            .collect())
    }

    async fn find_projects_in_organization(
        &self,
        org_id: &str,
        name: &str,
    ) -> OperatorResult<Vec<Project>> {
        self.delay().await;
        let state = self.state.read().await;
        Ok(state
            .projects
            .iter()
            .filter(|p| p.org_id == org_id && p.name.starts_with(name))
            .cloned()
            .collect())
    }

    async fn create_project(&self, request: NewProject) -> OperatorResult<Project> {
        self.delay().await;
        if !request.tags.is_empty() && self.reject_tags.load(Ordering::SeqCst) {
            return Err(OperatorError::TagsRejected(
                "tags are not supported by this control plane version".to_owned(),
            ));
        }
        let mut state = self.state.write().await;
        let org_id = if request.org_id.is_empty() {
            let org = Organization {
                id: ulid::Ulid::new().to_string(),
                name: request.name.clone(),
            };
            let id = org.id.clone();
            state.organizations.push(org);
            id
        } else {
            request.org_id
        };
        let project = Project {
            id: ProjectId::generate(),
            name: request.name,
            org_id,
            tags: request.tags,
        };
        state.projects.push(project.clone());
        state
            .deployments
            .insert(project.id.clone(), ProjectState::default());
        self.project_creates.fetch_add(1, Ordering::SeqCst);
        Ok(project)
    }

    async fn update_project(&self, project: &Project) -> OperatorResult<Project> {
        self.delay().await;
        if !project.tags.is_empty() && self.reject_tags.load(Ordering::SeqCst) {
            return Err(OperatorError::TagsRejected(
                "tags are not supported by this control plane version".to_owned(),
            ));
        }
        let mut state = self.state.write().await;
        let stored = state
            .projects
            .iter_mut()
            .find(|p| p.id == project.id)
            .ok_or_else(|| unknown_project(&project.id))?;
        stored.tags.clone_from(&project.tags);
        Ok(stored.clone())
    }

    async fn update_controlled_features(
        &self,
        project: &ProjectId,
        features: &ControlledFeatures,
    ) -> OperatorResult<()> {
        self.delay().await;
        let mut state = self.state.write().await;
        let entry = state
            .deployments
            .get_mut(project)
            .ok_or_else(|| unknown_project(project))?;
        entry.controlled_features = Some(features.clone());
        Ok(())
    }

    async fn generate_agent_key(&self, project: &ProjectId) -> OperatorResult<String> {
        self.delay().await;
        let mut state = self.state.write().await;
        let entry = state
            .deployments
            .get_mut(project)
            .ok_or_else(|| unknown_project(project))?;
        let key = ulid::Ulid::new().to_string().to_lowercase();
        entry.agent_key = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::deployment::Process;

    #[tokio::test]
    async fn stale_publish_conflicts() {
        let cp = MemoryControlPlane::new();
        let project = cp.seed_project("p").await;

        let mut document = cp.read_deployment(&project).await.unwrap();
        document.merge_standalone(Process::mongod("a", "a.svc", "4.2.1"));
        assert_eq!(cp.update_deployment(&project, &document).await.unwrap(), 1);

        let err = cp.update_deployment(&project, &document).await.unwrap_err();
        assert!(matches!(
            err,
            OperatorError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn agents_are_paginated() {
        let cp = MemoryControlPlane::new();
        let project = cp.seed_project("p").await;
        let hosts: Vec<String> = (0..3).map(|i| format!("h{i}")).collect();
        cp.register_agents(&hosts).await;

        let first = cp.read_automation_agents(&project, 1).await.unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.next_page, Some(2));

        let second = cp.read_automation_agents(&project, 2).await.unwrap();
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.next_page, None);
    }

    #[tokio::test]
    async fn tags_can_be_rejected() {
        let cp = MemoryControlPlane::new();
        cp.set_reject_tags(true);
        let request = NewProject {
            name: "p".to_owned(),
            org_id: String::new(),
            tags: vec!["TAG".to_owned()],
        };
        let err = cp.create_project(request).await.unwrap_err();
        assert!(matches!(err, OperatorError::TagsRejected(_)));
        assert_eq!(cp.project_creates(), 0);
    }
}
