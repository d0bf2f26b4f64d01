//! The remote automation control plane.
//!
//! [`ControlPlane`] is the remote API. [`ControlPlaneUpdater`] wraps it with
//! the per-project mutex, the conflict-retrying publish and the bounded
//! polls the reconciler waits on.

mod memory;
mod project;
mod updater;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryControlPlane;
pub use project::{normalize_tag, ProjectContext, AGENT_KEY_FIELD, EXTERNALLY_MANAGED_TAG};
pub use updater::{ControlPlaneUpdater, ProjectMutexes, PublishOutcome};

use crate::deployment::DeploymentDocument;
use crate::error::OperatorResult;
use crate::types::ProjectId;

/// Organization in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Organization ID.
    pub id: String,
    /// Organization name.
    pub name: String,
}

/// Project in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project ID.
    pub id: ProjectId,
    /// Project name.
    pub name: String,
    /// Organization owning the project.
    pub org_id: String,
    /// Project tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request to create a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    /// Project name.
    pub name: String,
    /// Organization ID; empty lets the control plane create one named like the project.
    pub org_id: String,
    /// Tags to set on creation.
    pub tags: Vec<String>,
}

/// Goal state progress of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    /// Process name.
    pub name: String,
    /// Hostname the process runs on.
    pub hostname: String,
    /// Last document version the agent applied.
    pub last_goal_version_achieved: u64,
}

/// Goal state progress of all processes in a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStatus {
    /// Current document version.
    pub goal_version: u64,
    /// Per-process progress.
    pub processes: Vec<ProcessStatus>,
}

impl AutomationStatus {
    /// Named processes that have not applied the current document.
    ///
    /// Processes the control plane does not report are not waited on.
    #[must_use]
    pub fn processes_not_ready(&self, names: &[String]) -> Vec<String> {
        self.processes
            .iter()
            .filter(|p| names.contains(&p.name))
            .filter(|p| p.last_goal_version_achieved != self.goal_version)
            .map(|p| p.name.clone())
            .collect()
    }
}

/// An automation agent known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Hostname the agent runs on.
    pub hostname: String,
    /// Last time the agent fetched its configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_conf: Option<DateTime<Utc>>,
}

/// One page of agent listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentPage {
    /// Agents on this page.
    pub results: Vec<AgentStatus>,
    /// Next page number, if any.
    pub next_page: Option<u32>,
}

/// A host monitored by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    /// Host ID.
    pub id: String,
    /// Hostname.
    pub hostname: String,
    /// Port.
    pub port: u16,
}

/// Settings the control plane must leave to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlledFeatures {
    /// Name of the managing system.
    pub managed_by: String,
    /// Locked policies.
    pub policies: Vec<String>,
}

impl ControlledFeatures {
    /// Features locked by this operator: authentication and server version.
    #[must_use]
    pub fn operator_managed() -> Self {
        Self {
            managed_by: "mongodb-operator".to_owned(),
            policies: vec![
                "EXTERNALLY_MANAGED_LOCK".to_owned(),
                "DISABLE_AUTHENTICATION_MECHANISMS".to_owned(),
                "DISABLE_SET_MONGOD_VERSION".to_owned(),
            ],
        }
    }
}

/// Remote control plane API.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Read the deployment document of a project.
    async fn read_deployment(&self, project: &ProjectId) -> OperatorResult<DeploymentDocument>;

    /// Publish a document based on version `document.version`.
    ///
    /// Returns the stored version, or
    /// [`crate::error::OperatorError::VersionConflict`] when the document
    /// changed since it was read.
    async fn update_deployment(
        &self,
        project: &ProjectId,
        document: &DeploymentDocument,
    ) -> OperatorResult<u64>;

    /// Goal state progress of the project's processes.
    async fn read_automation_status(&self, project: &ProjectId)
        -> OperatorResult<AutomationStatus>;

    /// One page of the project's automation agents, starting at 1.
    async fn read_automation_agents(&self, project: &ProjectId, page: u32)
        -> OperatorResult<AgentPage>;

    /// Monitored hosts.
    async fn get_hosts(&self, project: &ProjectId) -> OperatorResult<Vec<Host>>;

    /// Start monitoring a host.
    async fn add_host(&self, project: &ProjectId, hostname: &str) -> OperatorResult<Host>;

    /// Stop monitoring a host.
    async fn remove_host(&self, project: &ProjectId, host_id: &str) -> OperatorResult<()>;

    /// Organization by ID.
    async fn read_organization(&self, org_id: &str) -> OperatorResult<Option<Organization>>;

    /// Organizations whose name starts with `name`.
    async fn find_organizations_by_name(&self, name: &str) -> OperatorResult<Vec<Organization>>;

    /// Projects in an organization whose name starts with `name`.
    async fn find_projects_in_organization(
        &self,
        org_id: &str,
        name: &str,
    ) -> OperatorResult<Vec<Project>>;

    /// Create a project.
    ///
    /// Returns [`crate::error::OperatorError::TagsRejected`] when the
    /// control plane does not support tags.
    async fn create_project(&self, project: NewProject) -> OperatorResult<Project>;

    /// Update a project's tags.
    async fn update_project(&self, project: &Project) -> OperatorResult<Project>;

    /// Declare the settings managed by the operator.
    async fn update_controlled_features(
        &self,
        project: &ProjectId,
        features: &ControlledFeatures,
    ) -> OperatorResult<()>;

    /// Generate an API key for the project's agents.
    async fn generate_agent_key(&self, project: &ProjectId) -> OperatorResult<String>;
}
