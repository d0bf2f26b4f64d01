//! Project bootstrap: find or create the remote project, its agent key and
//! controlled features.

use tracing::{debug, info, warn};

use super::{ControlPlaneUpdater, ControlledFeatures, NewProject, Organization, Project};
use crate::error::{OperatorError, OperatorResult};
use crate::secrets::{SecretData, SecretStore};
use crate::types::ProjectReference;

/// Tag marking projects whose deployments are managed by the operator.
pub const EXTERNALLY_MANAGED_TAG: &str = "EXTERNALLY_MANAGED_BY_KUBERNETES";

/// Field of the agent key secret holding the key.
pub const AGENT_KEY_FIELD: &str = "agentApiKey";

const MAX_TAG_LENGTH: usize = 32;

/// Tags are stored uppercase and at most 32 characters long.
#[must_use]
pub fn normalize_tag(tag: &str) -> String {
    tag.to_uppercase().chars().take(MAX_TAG_LENGTH).collect()
}

/// A resolved remote project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    /// The remote project.
    pub project: Project,
    /// Mutex key: the referenced project name and organization.
    pub identity: String,
    /// Control plane base URL.
    pub base_url: String,
}

impl ProjectContext {
    /// Link to the project, persisted in the resource status.
    #[must_use]
    pub fn link(&self) -> String {
        format!(
            "{}/v2/{}",
            self.base_url.trim_end_matches('/'),
            self.project.id
        )
    }

    /// Secret holding the agent API key.
    #[must_use]
    pub fn agent_key_secret(&self) -> String {
        format!("{}-group-secret", self.project.id)
    }
}

impl ControlPlaneUpdater {
    /// Find the referenced project, creating it when it does not exist.
    ///
    /// Runs under the project mutex so concurrent reconciliations of
    /// resources sharing a project create it at most once.
    pub async fn read_or_create_project(
        &self,
        reference: &ProjectReference,
    ) -> OperatorResult<ProjectContext> {
        let identity = reference.identity();
        let lock = self.mutexes().lock_for(&identity);
        let _guard = lock.lock().await;

        let name = reference.project_name.as_str();
        let organization = self.find_organization(reference).await?;

        let existing = match &organization {
            Some(org) => self.find_project(name, org).await?,
            None => None,
        };

        let project = match existing {
            Some(project) => self.ensure_tag(project).await,
            None => {
                let org_id = organization.map_or_else(|| reference.org_id.clone(), |o| o.id);
                self.create_project(name, org_id).await?
            }
        };

        Ok(ProjectContext {
            project,
            identity,
            base_url: reference.base_url.clone(),
        })
    }

    async fn find_organization(
        &self,
        reference: &ProjectReference,
    ) -> OperatorResult<Option<Organization>> {
        let control_plane = self.control_plane();
        if reference.org_id.is_empty() {
            let name = &reference.project_name;
            debug!(organization = %name, "organization id not set, looking it up by project name");
            let organizations = control_plane
                .find_organizations_by_name(name)
                .await
                .map_err(|e| e.context("find organization"))?;
            return Ok(organizations.into_iter().find(|o| &o.name == name));
        }
        match control_plane.read_organization(&reference.org_id).await {
            Ok(Some(org)) => Ok(Some(org)),
            Ok(None) => Err(OperatorError::NotFound(format!(
                "organization with id {}",
                reference.org_id
            ))),
            Err(e) => Err(e.context("read organization")),
        }
    }

    async fn find_project(
        &self,
        name: &str,
        organization: &Organization,
    ) -> OperatorResult<Option<Project>> {
        let projects = self
            .control_plane()
            .find_projects_in_organization(&organization.id, name)
            .await
            .map_err(|e| e.context("find project"))?;
        // The lookup matches by prefix.
        let mut found: Vec<Project> = projects.into_iter().filter(|p| p.name == name).collect();
        match found.len() {
            0 => {
                debug!(project = %name, organization = %organization.id, "project not found");
                Ok(None)
            }
            1 => Ok(found.pop()),
            n => Err(OperatorError::control_plane(format!(
                "found {n} projects named {name} in organization {}",
                organization.id
            ))),
        }
    }

    async fn create_project(&self, name: &str, org_id: String) -> OperatorResult<Project> {
        info!(project = %name, organization = %org_id, "creating project");
        let request = NewProject {
            name: name.to_owned(),
            org_id,
            tags: vec![normalize_tag(EXTERNALLY_MANAGED_TAG)],
        };
        let control_plane = self.control_plane();
        let project = match control_plane.create_project(request.clone()).await {
            Ok(project) => project,
            Err(OperatorError::TagsRejected(reason)) => {
                warn!(project = %name, reason = %reason, "control plane rejected project tags, creating without them");
                control_plane
                    .create_project(NewProject {
                        tags: Vec::new(),
                        ..request
                    })
                    .await
                    .map_err(|e| e.context("create project"))?
            }
            Err(e) => return Err(e.context("create project")),
        };
        info!(project = %name, id = %project.id, "project created");
        Ok(project)
    }

    /// Add the management tag to an existing project; failures are only logged.
    async fn ensure_tag(&self, mut project: Project) -> Project {
        let tag = normalize_tag(EXTERNALLY_MANAGED_TAG);
        if project.tags.contains(&tag) {
            return project;
        }
        let original = project.clone();
        project.tags.push(tag);
        match self.control_plane().update_project(&project).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(project = %project.name, error = %e, "failed to tag project");
                original
            }
        }
    }

    /// Clear every tag of a project shared with other deployments, so its
    /// processes can be cleaned up by hand. Failures are only logged.
    pub async fn clear_project_tags(&self, context: &ProjectContext) {
        let project = Project {
            tags: Vec::new(),
            ..context.project.clone()
        };
        match self.control_plane().update_project(&project).await {
            Ok(_) => info!(project = %project.name, "removed management tag from shared project"),
            Err(e) => warn!(project = %project.name, error = %e, "failed to remove project tags"),
        }
    }

    /// Agent API key of the project, generated and stored on first use.
    ///
    /// Holds the project mutex so resources sharing a project share one key.
    pub async fn ensure_agent_key(
        &self,
        secrets: &dyn SecretStore,
        namespace: &str,
        project: &ProjectContext,
    ) -> OperatorResult<String> {
        let lock = self.mutexes().lock_for(&project.identity);
        let _guard = lock.lock().await;

        let secret_name = project.agent_key_secret();
        let existing = secrets
            .get(namespace, &secret_name)
            .await
            .map_err(|e| e.context("read agent key"))?;
        if let Some(key) = existing.and_then(|mut data| data.remove(AGENT_KEY_FIELD)) {
            return Ok(key);
        }

        let key = self
            .control_plane()
            .generate_agent_key(&project.project.id)
            .await
            .map_err(|e| e.context("generate agent key"))?;
        let data = SecretData::from([(AGENT_KEY_FIELD.to_owned(), key.clone())]);
        secrets
            .put(namespace, &secret_name, data)
            .await
            .map_err(|e| e.context("store agent key"))?;
        info!(project = %project.project.id, "generated agent key");
        Ok(key)
    }

    /// Declare the operator as the manager of authentication and server versions.
    pub async fn declare_controlled_features(&self, project: &ProjectContext) -> OperatorResult<()> {
        self.control_plane()
            .update_controlled_features(&project.project.id, &ControlledFeatures::operator_managed())
            .await
            .map_err(|e| e.context("update controlled features"))
    }
}
