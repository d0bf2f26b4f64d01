//! Preparing replica sets for a scale down.
//!
//! Members about to disappear lose their vote and priority first, and the
//! agents are given time to apply that before the members are removed from
//! the document. Removing a voting member in one step can leave the set
//! without a primary.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::control_plane::{ControlPlaneUpdater, ProjectContext};
use crate::error::OperatorResult;
use crate::workflow::WorkflowStatus;

/// Runs the pre-removal stage of a scale down.
#[derive(Clone)]
pub struct ScaleCoordinator {
    updater: Arc<ControlPlaneUpdater>,
}

impl ScaleCoordinator {
    /// Create a new coordinator.
    #[must_use]
    pub fn new(updater: Arc<ControlPlaneUpdater>) -> Self {
        Self { updater }
    }

    /// Mark the members in `draining` (replica set name to member names) as
    /// non-voting and wait until `wait_for` processes reach goal state.
    ///
    /// Does nothing when no member is draining. Marking an unknown replica
    /// set is logged and skipped; publish and wait failures are returned.
    pub async fn prepare_scale_down(
        &self,
        project: &ProjectContext,
        draining: &BTreeMap<String, Vec<String>>,
        wait_for: &[String],
    ) -> OperatorResult<()> {
        let members: Vec<&String> = draining.values().flatten().collect();
        if members.is_empty() {
            return Ok(());
        }

        self.updater
            .read_update_deployment(&project.identity, &project.project.id, |document| {
                for (rs, names) in draining {
                    if let Err(e) = document.mark_rs_members_unvoted(rs, names) {
                        error!(replica_set = %rs, error = %e, "problems scaling down replica set, was it changed in the control plane directly?");
                    }
                }
                Ok(())
            })
            .await
            .map_err(|e| e.context(&format!("unable to set votes and priority to 0, hosts: {members:?}")))?;

        self.updater
            .wait_for_ready_state(&project.project.id, wait_for)
            .await?;
        debug!(replica_sets = ?draining, "marked replica set members as non-voting");

        info!("Performed some preliminary steps to support scale down");
        Ok(())
    }

    /// [`prepare_scale_down`](Self::prepare_scale_down) folded into a workflow status.
    pub async fn prepare(
        &self,
        project: &ProjectContext,
        draining: &BTreeMap<String, Vec<String>>,
        wait_for: &[String],
    ) -> WorkflowStatus {
        match self.prepare_scale_down(project, draining, wait_for).await {
            Ok(()) => WorkflowStatus::ok(),
            Err(e) => WorkflowStatus::failed(format!("failed to prepare scale down: {e}")),
        }
    }
}
