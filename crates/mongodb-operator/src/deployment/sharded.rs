//! Sharded cluster entries and the sharded cluster merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::process::{Process, ProcessType};
use super::replica_set::ReplicaSetWithProcesses;
use super::DeploymentDocument;
use crate::error::{OperatorError, OperatorResult};

/// One shard of a sharded cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    /// Shard id; the operator uses the replica set name.
    #[serde(rename = "_id")]
    pub id: String,
    /// Backing replica set.
    pub rs: String,
    /// Zone tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Shard {
    /// A shard backed by the replica set `rs`.
    #[must_use]
    pub fn new(rs: impl Into<String>) -> Self {
        let rs = rs.into();
        Self {
            id: rs.clone(),
            rs,
            tags: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// A `sharding` entry of the deployment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardedCluster {
    /// Cluster name.
    pub name: String,
    /// Config server replica set name.
    pub config_server_replica: String,
    /// Active shards.
    #[serde(default)]
    pub shards: Vec<Shard>,
    /// Replica sets being drained out of the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub draining: Vec<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShardedCluster {
    /// A cluster entry for the given config server and shard sets.
    #[must_use]
    pub fn new(name: &str, config_rs: &str, shards: &[ReplicaSetWithProcesses]) -> Self {
        Self {
            name: name.to_owned(),
            config_server_replica: config_rs.to_owned(),
            shards: shards.iter().map(|s| Shard::new(s.name())).collect(),
            draining: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Take the operator's shard list, keeping unmanaged fields of shards that survive.
    pub fn merge_from(&mut self, operator: &Self) {
        self.name.clone_from(&operator.name);
        self.config_server_replica
            .clone_from(&operator.config_server_replica);

        let shards: Vec<Shard> = operator
            .shards
            .iter()
            .map(|op_shard| match self.shards.iter().find(|s| s.id == op_shard.id) {
                Some(existing) => Shard {
                    rs: op_shard.rs.clone(),
                    tags: op_shard.tags.clone(),
                    ..existing.clone()
                },
                None => op_shard.clone(),
            })
            .collect();
        self.shards = shards;
    }

    /// Replica sets referenced by this cluster, shards first.
    #[must_use]
    pub fn replica_set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.iter().map(|s| s.rs.clone()).collect();
        names.push(self.config_server_replica.clone());
        names
    }

    fn add_to_draining(&mut self, names: &[String]) {
        for name in names {
            if !self.draining.contains(name) {
                self.draining.push(name.clone());
            }
        }
    }
}

/// Whether `rs_name` follows the shard naming of `cluster`, i.e. `<cluster>-<digits>`.
#[must_use]
pub fn is_shard_of_cluster(cluster: &str, rs_name: &str) -> bool {
    rs_name
        .strip_prefix(cluster)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

impl DeploymentDocument {
    /// Merge a sharded cluster: mongos routers, the config server set and every shard.
    ///
    /// Replica sets that look like shards of this cluster but are no longer
    /// part of it are drained first and removed only when `finalizing` is set.
    /// Returns `true` when shards were scheduled for removal.
    pub fn merge_sharded_cluster(
        &mut self,
        name: &str,
        mongos: Vec<Process>,
        config_rs: ReplicaSetWithProcesses,
        shards: Vec<ReplicaSetWithProcesses>,
        finalizing: bool,
    ) -> OperatorResult<bool> {
        self.merge_mongos_processes(name, mongos)?;

        let config_name = config_rs.name().to_owned();
        let config_rs = ReplicaSetWithProcesses {
            processes: config_rs
                .processes
                .into_iter()
                .map(Process::with_config_server_role)
                .collect(),
            rs: config_rs.rs,
        };
        self.merge_replica_set(config_rs);

        let cluster = ShardedCluster::new(name, &config_name, &shards);
        for shard in shards {
            self.merge_replica_set(shard);
        }

        let Some(position) = self.sharding.iter().position(|s| s.name == name) else {
            self.sharding.push(cluster);
            debug!(cluster = %name, "added sharded cluster");
            return Ok(false);
        };
        self.sharding[position].merge_from(&cluster);
        debug!(cluster = %name, "merged sharded cluster into existing one");

        Ok(self.handle_shards_removal(name, finalizing))
    }

    fn merge_mongos_processes(&mut self, cluster: &str, mongos: Vec<Process>) -> OperatorResult<()> {
        let stale: Vec<String> = self
            .mongos_process_names(cluster)
            .into_iter()
            .filter(|n| !mongos.iter().any(|p| &p.name == n))
            .collect();
        if !stale.is_empty() {
            debug!(cluster = %cluster, removed = ?stale, "removed redundant mongos processes");
            self.remove_processes(&stale);
        }

        let existing = self.mongos_process_names(cluster).len();
        if existing > 0 && existing < mongos.len() {
            self.copy_first_process_to_new_positions(&mongos, existing);
        }

        for mut process in mongos {
            if process.process_type != ProcessType::Mongos {
                return Err(OperatorError::document(
                    "all mongos processes must have processType \"mongos\"",
                ));
            }
            process.cluster = Some(cluster.to_owned());
            self.merge_standalone(process);
        }
        Ok(())
    }

    fn handle_shards_removal(&mut self, cluster: &str, finalizing: bool) -> bool {
        let junk = self.replica_sets_removed_from_cluster(cluster);
        if junk.is_empty() {
            return false;
        }
        let Some(entry) = self.sharding.iter_mut().find(|s| s.name == cluster) else {
            return false;
        };

        if !finalizing {
            entry.add_to_draining(&junk);
            info!(cluster = %cluster, draining = ?entry.draining, "shards scheduled for removal");
            return true;
        }

        entry.draining.clear();
        for rs in &junk {
            if let Err(e) = self.remove_replica_set_by_name(rs) {
                warn!(replica_set = %rs, error = %e, "failed to remove drained replica set");
            }
        }
        debug!(cluster = %cluster, replica_sets = ?junk, "removed replica sets drained from cluster");
        false
    }

    /// Names of mongos processes routing for `cluster`.
    #[must_use]
    pub fn mongos_process_names(&self, cluster: &str) -> Vec<String> {
        self.processes
            .iter()
            .filter(|p| p.process_type == ProcessType::Mongos && p.cluster.as_deref() == Some(cluster))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Replica sets named like shards of `cluster` that the cluster no longer references.
    #[must_use]
    pub fn replica_sets_removed_from_cluster(&self, cluster: &str) -> Vec<String> {
        let Some(entry) = self.sharded_cluster(cluster) else {
            return Vec::new();
        };
        let referenced = entry.replica_set_names();
        self.replica_sets
            .iter()
            .map(|rs| rs.name.clone())
            .filter(|rs| !referenced.contains(rs) && is_shard_of_cluster(cluster, rs))
            .collect()
    }

    /// The sharding entry for `name`.
    #[must_use]
    pub fn sharded_cluster(&self, name: &str) -> Option<&ShardedCluster> {
        self.sharding.iter().find(|s| s.name == name)
    }

    /// Remove a sharded cluster with its shard sets, config server set and mongos processes.
    pub fn remove_sharded_cluster_by_name(&mut self, name: &str) -> OperatorResult<()> {
        let Some(position) = self.sharding.iter().position(|s| s.name == name) else {
            return Err(OperatorError::NotFound(format!(
                "sharded cluster {name} does not exist"
            )));
        };
        let cluster = self.sharding.remove(position);

        let sets = cluster
            .shards
            .iter()
            .map(|s| &s.rs)
            .chain(&cluster.draining)
            .chain(std::iter::once(&cluster.config_server_replica));
        for rs in sets {
            match self.remove_replica_set_by_name(rs) {
                Ok(()) => debug!(cluster = %name, rs = %rs, "removed cluster replica set"),
                Err(OperatorError::NotFound(_)) => {
                    debug!(cluster = %name, rs = %rs, "cluster replica set already absent");
                }
                Err(e) => return Err(e),
            }
        }

        let mongos = self.mongos_process_names(name);
        self.remove_processes(&mongos);
        Ok(())
    }
}
