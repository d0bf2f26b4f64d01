//! In-memory model of the control plane deployment document.
//!
//! The document is shared by every resource in a project, so every operation
//! here touches only the entries that belong to the resource being merged and
//! carries unknown fields through untouched.

mod process;
mod replica_set;
mod sharded;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{OperatorError, OperatorResult};

pub use process::{
    NetArgs, Process, ProcessArgs, ProcessType, TlsArgs, CLUSTER_AUTH_X509, TLS_MODE_DISABLED,
    TLS_MODE_REQUIRE,
};
pub use replica_set::{ReplicaSet, ReplicaSetMember, ReplicaSetWithProcesses, PROTOCOL_VERSION};
pub use sharded::{is_shard_of_cluster, Shard, ShardedCluster};

/// Maximum number of voting members in a replica set.
pub const MAX_VOTING_MEMBERS: usize = 7;

/// Authentication mechanism name for x509 in the document.
pub const X509_MECHANISM: &str = "MONGODB-X509";
/// Database holding x509 users.
pub const X509_DATABASE: &str = "$external";
/// Automation agent user when authentication is off.
pub const AUTOMATION_AGENT_USER: &str = "mms-automation";
/// Automation agent x509 subject.
pub const AUTOMATION_AGENT_SUBJECT: &str =
    "CN=mms-automation-agent,OU=cloud,O=MongoDB,L=New York,ST=New York,C=US";
/// Monitoring agent x509 subject.
pub const MONITORING_AGENT_SUBJECT: &str =
    "CN=mms-monitoring-agent,OU=cloud,O=MongoDB,L=New York,ST=New York,C=US";
/// Backup agent x509 subject.
pub const BACKUP_AGENT_SUBJECT: &str =
    "CN=mms-backup-agent,OU=cloud,O=MongoDB,L=New York,ST=New York,C=US";
/// Automation agent certificate inside the pods.
pub const AGENT_PEM_FILE_PATH: &str = "/mongodb-automation/agent-certs/mms-automation-agent-pem";

const CLIENT_CERTIFICATES_OPTIONAL: &str = "OPTIONAL";
const CLIENT_CERTIFICATES_REQUIRED: &str = "REQUIRE";

/// A monitoring or backup agent entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    /// Host the agent runs on.
    pub hostname: String,
    /// Agent version.
    pub name: String,
    /// Extra agent parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_params: BTreeMap<String, String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentEntry {
    fn new(hostname: &str, version: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            name: version.to_owned(),
            additional_params: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// A role granted to a database user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    /// Role name.
    pub role: String,
    /// Database the role applies to.
    pub db: String,
}

/// A user the automation agent maintains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseUser {
    /// User name.
    pub user: String,
    /// Authentication database.
    pub db: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<UserRole>,
    /// Allowed mechanisms.
    #[serde(default)]
    pub mechanisms: Vec<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatabaseUser {
    fn x509_agent(subject: &str, roles: &[(&str, &str)]) -> Self {
        Self {
            user: subject.to_owned(),
            db: X509_DATABASE.to_owned(),
            roles: roles
                .iter()
                .map(|(role, db)| UserRole {
                    role: (*role).to_owned(),
                    db: (*db).to_owned(),
                })
                .collect(),
            mechanisms: Vec::new(),
            extra: Map::new(),
        }
    }
}

fn agent_users() -> [DatabaseUser; 2] {
    [
        DatabaseUser::x509_agent(
            MONITORING_AGENT_SUBJECT,
            &[("clusterMonitor", "admin")],
        ),
        DatabaseUser::x509_agent(
            BACKUP_AGENT_SUBJECT,
            &[
                ("clusterAdmin", "admin"),
                ("readAnyDatabase", "admin"),
                ("dbAdminAnyDatabase", "admin"),
                ("readWrite", "local"),
                ("readWrite", "admin"),
            ],
        ),
    ]
}

/// The `auth` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    /// Whether authentication is off.
    #[serde(default = "default_auth_disabled")]
    pub disabled: bool,
    /// Whether the agent removes users it did not create.
    #[serde(default)]
    pub authoritative_set: bool,
    /// User the automation agent connects as.
    #[serde(default)]
    pub auto_user: String,
    /// Mechanisms the agents use.
    #[serde(default)]
    pub auto_auth_mechanisms: Vec<String>,
    /// Mechanisms enabled on the deployment.
    #[serde(default)]
    pub deployment_auth_mechanisms: Vec<String>,
    /// Users maintained by automation.
    #[serde(default)]
    pub users_wanted: Vec<DatabaseUser>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_auth_disabled() -> bool {
    true
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            disabled: true,
            authoritative_set: false,
            auto_user: String::new(),
            auto_auth_mechanisms: Vec::new(),
            deployment_auth_mechanisms: Vec::new(),
            users_wanted: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// The deployment-wide `tls` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTls {
    /// CA file path used by the agents.
    #[serde(rename = "CAFilePath", default, skip_serializing_if = "Option::is_none")]
    pub ca_file_path: Option<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// TLS settings of the automation agent itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTls {
    /// CA file path.
    #[serde(rename = "CAFilePath", default, skip_serializing_if = "Option::is_none")]
    pub ca_file_path: Option<String>,
    /// Agent certificate path.
    #[serde(rename = "autoPEMKeyFilePath", default, skip_serializing_if = "Option::is_none")]
    pub auto_pem_key_file_path: Option<String>,
    /// Whether clients must present certificates.
    #[serde(default)]
    pub client_certificate_mode: String,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The full deployment document of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDocument {
    /// Version, incremented by the control plane on every accepted publish.
    #[serde(default)]
    pub version: u64,
    /// All processes of the project.
    #[serde(default)]
    pub processes: Vec<Process>,
    /// All replica sets of the project.
    #[serde(default)]
    pub replica_sets: Vec<ReplicaSet>,
    /// All sharded clusters of the project.
    #[serde(default)]
    pub sharding: Vec<ShardedCluster>,
    /// Monitoring agents.
    #[serde(default)]
    pub monitoring_versions: Vec<AgentEntry>,
    /// Backup agents.
    #[serde(default)]
    pub backup_versions: Vec<AgentEntry>,
    /// Authentication.
    #[serde(default)]
    pub auth: AuthSettings,
    /// Deployment TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<DeploymentTls>,
    /// Agent TLS.
    #[serde(rename = "agentSSL", default, skip_serializing_if = "Option::is_none")]
    pub agent_tls: Option<AgentTls>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeploymentDocument {
    /// Whether both documents have the same content, ignoring the version.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let mut ours = self.clone();
        ours.version = other.version;
        ours == *other
    }

    /// Number of processes in the project.
    #[must_use]
    pub fn number_of_processes(&self) -> usize {
        self.processes.len()
    }

    /// The process named `name`.
    #[must_use]
    pub fn process(&self, name: &str) -> Option<&Process> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// The replica set named `name`.
    #[must_use]
    pub fn replica_set(&self, name: &str) -> Option<&ReplicaSet> {
        self.replica_sets.iter().find(|r| r.name == name)
    }

    /// Merge one process: update it in place when it exists, add it otherwise.
    pub fn merge_standalone(&mut self, operator: Process) {
        match self.processes.iter_mut().find(|p| p.name == operator.name) {
            Some(existing) => {
                existing.merge_from(&operator);
                debug!(process = %operator.name, "merged process into existing one");
            }
            None => {
                debug!(process = %operator.name, "added process");
                self.processes.push(operator);
            }
        }
    }

    /// Merge a replica set and its processes.
    ///
    /// On scale up the first existing member is copied to the new positions
    /// so that changes made through the control plane carry over. Members
    /// dropped from the set lose their processes and agent entries. At most
    /// [`MAX_VOTING_MEMBERS`] members keep a vote.
    pub fn merge_replica_set(&mut self, operator: ReplicaSetWithProcesses) {
        let name = operator.rs.name.clone();

        let existing_members = self.replica_set(&name).map(|r| r.members.len());
        if let Some(existing) = existing_members {
            if operator.rs.members.len() > existing {
                self.copy_first_process_to_new_positions(&operator.processes, existing);
            }
        }

        for process in operator.processes {
            self.merge_standalone(process);
        }

        match self.replica_sets.iter_mut().find(|r| r.name == name) {
            None => {
                debug!(replica_set = %name, "added replica set");
                self.replica_sets.push(operator.rs);
            }
            Some(existing) => {
                let removed = existing.merge_from(&operator.rs);
                debug!(replica_set = %name, "merged replica set into existing one");
                if !removed.is_empty() {
                    debug!(replica_set = %name, removed = ?removed, "removed processes dropped from replica set");
                    self.remove_processes(&removed);
                }
            }
        }

        if let Some(rs) = self.replica_sets.iter_mut().find(|r| r.name == name) {
            rs.limit_voting_members(MAX_VOTING_MEMBERS);
        }
    }

    /// Seed processes `[first_new..]` from the first of `processes` already in the document.
    pub(crate) fn copy_first_process_to_new_positions(
        &mut self,
        processes: &[Process],
        first_new: usize,
    ) {
        let Some(sample) = processes
            .iter()
            .find_map(|p| self.process(&p.name))
            .cloned()
        else {
            return;
        };

        for process in processes.iter().skip(first_new) {
            if self.process(&process.name).is_some() {
                continue;
            }
            let mut copy = sample.clone();
            copy.name.clone_from(&process.name);
            copy.hostname.clone_from(&process.hostname);
            copy.alias = None;
            self.processes.push(copy);
        }
    }

    /// Strip vote and priority from `members` of replica set `rs_name`.
    pub fn mark_rs_members_unvoted(&mut self, rs_name: &str, members: &[String]) -> OperatorResult<()> {
        let Some(rs) = self.replica_sets.iter_mut().find(|r| r.name == rs_name) else {
            return Err(OperatorError::NotFound(format!(
                "replica set {rs_name} does not exist"
            )));
        };
        let missing: Vec<&String> = members
            .iter()
            .filter(|m| !rs.members.iter().any(|r| &r.host == *m))
            .collect();
        rs.unvote_members(members);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OperatorError::document(format!(
                "failed to find the following members of replica set {rs_name}: {missing:?}"
            )))
        }
    }

    /// Remove the processes named `names` together with their agent entries.
    pub(crate) fn remove_processes(&mut self, names: &[String]) {
        self.remove_monitoring_and_backup(names);
        self.processes.retain(|p| !names.contains(&p.name));
    }

    /// Remove a single process and its agent entries.
    pub fn remove_process_by_name(&mut self, name: &str) -> OperatorResult<()> {
        if self.process(name).is_none() {
            return Err(OperatorError::NotFound(format!(
                "standalone {name} does not exist"
            )));
        }
        self.remove_processes(&[name.to_owned()]);
        Ok(())
    }

    /// Remove a replica set and all of its processes.
    pub fn remove_replica_set_by_name(&mut self, name: &str) -> OperatorResult<()> {
        let Some(position) = self.replica_sets.iter().position(|r| r.name == name) else {
            return Err(OperatorError::NotFound(format!(
                "replica set {name} does not exist"
            )));
        };
        let rs = self.replica_sets.remove(position);
        self.remove_processes(&rs.member_names());
        Ok(())
    }

    /// Register a monitoring agent on `hostname` and a backup agent on every process host.
    ///
    /// Existing entries are kept; with `tls_ca` set the monitoring agent is
    /// told to connect over TLS trusting that CA.
    pub fn add_monitoring_and_backup(
        &mut self,
        hostname: &str,
        tls_ca: Option<&str>,
        agents: &AgentConfig,
    ) {
        if self.processes.is_empty() {
            return;
        }

        let position = match self.monitoring_versions.iter().position(|m| m.hostname == hostname) {
            Some(position) => position,
            None => {
                self.monitoring_versions
                    .push(AgentEntry::new(hostname, &agents.monitoring_version));
                debug!(host = %hostname, "added monitoring agent");
                self.monitoring_versions.len() - 1
            }
        };
        let params = &mut self.monitoring_versions[position].additional_params;
        match tls_ca {
            Some(ca) => {
                params.insert("useSslForAllConnections".to_owned(), "true".to_owned());
                params.insert("sslTrustedServerCertificates".to_owned(), ca.to_owned());
            }
            None => {
                params.remove("useSslForAllConnections");
                params.remove("sslTrustedServerCertificates");
            }
        }

        let hosts: Vec<String> = self.processes.iter().map(|p| p.hostname.clone()).collect();
        for host in hosts {
            if !self.backup_versions.iter().any(|b| b.hostname == host) {
                debug!(host = %host, "added backup agent");
                self.backup_versions
                    .push(AgentEntry::new(&host, &agents.backup_version));
            }
        }
    }

    /// Drop agent entries on the hosts of the processes named `names`.
    pub fn remove_monitoring_and_backup(&mut self, names: &[String]) {
        let hosts = self.hostnames_of(names);
        self.monitoring_versions
            .retain(|m| !hosts.contains(&m.hostname));
        self.backup_versions.retain(|b| !hosts.contains(&b.hostname));
    }

    /// Hostnames of the processes named `names`; unknown names are skipped.
    #[must_use]
    pub fn hostnames_of(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter_map(|n| self.process(n))
            .map(|p| p.hostname.clone())
            .collect()
    }

    /// Apply the deployment-wide TLS block.
    pub fn configure_tls(&mut self, enabled: bool, ca_file_path: &str) {
        if !enabled {
            self.tls = None;
            return;
        }
        self.tls
            .get_or_insert_with(DeploymentTls::default)
            .ca_file_path = Some(ca_file_path.to_owned());
    }

    /// Apply internal cluster authentication `mode` to the named processes.
    pub fn configure_internal_cluster_authentication(
        &mut self,
        names: &[String],
        mode: &str,
        cluster_file_dir: &str,
    ) {
        for process in self.processes.iter_mut().filter(|p| names.contains(&p.name)) {
            process.configure_cluster_auth_mode(mode, cluster_file_dir);
        }
    }

    /// Enable x509 for the agents and the deployment.
    pub fn enable_x509_authentication(&mut self, ca_file_path: &str) {
        let auth = &mut self.auth;
        auth.disabled = false;
        auth.authoritative_set = true;
        auth.auto_user = AUTOMATION_AGENT_SUBJECT.to_owned();
        for user in agent_users() {
            match auth
                .users_wanted
                .iter_mut()
                .find(|u| u.user == user.user && u.db == user.db)
            {
                Some(existing) => {
                    existing.roles = user.roles;
                    existing.mechanisms = user.mechanisms;
                }
                None => auth.users_wanted.push(user),
            }
        }
        for mechanisms in [
            &mut auth.auto_auth_mechanisms,
            &mut auth.deployment_auth_mechanisms,
        ] {
            if !mechanisms.iter().any(|m| m == X509_MECHANISM) {
                mechanisms.push(X509_MECHANISM.to_owned());
            }
        }
        self.agent_tls = Some(AgentTls {
            ca_file_path: Some(ca_file_path.to_owned()),
            auto_pem_key_file_path: Some(AGENT_PEM_FILE_PATH.to_owned()),
            client_certificate_mode: CLIENT_CERTIFICATES_REQUIRED.to_owned(),
            extra: Map::new(),
        });
    }

    /// Turn x509 client authentication off and remove the agent users.
    pub fn disable_x509_authentication(&mut self) {
        let auth = &mut self.auth;
        auth.disabled = true;
        auth.auto_user = AUTOMATION_AGENT_USER.to_owned();
        auth.auto_auth_mechanisms.clear();
        auth.deployment_auth_mechanisms.clear();
        let agents = agent_users();
        auth.users_wanted
            .retain(|u| !agents.iter().any(|a| a.user == u.user && a.db == u.db));
        self.agent_tls = Some(AgentTls {
            client_certificate_mode: CLIENT_CERTIFICATES_OPTIONAL.to_owned(),
            ..AgentTls::default()
        });
    }

    /// Whether x509 client authentication is on.
    #[must_use]
    pub fn is_x509_enabled(&self) -> bool {
        !self.auth.disabled
            && self
                .auth
                .deployment_auth_mechanisms
                .iter()
                .any(|m| m == X509_MECHANISM)
    }

    /// Whether every process has a TLS key configured.
    #[must_use]
    pub fn all_processes_are_tls_enabled(&self) -> bool {
        self.processes.iter().all(Process::is_tls_enabled)
    }

    /// Whether x509 can be switched on in a single publish.
    ///
    /// The control plane rejects enabling x509 while some process still
    /// runs without TLS; an empty project is always fine.
    #[must_use]
    pub fn x509_can_be_enabled(&self) -> bool {
        self.processes.is_empty() || self.all_processes_are_tls_enabled()
    }

    /// Whether any of the named processes already authenticates members.
    #[must_use]
    pub fn existing_processes_have_internal_cluster_authentication(&self, names: &[String]) -> bool {
        self.processes
            .iter()
            .filter(|p| names.contains(&p.name))
            .any(Process::has_internal_cluster_authentication)
    }

    /// Whether applying `tls_enabled` would switch deployment TLS off.
    #[must_use]
    pub fn tls_configuration_will_be_disabled(&self, tls_enabled: bool) -> bool {
        !tls_enabled
            && self
                .tls
                .as_ref()
                .is_some_and(|t| t.ca_file_path.as_deref().is_some_and(|p| !p.is_empty()))
    }

    /// Names of the processes belonging to the resource `name`, of any kind.
    #[must_use]
    pub fn process_names_for(&self, name: &str) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(cluster) = self.sharded_cluster(name) {
            for rs in cluster.replica_set_names() {
                if let Some(rs) = self.replica_set(&rs) {
                    names.extend(rs.member_names());
                }
            }
            names.extend(self.mongos_process_names(name));
        }
        if let Some(rs) = self.replica_set(name) {
            names.extend(rs.member_names());
        }
        if self.process(name).is_some() {
            names.push(name.to_owned());
        }
        names
    }

    /// Processes in the project that do not belong to the resource `name`.
    ///
    /// Replica sets drained out of a sharded cluster still count as part of it.
    #[must_use]
    pub fn number_of_excess_processes(&self, name: &str) -> usize {
        let mut own = self.process_names_for(name);
        if self.sharded_cluster(name).is_some() {
            for rs in self.replica_sets_removed_from_cluster(name) {
                if let Some(rs) = self.replica_set(&rs) {
                    own.extend(rs.member_names());
                }
            }
        }
        self.processes
            .iter()
            .filter(|p| !own.contains(&p.name))
            .count()
    }
}
