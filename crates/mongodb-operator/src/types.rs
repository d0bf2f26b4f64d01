//! Core types for mongodb-operator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, OperatorResult};

/// Namespaced identity of a MongoDB resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Resource name.
    pub name: String,
}

impl ResourceKey {
    /// Create a new resource key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifier of a project in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Create a new project ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique project ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of MongoDB deployment a resource declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ResourceKind {
    /// A single mongod.
    Standalone,
    /// A replica set.
    ReplicaSet,
    /// Mongos routers, a config server replica set and shard replica sets.
    ShardedCluster,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standalone => write!(f, "Standalone"),
            Self::ReplicaSet => write!(f, "ReplicaSet"),
            Self::ShardedCluster => write!(f, "ShardedCluster"),
        }
    }
}

/// Persisted lifecycle phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting on something outside the engine.
    #[default]
    Pending,
    /// A reconciliation is in progress.
    Reconciling,
    /// The declared shape has been applied.
    Running,
    /// The last reconciliation failed.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Authentication mode names accepted in the declared spec.
pub const AUTH_MODE_X509: &str = "X509";

/// Reference to the control plane project a resource belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectReference {
    /// Project name in the control plane.
    pub project_name: String,
    /// Organization ID; empty means "organization named like the project".
    #[serde(default)]
    pub org_id: String,
    /// Control plane base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the credentials secret.
    #[serde(default)]
    pub credentials: String,
}

fn default_base_url() -> String {
    "http://ops-manager-svc:8080".to_owned()
}

impl ProjectReference {
    /// Key used to serialise operations against the same remote project.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}/{}", self.project_name, self.org_id)
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Whether TLS is required for all connections.
    #[serde(default)]
    pub enabled: bool,
    /// Name of a custom CA config map.
    #[serde(default)]
    pub ca: Option<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Whether client authentication is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Client authentication modes, e.g. `X509`.
    #[serde(default)]
    pub modes: Vec<String>,
    /// Internal cluster authentication mode; empty disables it.
    #[serde(default)]
    pub internal_cluster: String,
}

impl AuthenticationSpec {
    /// Whether x509 client authentication is requested.
    #[must_use]
    pub fn x509_enabled(&self) -> bool {
        self.enabled && self.modes.iter().any(|m| m == AUTH_MODE_X509)
    }

    /// Whether x509 internal cluster authentication is requested.
    #[must_use]
    pub fn internal_cluster_x509(&self) -> bool {
        self.internal_cluster.eq_ignore_ascii_case(AUTH_MODE_X509)
    }

    /// Cluster auth mode value written to process arguments.
    #[must_use]
    pub fn cluster_auth_mode(&self) -> &'static str {
        if self.internal_cluster_x509() {
            "x509"
        } else {
            ""
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// TLS settings.
    #[serde(default)]
    pub tls: TlsSpec,
    /// Authentication settings.
    #[serde(default)]
    pub authentication: AuthenticationSpec,
}

/// Size of a sharded cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardedSize {
    /// Number of shards.
    #[serde(default)]
    pub shard_count: u32,
    /// Members in each shard replica set.
    #[serde(default)]
    pub mongods_per_shard_count: u32,
    /// Number of mongos routers.
    #[serde(default)]
    pub mongos_count: u32,
    /// Members in the config server replica set.
    #[serde(default)]
    pub config_server_count: u32,
}

impl ShardedSize {
    /// Component-wise maximum of two sizes.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            shard_count: self.shard_count.max(other.shard_count),
            mongods_per_shard_count: self
                .mongods_per_shard_count
                .max(other.mongods_per_shard_count),
            mongos_count: self.mongos_count.max(other.mongos_count),
            config_server_count: self.config_server_count.max(other.config_server_count),
        }
    }
}

/// A single split horizon: horizon name to external `host:port`.
pub type HorizonConfig = BTreeMap<String, String>;

/// User intent for a MongoDB resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredSpec {
    /// Resource name.
    pub name: String,
    /// Resource namespace.
    pub namespace: String,
    /// Deployment kind.
    pub kind: ResourceKind,
    /// MongoDB version, e.g. `4.2.1` or `4.0.6-ent`.
    pub version: String,
    /// Feature compatibility version.
    #[serde(default)]
    pub feature_compatibility_version: Option<String>,
    /// Replica set members.
    #[serde(default)]
    pub members: u32,
    /// Sharded cluster size.
    #[serde(flatten)]
    pub sharded: ShardedSize,
    /// Memory limit of each container, as a quantity such as `2Gi`.
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Cluster domain; falls back to the configured default.
    #[serde(default)]
    pub cluster_domain: Option<String>,
    /// Security settings.
    #[serde(default)]
    pub security: SecuritySpec,
    /// Replica set horizons, one entry per member.
    #[serde(default)]
    pub replica_set_horizons: Vec<HorizonConfig>,
    /// Control plane project reference.
    pub project: ProjectReference,
}

impl DeclaredSpec {
    /// Key identifying this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    /// Whether x509 is requested for clients or for members.
    #[must_use]
    pub fn x509_requested(&self) -> bool {
        self.security.authentication.x509_enabled()
            || self.security.authentication.internal_cluster_x509()
    }

    /// Check the declared spec for combinations that no amount of retrying can fix.
    pub fn validate(&self) -> OperatorResult<()> {
        let invalid = |msg: &str| Err(OperatorError::Validation(msg.to_owned()));
        let tls = self.security.tls.enabled;
        if self.x509_requested() && !tls {
            return invalid("cannot have a non-tls deployment when x509 authentication is enabled");
        }
        if !self.replica_set_horizons.is_empty() {
            if !tls {
                return invalid("TLS must be enabled in order to use replica set horizons");
            }
            if self.kind != ResourceKind::ReplicaSet {
                return invalid("replica set horizons are only supported for replica sets");
            }
            if self.replica_set_horizons.len() != usize_from(self.members) {
                return invalid("number of horizons must be equal to number of members in replica set");
            }
        }
        match self.kind {
            ResourceKind::Standalone => Ok(()),
            ResourceKind::ReplicaSet if self.members == 0 => {
                invalid("replica set must have at least one member")
            }
            ResourceKind::ReplicaSet => Ok(()),
            ResourceKind::ShardedCluster => {
                let size = self.sharded;
                if size.shard_count == 0
                    || size.mongods_per_shard_count == 0
                    || size.mongos_count == 0
                    || size.config_server_count == 0
                {
                    return invalid(
                        "sharded cluster requires shards, shard members, mongos and config servers",
                    );
                }
                Ok(())
            }
        }
    }
}

/// Last successfully applied shape plus the current phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedStatus {
    /// Current phase.
    pub phase: Phase,
    /// Version that was last applied.
    #[serde(default)]
    pub version: String,
    /// Replica set members (1 for a standalone).
    #[serde(default)]
    pub members: u32,
    /// Sharded cluster size.
    #[serde(flatten)]
    pub sharded: ShardedSize,
    /// Human-readable message for non-running phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Deduplicated warnings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// When the phase last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
    /// Link to the project in the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl ObservedStatus {
    /// Warnings rendered for display.
    #[must_use]
    pub fn rendered_warnings(&self) -> String {
        self.warnings.join("; ")
    }

    /// Set the phase, stamping the transition time only when it changes.
    pub fn set_phase(&mut self, phase: Phase, now: DateTime<Utc>) {
        if self.phase != phase || self.last_transition.is_none() {
            self.last_transition = Some(now);
        }
        self.phase = phase;
    }

    /// Replace the warnings, dropping duplicates while keeping order.
    pub fn set_warnings(&mut self, warnings: &[String]) {
        self.warnings.clear();
        for w in warnings {
            if !self.warnings.contains(w) {
                self.warnings.push(w.clone());
            }
        }
    }
}

/// Convert a member count to an index bound.
#[must_use]
pub(crate) fn usize_from(n: u32) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}
