//! Test fixtures for reconciliation integration tests.

use mongodb_operator::types::{
    AuthenticationSpec, ProjectReference, SecuritySpec, ShardedSize, TlsSpec, AUTH_MODE_X509,
};
use mongodb_operator::{DeclaredSpec, ResourceKind};

/// Builder for declared specs.
pub struct SpecBuilder {
    spec: DeclaredSpec,
}

impl SpecBuilder {
    fn new(name: &str, kind: ResourceKind) -> Self {
        Self {
            spec: DeclaredSpec {
                name: name.to_string(),
                namespace: "mongodb".to_string(),
                kind,
                version: "6.0.5".to_string(),
                feature_compatibility_version: None,
                members: 0,
                sharded: ShardedSize::default(),
                memory_limit: None,
                cluster_domain: None,
                security: SecuritySpec::default(),
                replica_set_horizons: Vec::new(),
                project: ProjectReference {
                    project_name: "my-project".to_string(),
                    org_id: String::new(),
                    base_url: "http://ops-manager:8080".to_string(),
                    credentials: "my-credentials".to_string(),
                },
            },
        }
    }

    /// A replica set with `members` members.
    pub fn replica_set(name: &str, members: u32) -> Self {
        let mut builder = Self::new(name, ResourceKind::ReplicaSet);
        builder.spec.members = members;
        builder
    }

    /// A standalone.
    pub fn standalone(name: &str) -> Self {
        Self::new(name, ResourceKind::Standalone)
    }

    /// A sharded cluster.
    pub fn sharded(name: &str, shards: u32, per_shard: u32, mongos: u32, config: u32) -> Self {
        let mut builder = Self::new(name, ResourceKind::ShardedCluster);
        builder.spec.sharded = ShardedSize {
            shard_count: shards,
            mongods_per_shard_count: per_shard,
            mongos_count: mongos,
            config_server_count: config,
        };
        builder
    }

    /// Sets the project the resource belongs to.
    pub fn in_project(mut self, project: &str) -> Self {
        self.spec.project.project_name = project.to_string();
        self
    }

    /// Sets the MongoDB version.
    pub fn with_version(mut self, version: &str) -> Self {
        self.spec.version = version.to_string();
        self
    }

    /// Enables TLS.
    pub fn with_tls(mut self) -> Self {
        self.spec.security.tls = TlsSpec {
            enabled: true,
            ca: None,
        };
        self
    }

    /// Enables x509 client authentication.
    pub fn with_x509(mut self) -> Self {
        self.spec.security.authentication = AuthenticationSpec {
            enabled: true,
            modes: vec![AUTH_MODE_X509.to_string()],
            ..self.spec.security.authentication
        };
        self
    }

    /// Enables x509 internal cluster authentication.
    pub fn with_internal_cluster_x509(mut self) -> Self {
        self.spec.security.authentication.internal_cluster = AUTH_MODE_X509.to_string();
        self
    }

    /// Builds the spec.
    pub fn build(self) -> DeclaredSpec {
        self.spec
    }
}

/// `spec` with a different member count.
pub fn resized(spec: &DeclaredSpec, members: u32) -> DeclaredSpec {
    DeclaredSpec {
        members,
        ..spec.clone()
    }
}
