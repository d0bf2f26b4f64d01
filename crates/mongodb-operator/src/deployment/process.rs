//! A single mongod or mongos entry of the deployment document.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// TLS mode written for processes requiring encrypted connections.
pub const TLS_MODE_REQUIRE: &str = "requireTLS";
/// TLS mode meaning TLS is switched off.
pub const TLS_MODE_DISABLED: &str = "disabled";
/// Cluster auth mode value for x509 member authentication.
pub const CLUSTER_AUTH_X509: &str = "x509";

const DEFAULT_PORT: u16 = 27017;
const DEFAULT_DB_PATH: &str = "/data";
const DEFAULT_LOG_PATH: &str = "/var/log/mongodb-mms-automation/mongodb.log";
const AUTH_SCHEMA_VERSION: u32 = 5;

/// Kind of server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    /// Data-bearing server.
    Mongod,
    /// Sharded cluster router.
    Mongos,
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mongod => write!(f, "mongod"),
            Self::Mongos => write!(f, "mongos"),
        }
    }
}

/// `net.tls` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsArgs {
    /// TLS mode.
    #[serde(default)]
    pub mode: String,
    /// Current key file option.
    #[serde(
        rename = "certificateKeyFile",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_key_file: Option<String>,
    /// Legacy key file option.
    #[serde(rename = "PEMKeyFile", default, skip_serializing_if = "Option::is_none")]
    pub pem_key_file: Option<String>,
    /// Key file used for member authentication.
    #[serde(rename = "clusterFile", default, skip_serializing_if = "Option::is_none")]
    pub cluster_file: Option<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `net` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetArgs {
    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS settings; absent when TLS is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsArgs>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for NetArgs {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tls: None,
            extra: Map::new(),
        }
    }
}

/// `storage.wiredTiger.engineConfig` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache size in GB.
    #[serde(rename = "cacheSizeGB", default, skip_serializing_if = "Option::is_none")]
    pub cache_size_gb: Option<f64>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `storage.wiredTiger` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WiredTigerArgs {
    /// Engine configuration.
    #[serde(default)]
    pub engine_config: EngineConfig,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `storage` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageArgs {
    /// Data directory.
    #[serde(default)]
    pub db_path: String,
    /// WiredTiger tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wired_tiger: Option<WiredTigerArgs>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `systemLog` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLogArgs {
    /// Log destination.
    #[serde(default)]
    pub destination: String,
    /// Log file path.
    #[serde(default)]
    pub path: String,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `replication` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationArgs {
    /// Replica set the process belongs to.
    #[serde(default)]
    pub repl_set_name: String,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `sharding` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingArgs {
    /// Role in a sharded cluster, e.g. `configsvr`.
    #[serde(default)]
    pub cluster_role: String,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `security` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityArgs {
    /// Member authentication mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_auth_mode: Option<String>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `args2_6` block: mongod/mongos configuration options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessArgs {
    /// Network options.
    #[serde(default)]
    pub net: NetArgs,
    /// Storage options (mongod only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageArgs>,
    /// Logging options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_log: Option<SystemLogArgs>,
    /// Replication options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationArgs>,
    /// Sharding options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingArgs>,
    /// Security options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityArgs>,
    /// Options not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One mongod/mongos instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Logical process name, e.g. `my-rs-0`.
    pub name: String,
    /// Fully qualified hostname.
    pub hostname: String,
    /// mongod or mongos.
    pub process_type: ProcessType,
    /// MongoDB version.
    pub version: String,
    /// Authentication schema version.
    #[serde(default = "default_auth_schema_version")]
    pub auth_schema_version: u32,
    /// Feature compatibility version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_compatibility_version: Option<String>,
    /// Sharded cluster a mongos routes for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Alias set through the control plane UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Whether automation keeps the process shut down.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Server configuration.
    #[serde(rename = "args2_6", default)]
    pub args: ProcessArgs,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_auth_schema_version() -> u32 {
    AUTH_SCHEMA_VERSION
}

impl Process {
    fn base(
        name: impl Into<String>,
        hostname: impl Into<String>,
        process_type: ProcessType,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            process_type,
            version: version.into(),
            auth_schema_version: AUTH_SCHEMA_VERSION,
            feature_compatibility_version: None,
            cluster: None,
            alias: None,
            disabled: false,
            args: ProcessArgs {
                system_log: Some(SystemLogArgs {
                    destination: "file".to_owned(),
                    path: DEFAULT_LOG_PATH.to_owned(),
                    extra: Map::new(),
                }),
                ..ProcessArgs::default()
            },
            extra: Map::new(),
        }
    }

    /// A mongod with default storage and logging.
    #[must_use]
    pub fn mongod(
        name: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let mut process = Self::base(name, hostname, ProcessType::Mongod, version);
        process.args.storage = Some(StorageArgs {
            db_path: DEFAULT_DB_PATH.to_owned(),
            ..StorageArgs::default()
        });
        process
    }

    /// A mongos routing for `cluster`.
    #[must_use]
    pub fn mongos(
        name: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        let mut process = Self::base(name, hostname, ProcessType::Mongos, version);
        process.cluster = Some(cluster.into());
        process
    }

    /// Set the feature compatibility version.
    #[must_use]
    pub fn with_feature_compatibility_version(mut self, fcv: Option<String>) -> Self {
        self.feature_compatibility_version = fcv;
        self
    }

    /// Make the process a member of `replica_set`.
    #[must_use]
    pub fn with_replica_set(mut self, replica_set: impl Into<String>) -> Self {
        self.args
            .replication
            .get_or_insert_with(ReplicationArgs::default)
            .repl_set_name = replica_set.into();
        self
    }

    /// Set the WiredTiger cache size (mongod only).
    #[must_use]
    pub fn with_wired_tiger_cache(mut self, cache_size_gb: f64) -> Self {
        if let Some(storage) = self.args.storage.as_mut() {
            storage
                .wired_tiger
                .get_or_insert_with(WiredTigerArgs::default)
                .engine_config
                .cache_size_gb = Some(cache_size_gb);
        }
        self
    }

    /// Mark the process as a config server.
    #[must_use]
    pub fn with_config_server_role(mut self) -> Self {
        self.args
            .sharding
            .get_or_insert_with(ShardingArgs::default)
            .cluster_role = "configsvr".to_owned();
        self
    }

    /// Require TLS with the key file at `key_file`.
    #[must_use]
    pub fn with_tls(mut self, key_file: impl Into<String>) -> Self {
        self.configure_tls(TLS_MODE_REQUIRE, &key_file.into());
        self
    }

    /// Configure x509 member authentication when `mode` asks for it.
    #[must_use]
    pub fn with_cluster_auth_mode(mut self, mode: &str, cluster_file_dir: &str) -> Self {
        self.configure_cluster_auth_mode(mode, cluster_file_dir);
        self
    }

    /// Set the TLS mode and key file, replacing the legacy key option.
    pub fn configure_tls(&mut self, mode: &str, key_file: &str) {
        let tls = self.args.net.tls.get_or_insert_with(TlsArgs::default);
        tls.mode = mode.to_owned();

        if mode == TLS_MODE_DISABLED {
            tls.certificate_key_file = None;
            tls.pem_key_file = None;
            return;
        }

        match (tls.pem_key_file.is_some(), tls.certificate_key_file.is_some()) {
            (true, false) => tls.pem_key_file = Some(key_file.to_owned()),
            _ => {
                tls.certificate_key_file = Some(key_file.to_owned());
                tls.pem_key_file = None;
            }
        }
    }

    /// Configure member authentication; only x509 is recognised.
    pub fn configure_cluster_auth_mode(&mut self, mode: &str, cluster_file_dir: &str) {
        if !mode.eq_ignore_ascii_case(CLUSTER_AUTH_X509) {
            return;
        }
        self.args
            .security
            .get_or_insert_with(SecurityArgs::default)
            .cluster_auth_mode = Some(CLUSTER_AUTH_X509.to_owned());
        let cluster_file = format!("{}/{}-pem", cluster_file_dir.trim_end_matches('/'), self.name);
        self.args
            .net
            .tls
            .get_or_insert_with(TlsArgs::default)
            .cluster_file = Some(cluster_file);
    }

    /// Whether the process has a TLS key configured.
    #[must_use]
    pub fn is_tls_enabled(&self) -> bool {
        self.args
            .net
            .tls
            .as_ref()
            .is_some_and(|t| t.pem_key_file.is_some() || t.certificate_key_file.is_some())
    }

    /// Member authentication mode, empty when unset.
    #[must_use]
    pub fn cluster_auth_mode(&self) -> &str {
        self.args
            .security
            .as_ref()
            .and_then(|s| s.cluster_auth_mode.as_deref())
            .unwrap_or_default()
    }

    /// Whether member authentication is configured.
    #[must_use]
    pub fn has_internal_cluster_authentication(&self) -> bool {
        !self.cluster_auth_mode().is_empty()
    }

    /// Replica set name, empty when the process is not a member.
    #[must_use]
    pub fn replica_set_name(&self) -> &str {
        self.args
            .replication
            .as_ref()
            .map(|r| r.repl_set_name.as_str())
            .unwrap_or_default()
    }

    /// Configured WiredTiger cache size.
    #[must_use]
    pub fn wired_tiger_cache(&self) -> Option<f64> {
        self.args
            .storage
            .as_ref()
            .and_then(|s| s.wired_tiger.as_ref())
            .and_then(|w| w.engine_config.cache_size_gb)
    }

    /// Merge the operator-owned fields of `operator` into this process.
    ///
    /// Fields the operator does not manage (aliases, extra options, the
    /// disabled flag) keep their current values. TLS settings follow the
    /// operator: present TLS is merged, absent TLS is removed.
    pub fn merge_from(&mut self, operator: &Self) {
        self.name.clone_from(&operator.name);
        self.hostname.clone_from(&operator.hostname);
        self.process_type = operator.process_type;
        self.version.clone_from(&operator.version);
        self.auth_schema_version = operator.auth_schema_version;
        if operator.feature_compatibility_version.is_some() {
            self.feature_compatibility_version
                .clone_from(&operator.feature_compatibility_version);
        }
        if operator.cluster.is_some() {
            self.cluster.clone_from(&operator.cluster);
        }
        for (k, v) in &operator.extra {
            self.extra.insert(k.clone(), v.clone());
        }

        let ours = &mut self.args;
        let theirs = &operator.args;

        ours.net.port = theirs.net.port;
        match &theirs.net.tls {
            Some(op_tls) => {
                let tls = ours.net.tls.get_or_insert_with(TlsArgs::default);
                tls.mode.clone_from(&op_tls.mode);
                if op_tls.certificate_key_file.is_some() {
                    tls.certificate_key_file
                        .clone_from(&op_tls.certificate_key_file);
                }
                if op_tls.pem_key_file.is_some() {
                    tls.pem_key_file.clone_from(&op_tls.pem_key_file);
                }
                if op_tls.cluster_file.is_some() {
                    tls.cluster_file.clone_from(&op_tls.cluster_file);
                }
                if tls.pem_key_file.is_some() && tls.certificate_key_file.is_some() {
                    tls.pem_key_file = None;
                }
                if tls.mode == TLS_MODE_DISABLED {
                    tls.pem_key_file = None;
                    tls.certificate_key_file = None;
                }
            }
            None => ours.net.tls = None,
        }

        if let Some(op_storage) = &theirs.storage {
            let storage = ours.storage.get_or_insert_with(StorageArgs::default);
            storage.db_path.clone_from(&op_storage.db_path);
            if let Some(cache) = op_storage
                .wired_tiger
                .as_ref()
                .and_then(|w| w.engine_config.cache_size_gb)
            {
                storage
                    .wired_tiger
                    .get_or_insert_with(WiredTigerArgs::default)
                    .engine_config
                    .cache_size_gb = Some(cache);
            }
        }
        if let Some(op_log) = &theirs.system_log {
            let log = ours.system_log.get_or_insert_with(SystemLogArgs::default);
            log.destination.clone_from(&op_log.destination);
            log.path.clone_from(&op_log.path);
        }
        if let Some(op_repl) = &theirs.replication {
            ours.replication
                .get_or_insert_with(ReplicationArgs::default)
                .repl_set_name
                .clone_from(&op_repl.repl_set_name);
        }
        if let Some(op_sharding) = &theirs.sharding {
            ours.sharding
                .get_or_insert_with(ShardingArgs::default)
                .cluster_role
                .clone_from(&op_sharding.cluster_role);
        }
        if let Some(mode) = theirs
            .security
            .as_ref()
            .and_then(|s| s.cluster_auth_mode.as_ref())
        {
            ours.security
                .get_or_insert_with(SecurityArgs::default)
                .cluster_auth_mode = Some(mode.clone());
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" (hostname: {}, type: {}, version: {})",
            self.name, self.hostname, self.process_type, self.version
        )
    }
}
