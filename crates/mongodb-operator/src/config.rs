//! Configuration for mongodb-operator.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, OperatorResult};

/// Top-level configuration for the operator.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OperatorConfig {
    /// Requeue behaviour.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Control plane publish and polling behaviour.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Certificate issuance.
    #[serde(default)]
    pub certificates: CertificateConfig,

    /// Status persistence.
    #[serde(default)]
    pub status: StatusConfig,

    /// Monitoring and backup agents.
    #[serde(default)]
    pub agents: AgentConfig,
}

impl OperatorConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `operator.toml` in the current directory (if present)
    /// 3. Environment variables with `MDB_OPERATOR_` prefix
    pub fn load() -> OperatorResult<Self> {
        Figment::new()
            .merge(Toml::file("operator.toml"))
            .merge(Env::prefixed("MDB_OPERATOR_").split("__"))
            .extract()
            .map_err(|e| OperatorError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> OperatorResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MDB_OPERATOR_").split("__"))
            .extract()
            .map_err(|e| OperatorError::Config(e.to_string()))
    }

    /// Configuration with every wait shortened to zero, for tests and dry runs.
    #[must_use]
    pub fn without_delays() -> Self {
        let mut config = Self::default();
        config.control_plane.ready_state_interval_ms = 0;
        config.control_plane.agent_registration_interval_ms = 0;
        config.certificates.approval_poll_interval_ms = 0;
        config
    }
}

/// Requeue behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Delay before a pending or failed resource is reconciled again.
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,

    /// Delay used when the `Reconciling` status itself cannot be written.
    #[serde(default = "default_status_retry_delay_secs")]
    pub status_retry_delay_secs: u64,

    /// Delay used while the workload reports fewer ready members than declared.
    #[serde(default = "default_workload_retry_delay_secs")]
    pub workload_retry_delay_secs: u64,
}

const fn default_requeue_delay_secs() -> u64 {
    10
}

const fn default_status_retry_delay_secs() -> u64 {
    5
}

const fn default_workload_retry_delay_secs() -> u64 {
    3
}

impl ReconcileConfig {
    /// Default requeue delay.
    #[must_use]
    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    /// Requeue delay after a failed status write.
    #[must_use]
    pub const fn status_retry_delay(&self) -> Duration {
        Duration::from_secs(self.status_retry_delay_secs)
    }

    /// Requeue delay while the workload is converging.
    #[must_use]
    pub const fn workload_retry_delay(&self) -> Duration {
        Duration::from_secs(self.workload_retry_delay_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_delay_secs: default_requeue_delay_secs(),
            status_retry_delay_secs: default_status_retry_delay_secs(),
            workload_retry_delay_secs: default_workload_retry_delay_secs(),
        }
    }
}

/// Control plane publish and polling behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    /// How many times a publish is re-read and re-applied after a version conflict.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    /// Polls while waiting for agents to reach goal state.
    #[serde(default = "default_ready_state_attempts")]
    pub ready_state_attempts: u32,

    /// Interval between goal state polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub ready_state_interval_ms: u64,

    /// Polls while waiting for agents to register.
    #[serde(default = "default_agent_registration_attempts")]
    pub agent_registration_attempts: u32,

    /// Interval between agent registration polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub agent_registration_interval_ms: u64,
}

const fn default_publish_retries() -> u32 {
    3
}

const fn default_ready_state_attempts() -> u32 {
    30
}

const fn default_agent_registration_attempts() -> u32 {
    5
}

const fn default_poll_interval_ms() -> u64 {
    3000
}

impl ControlPlaneConfig {
    /// Interval between goal state polls.
    #[must_use]
    pub const fn ready_state_interval(&self) -> Duration {
        Duration::from_millis(self.ready_state_interval_ms)
    }

    /// Interval between agent registration polls.
    #[must_use]
    pub const fn agent_registration_interval(&self) -> Duration {
        Duration::from_millis(self.agent_registration_interval_ms)
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            publish_retries: default_publish_retries(),
            ready_state_attempts: default_ready_state_attempts(),
            ready_state_interval_ms: default_poll_interval_ms(),
            agent_registration_attempts: default_agent_registration_attempts(),
            agent_registration_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Certificate issuance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateConfig {
    /// Cluster domain used when the resource does not set one.
    #[serde(default = "default_cluster_domain")]
    pub default_cluster_domain: String,

    /// Polls of a freshly submitted signing request before reporting pending.
    #[serde(default = "default_approval_poll_attempts")]
    pub approval_poll_attempts: u32,

    /// Interval between approval polls in milliseconds.
    #[serde(default = "default_approval_poll_interval_ms")]
    pub approval_poll_interval_ms: u64,

    /// Directory server certificates are mounted at inside the pods.
    #[serde(default = "default_server_cert_mount")]
    pub server_cert_mount: String,

    /// Directory internal cluster certificates are mounted at.
    #[serde(default = "default_cluster_cert_mount")]
    pub cluster_cert_mount: String,

    /// CA file path inside the pods.
    #[serde(default = "default_ca_file_path")]
    pub ca_file_path: String,
}

fn default_cluster_domain() -> String {
    "cluster.local".to_owned()
}

const fn default_approval_poll_attempts() -> u32 {
    3
}

const fn default_approval_poll_interval_ms() -> u64 {
    1000
}

fn default_server_cert_mount() -> String {
    "/mongodb-automation/server".to_owned()
}

fn default_cluster_cert_mount() -> String {
    "/mongodb-automation/clusterfile".to_owned()
}

fn default_ca_file_path() -> String {
    "/mongodb-automation/ca.pem".to_owned()
}

impl CertificateConfig {
    /// Interval between approval polls.
    #[must_use]
    pub const fn approval_poll_interval(&self) -> Duration {
        Duration::from_millis(self.approval_poll_interval_ms)
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            default_cluster_domain: default_cluster_domain(),
            approval_poll_attempts: default_approval_poll_attempts(),
            approval_poll_interval_ms: default_approval_poll_interval_ms(),
            server_cert_mount: default_server_cert_mount(),
            cluster_cert_mount: default_cluster_cert_mount(),
            ca_file_path: default_ca_file_path(),
        }
    }
}

/// Status persistence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusConfig {
    /// Retries after the first write when the stored status changed underneath.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

const fn default_conflict_retries() -> u32 {
    3
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
        }
    }
}

/// Monitoring and backup agents.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Version written for new monitoring agent entries.
    #[serde(default = "default_agent_version")]
    pub monitoring_version: String,

    /// Version written for new backup agent entries.
    #[serde(default = "default_agent_version")]
    pub backup_version: String,
}

fn default_agent_version() -> String {
    "11.12.0.7388-1".to_owned()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            monitoring_version: default_agent_version(),
            backup_version: default_agent_version(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = OperatorConfig::default();
        assert_eq!(config.reconcile.requeue_delay(), Duration::from_secs(10));
        assert_eq!(config.control_plane.publish_retries, 3);
        assert_eq!(config.control_plane.ready_state_attempts, 30);
        assert_eq!(config.control_plane.agent_registration_attempts, 5);
        assert_eq!(config.certificates.default_cluster_domain, "cluster.local");
        assert_eq!(config.status.conflict_retries, 3);
        assert_eq!(config.agents.monitoring_version, "11.12.0.7388-1");
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [reconcile]
            requeue_delay_secs = 30

            [control_plane]
            publish_retries = 5
            ready_state_interval_ms = 100

            [certificates]
            default_cluster_domain = "example.internal"
        "#;

        let config: OperatorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.reconcile.requeue_delay_secs, 30);
        assert_eq!(config.reconcile.workload_retry_delay_secs, 3);
        assert_eq!(config.control_plane.publish_retries, 5);
        assert_eq!(
            config.control_plane.ready_state_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(config.control_plane.ready_state_attempts, 30);
        assert_eq!(
            config.certificates.default_cluster_domain,
            "example.internal"
        );
    }

    #[test]
    fn without_delays_zeroes_intervals() {
        let config = OperatorConfig::without_delays();
        assert_eq!(config.control_plane.ready_state_interval(), Duration::ZERO);
        assert_eq!(
            config.control_plane.agent_registration_interval(),
            Duration::ZERO
        );
        assert_eq!(config.certificates.approval_poll_interval(), Duration::ZERO);
        assert_eq!(config.control_plane.ready_state_attempts, 30);
    }
}
