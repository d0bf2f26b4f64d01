//! Declared spec to process topology.
//!
//! Process names and hostnames are derived only from the resource name,
//! namespace, cluster domain and ordinal, so a member keeps its hostname for
//! as long as its ordinal exists.

use std::collections::BTreeMap;

use crate::config::CertificateConfig;
use crate::deployment::{Process, ReplicaSetWithProcesses};
use crate::error::{OperatorError, OperatorResult};
use crate::types::{DeclaredSpec, ObservedStatus, ResourceKind, ShardedSize};
use crate::version::MongoVersion;

const WIRED_TIGER_OVERHEAD_GB: f64 = 1.0;
const WIRED_TIGER_RATIO: f64 = 0.5;
const WIRED_TIGER_MIN_GB: f64 = 0.256;

/// Processes of a sharded cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedTopology {
    /// Mongos routers.
    pub mongos: Vec<Process>,
    /// Config server replica set.
    pub config: ReplicaSetWithProcesses,
    /// Shard replica sets in shard order.
    pub shards: Vec<ReplicaSetWithProcesses>,
}

/// Concrete processes for a declared spec.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedTopology {
    /// A single mongod.
    Standalone(Process),
    /// A replica set.
    ReplicaSet(ReplicaSetWithProcesses),
    /// A sharded cluster.
    ShardedCluster(ShardedTopology),
}

impl ResolvedTopology {
    /// Every process, in document order.
    #[must_use]
    pub fn processes(&self) -> Vec<&Process> {
        match self {
            Self::Standalone(p) => vec![p],
            Self::ReplicaSet(rs) => rs.processes.iter().collect(),
            Self::ShardedCluster(sc) => sc
                .mongos
                .iter()
                .chain(&sc.config.processes)
                .chain(sc.shards.iter().flat_map(|s| &s.processes))
                .collect(),
        }
    }

    /// Every process name.
    #[must_use]
    pub fn process_names(&self) -> Vec<String> {
        self.processes().into_iter().map(|p| p.name.clone()).collect()
    }

    /// Hostname the monitoring agent is registered on.
    #[must_use]
    pub fn representative_hostname(&self) -> Option<&str> {
        match self {
            Self::Standalone(p) => Some(p.hostname.as_str()),
            Self::ReplicaSet(rs) => rs.processes.first().map(|p| p.hostname.as_str()),
            Self::ShardedCluster(sc) => sc.config.processes.first().map(|p| p.hostname.as_str()),
        }
    }
}

/// Builds process topologies from declared specs.
#[derive(Debug, Clone)]
pub struct TopologyResolver {
    default_cluster_domain: String,
    server_cert_mount: String,
}

impl TopologyResolver {
    /// Create a resolver using the certificate mount layout from `config`.
    #[must_use]
    pub fn new(config: &CertificateConfig) -> Self {
        Self {
            default_cluster_domain: config.default_cluster_domain.clone(),
            server_cert_mount: config.server_cert_mount.clone(),
        }
    }

    fn cluster_domain<'a>(&'a self, spec: &'a DeclaredSpec) -> &'a str {
        spec.cluster_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.default_cluster_domain)
    }

    /// Hostname of member `ordinal` of the set `set_name`.
    #[must_use]
    pub fn hostname(&self, spec: &DeclaredSpec, set_name: &str, service: &str, ordinal: u32) -> String {
        format!(
            "{set_name}-{ordinal}.{service}.{}.svc.{}",
            spec.namespace,
            self.cluster_domain(spec)
        )
    }

    /// Resolve the declared processes of `spec`.
    ///
    /// Fails on a malformed version or memory limit.
    pub fn resolve(&self, spec: &DeclaredSpec) -> OperatorResult<ResolvedTopology> {
        let version: MongoVersion = spec.version.parse()?;
        let cache = wired_tiger_cache_gb(version, spec.memory_limit.as_deref())?;
        let protocol = version.replica_set_protocol_version();

        let mongod = |name: String, hostname: String| {
            let mut process = Process::mongod(name, hostname, &spec.version)
                .with_feature_compatibility_version(spec.feature_compatibility_version.clone());
            if let Some(cache) = cache {
                process = process.with_wired_tiger_cache(cache);
            }
            self.secure(spec, process)
        };

        let members = |set: &str, service: &str, count: u32| -> Vec<Process> {
            (0..count)
                .map(|i| mongod(format!("{set}-{i}"), self.hostname(spec, set, service, i)))
                .collect()
        };

        let names = SetNames::new(&spec.name);
        Ok(match spec.kind {
            ResourceKind::Standalone => ResolvedTopology::Standalone(mongod(
                spec.name.clone(),
                self.hostname(spec, &spec.name, &names.replica_set_service, 0),
            )),
            ResourceKind::ReplicaSet => ResolvedTopology::ReplicaSet(ReplicaSetWithProcesses::new(
                &spec.name,
                protocol,
                members(&spec.name, &names.replica_set_service, spec.members),
                &spec.replica_set_horizons,
            )),
            ResourceKind::ShardedCluster => {
                let size = spec.sharded;
                let mongos = (0..size.mongos_count)
                    .map(|i| {
                        let process = Process::mongos(
                            format!("{}-{i}", names.mongos),
                            self.hostname(spec, &names.mongos, &names.mongos_service, i),
                            &spec.version,
                            &spec.name,
                        )
                        .with_feature_compatibility_version(
                            spec.feature_compatibility_version.clone(),
                        );
                        self.secure(spec, process)
                    })
                    .collect();
                let config = ReplicaSetWithProcesses::new(
                    &names.config,
                    protocol,
                    members(&names.config, &names.config_service, size.config_server_count),
                    &[],
                );
                let shards = (0..size.shard_count)
                    .map(|s| {
                        let shard = names.shard(s);
                        ReplicaSetWithProcesses::new(
                            &shard,
                            protocol,
                            members(&shard, &names.shard_service, size.mongods_per_shard_count),
                            &[],
                        )
                    })
                    .collect();
                ResolvedTopology::ShardedCluster(ShardedTopology {
                    mongos,
                    config,
                    shards,
                })
            }
        })
    }

    fn secure(&self, spec: &DeclaredSpec, process: Process) -> Process {
        if !spec.security.tls.enabled {
            return process;
        }
        let key_file = format!(
            "{}/{}-pem",
            self.server_cert_mount.trim_end_matches('/'),
            process.name
        );
        process.with_tls(key_file)
    }

    /// Members being removed by a shrink, per replica set: ordinals `[declared, observed)`.
    ///
    /// Shards that disappear entirely are not listed; they leave through
    /// the draining path of the sharded cluster merge.
    #[must_use]
    pub fn draining_members(
        &self,
        spec: &DeclaredSpec,
        observed: &ObservedStatus,
    ) -> BTreeMap<String, Vec<String>> {
        let range = |set: &str, declared: u32, observed: u32| -> Vec<String> {
            (declared..observed).map(|i| format!("{set}-{i}")).collect()
        };

        let mut groups = BTreeMap::new();
        let mut push = |set: String, members: Vec<String>| {
            if !members.is_empty() {
                groups.insert(set, members);
            }
        };

        let names = SetNames::new(&spec.name);
        match spec.kind {
            ResourceKind::Standalone => {}
            ResourceKind::ReplicaSet => {
                push(spec.name.clone(), range(&spec.name, spec.members, observed.members));
            }
            ResourceKind::ShardedCluster => {
                let size = spec.sharded;
                let seen = observed.sharded;
                push(
                    names.config.clone(),
                    range(&names.config, size.config_server_count, seen.config_server_count),
                );
                // Only shards that survive the change shrink in place.
                for s in 0..size.shard_count.min(seen.shard_count) {
                    let shard = names.shard(s);
                    let members = range(&shard, size.mongods_per_shard_count, seen.mongods_per_shard_count);
                    push(shard, members);
                }
            }
        }
        groups
    }

    /// Hostnames for the given member counts.
    #[must_use]
    pub fn hostnames_for(&self, spec: &DeclaredSpec, members: u32, size: ShardedSize) -> Vec<String> {
        let names = SetNames::new(&spec.name);
        let set = |name: &str, service: &str, count: u32| -> Vec<String> {
            (0..count).map(|i| self.hostname(spec, name, service, i)).collect()
        };
        match spec.kind {
            ResourceKind::Standalone => set(&spec.name, &names.replica_set_service, 1),
            ResourceKind::ReplicaSet => set(&spec.name, &names.replica_set_service, members),
            ResourceKind::ShardedCluster => {
                let mut hosts = set(&names.mongos, &names.mongos_service, size.mongos_count);
                hosts.extend(set(&names.config, &names.config_service, size.config_server_count));
                for s in 0..size.shard_count {
                    hosts.extend(set(&names.shard(s), &names.shard_service, size.mongods_per_shard_count));
                }
                hosts
            }
        }
    }

    /// Hostnames of the declared shape.
    #[must_use]
    pub fn target_hostnames(&self, spec: &DeclaredSpec) -> Vec<String> {
        self.hostnames_for(spec, spec.members, spec.sharded)
    }

    /// Hostnames of the last applied shape.
    #[must_use]
    pub fn observed_hostnames(&self, spec: &DeclaredSpec, observed: &ObservedStatus) -> Vec<String> {
        self.hostnames_for(spec, observed.members, observed.sharded)
    }

    /// Hostnames of every member that may be running while a resize is in flight.
    #[must_use]
    pub fn max_hostnames(&self, spec: &DeclaredSpec, observed: &ObservedStatus) -> Vec<String> {
        self.hostnames_for(
            spec,
            spec.members.max(observed.members),
            spec.sharded.max(observed.sharded),
        )
    }

    /// Replicated sets backing the declared shape, in apply order.
    ///
    /// Sharded clusters list the config servers first and the routers last.
    #[must_use]
    pub fn workload_sets(&self, spec: &DeclaredSpec) -> Vec<WorkloadSet> {
        let names = SetNames::new(&spec.name);
        let set = |name: &str, service: &str, replicas: u32| WorkloadSet {
            name: name.to_owned(),
            service: service.to_owned(),
            replicas,
            hostnames: (0..replicas)
                .map(|i| self.hostname(spec, name, service, i))
                .collect(),
        };
        match spec.kind {
            ResourceKind::Standalone => vec![set(&spec.name, &names.replica_set_service, 1)],
            ResourceKind::ReplicaSet => {
                vec![set(&spec.name, &names.replica_set_service, spec.members)]
            }
            ResourceKind::ShardedCluster => {
                let size = spec.sharded;
                let mut sets = vec![set(&names.config, &names.config_service, size.config_server_count)];
                sets.extend((0..size.shard_count).map(|s| {
                    set(&names.shard(s), &names.shard_service, size.mongods_per_shard_count)
                }));
                sets.push(set(&names.mongos, &names.mongos_service, size.mongos_count));
                sets
            }
        }
    }

    /// Sets of shards that existed in the last applied shape but are no longer declared.
    #[must_use]
    pub fn retired_workload_sets(&self, spec: &DeclaredSpec, observed: &ObservedStatus) -> Vec<String> {
        if spec.kind != ResourceKind::ShardedCluster {
            return Vec::new();
        }
        let names = SetNames::new(&spec.name);
        (spec.sharded.shard_count..observed.sharded.shard_count)
            .map(|s| names.shard(s))
            .collect()
    }
}

/// A replicated set of pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSet {
    /// Set name; pods are `<name>-<ordinal>`.
    pub name: String,
    /// Headless service the pods resolve through.
    pub service: String,
    /// Declared replicas.
    pub replicas: u32,
    /// Hostnames of the declared replicas.
    pub hostnames: Vec<String>,
}

/// Set and service names derived from a resource name.
struct SetNames {
    base: String,
    replica_set_service: String,
    mongos: String,
    mongos_service: String,
    config: String,
    config_service: String,
    shard_service: String,
}

impl SetNames {
    fn new(name: &str) -> Self {
        Self {
            base: name.to_owned(),
            replica_set_service: format!("{name}-svc"),
            mongos: format!("{name}-mongos"),
            mongos_service: format!("{name}-svc"),
            config: format!("{name}-config"),
            config_service: format!("{name}-cs"),
            shard_service: format!("{name}-sh"),
        }
    }

    fn shard(&self, index: u32) -> String {
        format!("{}-{index}", self.base)
    }
}

/// WiredTiger cache for servers that cannot size it from container limits.
///
/// `max((GB - 1) * 0.5, 0.256)` rounded down to three decimals, where GB is
/// the memory limit in bytes divided by 10^9. `None` when no limit is set or
/// the server tunes itself.
pub fn wired_tiger_cache_gb(
    version: MongoVersion,
    memory_limit: Option<&str>,
) -> OperatorResult<Option<f64>> {
    let Some(limit) = memory_limit.filter(|m| !m.trim().is_empty()) else {
        return Ok(None);
    };
    let bytes = parse_quantity(limit)?;
    if version.self_tunes_wired_tiger_cache() {
        return Ok(None);
    }
    let gb = bytes / 1e9;
    let cache = ((gb - WIRED_TIGER_OVERHEAD_GB) * WIRED_TIGER_RATIO).max(WIRED_TIGER_MIN_GB);
    Ok(Some((cache * 1000.0).floor() / 1000.0))
}

/// Parse a memory quantity such as `512M`, `2Gi` or `1073741824` into bytes.
pub fn parse_quantity(quantity: &str) -> OperatorResult<f64> {
    let invalid = || OperatorError::Validation(format!("invalid memory quantity \"{quantity}\""));
    let trimmed = quantity.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let multiplier = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(value * multiplier)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{ProjectReference, SecuritySpec};

    fn spec(kind: ResourceKind) -> DeclaredSpec {
        DeclaredSpec {
            name: "db".to_owned(),
            namespace: "ns".to_owned(),
            kind,
            version: "4.2.1".to_owned(),
            feature_compatibility_version: None,
            members: 3,
            sharded: ShardedSize {
                shard_count: 2,
                mongods_per_shard_count: 3,
                mongos_count: 2,
                config_server_count: 3,
            },
            memory_limit: None,
            cluster_domain: None,
            security: SecuritySpec::default(),
            replica_set_horizons: Vec::new(),
            project: ProjectReference {
                project_name: "p".to_owned(),
                org_id: String::new(),
                base_url: String::new(),
                credentials: String::new(),
            },
        }
    }

    fn resolver() -> TopologyResolver {
        TopologyResolver::new(&CertificateConfig::default())
    }

    #[test]
    fn replica_set_hostnames_are_deterministic() {
        let topology = resolver().resolve(&spec(ResourceKind::ReplicaSet)).unwrap();
        let ResolvedTopology::ReplicaSet(rs) = topology else {
            panic!("expected a replica set");
        };
        assert_eq!(rs.name(), "db");
        assert_eq!(
            rs.hostnames(),
            vec![
                "db-0.db-svc.ns.svc.cluster.local",
                "db-1.db-svc.ns.svc.cluster.local",
                "db-2.db-svc.ns.svc.cluster.local",
            ]
        );
        assert_eq!(rs.rs.protocol_version, "1");
    }

    #[test]
    fn custom_cluster_domain_is_used() {
        let mut s = spec(ResourceKind::Standalone);
        s.cluster_domain = Some("example.internal".to_owned());
        let ResolvedTopology::Standalone(p) = resolver().resolve(&s).unwrap() else {
            panic!("expected a standalone");
        };
        assert_eq!(p.name, "db");
        assert_eq!(p.hostname, "db-0.db-svc.ns.svc.example.internal");
    }

    #[test]
    fn sharded_cluster_naming() {
        let ResolvedTopology::ShardedCluster(sc) =
            resolver().resolve(&spec(ResourceKind::ShardedCluster)).unwrap()
        else {
            panic!("expected a sharded cluster");
        };
        assert_eq!(sc.mongos[1].hostname, "db-mongos-1.db-svc.ns.svc.cluster.local");
        assert_eq!(sc.mongos[0].cluster.as_deref(), Some("db"));
        assert_eq!(sc.config.processes[0].hostname, "db-config-0.db-cs.ns.svc.cluster.local");
        assert_eq!(sc.shards[1].processes[2].name, "db-1-2");
        assert_eq!(sc.shards[1].processes[2].hostname, "db-1-2.db-sh.ns.svc.cluster.local");
    }

    #[test]
    fn workload_sets_follow_apply_order() {
        let sets = resolver().workload_sets(&spec(ResourceKind::ShardedCluster));
        let names: Vec<&str> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db-config", "db-0", "db-1", "db-mongos"]);
        assert_eq!(sets[0].service, "db-cs");
        assert_eq!(sets[3].hostnames.len(), 2);

        let sets = resolver().workload_sets(&spec(ResourceKind::Standalone));
        assert_eq!(sets[0].replicas, 1);
        assert_eq!(sets[0].hostnames, vec!["db-0.db-svc.ns.svc.cluster.local"]);
    }

    #[test]
    fn tls_sets_key_file_per_process() {
        let mut s = spec(ResourceKind::ReplicaSet);
        s.security.tls.enabled = true;
        let topology = resolver().resolve(&s).unwrap();
        let process = topology.processes()[1].clone();
        assert!(process.is_tls_enabled());
        assert_eq!(
            process.args.net.tls.unwrap().certificate_key_file.unwrap(),
            "/mongodb-automation/server/db-1-pem"
        );
        assert!(!topology.processes()[1].has_internal_cluster_authentication());
    }

    #[test]
    fn wired_tiger_cache_only_for_old_servers() {
        let old = MongoVersion::new(4, 0, 6);
        assert_eq!(wired_tiger_cache_gb(old, Some("3G")).unwrap(), Some(1.0));
        assert_eq!(wired_tiger_cache_gb(old, Some("1G")).unwrap(), Some(0.256));
        assert_eq!(wired_tiger_cache_gb(old, Some("2Gi")).unwrap(), Some(0.573));
        assert_eq!(wired_tiger_cache_gb(old, None).unwrap(), None);

        let new = MongoVersion::new(4, 2, 1);
        assert_eq!(wired_tiger_cache_gb(new, Some("3G")).unwrap(), None);
    }

    #[test]
    fn malformed_inputs_fail() {
        let mut s = spec(ResourceKind::ReplicaSet);
        s.memory_limit = Some("lots".to_owned());
        assert!(resolver().resolve(&s).is_err());

        let mut s = spec(ResourceKind::ReplicaSet);
        s.version = "4.x".to_owned();
        assert!(resolver().resolve(&s).is_err());
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("1024").unwrap(), 1024.0);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024.0);
        assert_eq!(parse_quantity("1.5G").unwrap(), 1.5e9);
        assert!(parse_quantity("12Q").is_err());
        assert!(parse_quantity("").is_err());
    }

    #[test]
    fn draining_members_cover_the_shrunk_range() {
        let mut s = spec(ResourceKind::ReplicaSet);
        s.members = 2;
        let observed = ObservedStatus {
            members: 5,
            ..ObservedStatus::default()
        };
        let groups = resolver().draining_members(&s, &observed);
        assert_eq!(groups["db"], vec!["db-2", "db-3", "db-4"]);

        s.members = 5;
        assert!(resolver().draining_members(&s, &observed).is_empty());
    }

    #[test]
    fn sharded_draining_skips_removed_shards() {
        let mut s = spec(ResourceKind::ShardedCluster);
        s.sharded.shard_count = 1;
        s.sharded.mongods_per_shard_count = 2;
        let observed = ObservedStatus {
            sharded: ShardedSize {
                shard_count: 2,
                mongods_per_shard_count: 3,
                mongos_count: 2,
                config_server_count: 3,
            },
            ..ObservedStatus::default()
        };
        let groups = resolver().draining_members(&s, &observed);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["db-0"], vec!["db-0-2"]);
    }

    #[test]
    fn max_hostnames_include_in_flight_members() {
        let mut s = spec(ResourceKind::ReplicaSet);
        s.members = 1;
        let observed = ObservedStatus {
            members: 3,
            ..ObservedStatus::default()
        };
        let r = resolver();
        assert_eq!(r.target_hostnames(&s).len(), 1);
        assert_eq!(r.observed_hostnames(&s, &observed).len(), 3);
        assert_eq!(r.max_hostnames(&s, &observed).len(), 3);
    }

    #[test]
    fn removed_shards_retire_their_sets() {
        let mut s = spec(ResourceKind::ShardedCluster);
        s.sharded.shard_count = 1;
        let observed = ObservedStatus {
            sharded: ShardedSize {
                shard_count: 3,
                ..s.sharded
            },
            ..ObservedStatus::default()
        };
        let r = resolver();
        assert_eq!(r.retired_workload_sets(&s, &observed), ["db-1", "db-2"]);

        let rs = spec(ResourceKind::ReplicaSet);
        assert!(r.retired_workload_sets(&rs, &observed).is_empty());
    }
}
