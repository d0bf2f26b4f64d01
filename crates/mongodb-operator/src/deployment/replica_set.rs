//! Replica set entries of the deployment document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::process::Process;
use crate::types::HorizonConfig;

/// Replica set protocol version written for new sets.
pub const PROTOCOL_VERSION: &str = "1";

const fn default_votes() -> u32 {
    1
}

const fn default_priority() -> f64 {
    1.0
}

/// One member of a replica set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetMember {
    /// Member id, unique within the set.
    #[serde(rename = "_id")]
    pub id: u32,
    /// Name of the process backing this member.
    pub host: String,
    /// Number of votes in elections.
    #[serde(default = "default_votes")]
    pub votes: u32,
    /// Election priority.
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Member tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Split horizon addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizons: Option<HorizonConfig>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplicaSetMember {
    /// A voting member with default priority.
    #[must_use]
    pub fn new(id: u32, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            votes: default_votes(),
            priority: default_priority(),
            tags: BTreeMap::new(),
            horizons: None,
            extra: Map::new(),
        }
    }

    /// Whether the member takes part in elections.
    #[must_use]
    pub const fn is_voting(&self) -> bool {
        self.votes > 0
    }

    /// Strip the vote and priority so the member cannot become primary.
    pub fn unvote(&mut self) {
        self.votes = 0;
        self.priority = 0.0;
    }
}

/// A replica set entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    /// Replica set name.
    #[serde(rename = "_id")]
    pub name: String,
    /// Replication protocol version.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Members in `_id` order.
    #[serde(default)]
    pub members: Vec<ReplicaSetMember>,
    /// Fields not managed by the operator.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

impl ReplicaSet {
    /// An empty replica set.
    #[must_use]
    pub fn new(name: impl Into<String>, protocol_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol_version: protocol_version.into(),
            members: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Append a member for `process` with the next free id.
    pub fn add_member(&mut self, process: &Process, horizons: Option<HorizonConfig>) {
        let id = self.members.last().map_or(0, |m| m.id + 1);
        let mut member = ReplicaSetMember::new(id, &process.name);
        member.horizons = horizons;
        self.members.push(member);
    }

    /// Names of member processes.
    #[must_use]
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.host.clone()).collect()
    }

    /// Merge the operator's view of the set into this entry.
    ///
    /// Members missing from `operator` are removed and their process names
    /// returned. Surviving members take the operator's id, votes, priority,
    /// tags and horizons; other member fields are kept.
    pub fn merge_from(&mut self, operator: &Self) -> Vec<String> {
        let removed: Vec<String> = self
            .members
            .iter()
            .filter(|m| !operator.members.iter().any(|o| o.host == m.host))
            .map(|m| m.host.clone())
            .collect();
        self.members.retain(|m| !removed.contains(&m.host));

        for op_member in &operator.members {
            match self.members.iter_mut().find(|m| m.host == op_member.host) {
                Some(member) => {
                    member.id = op_member.id;
                    member.votes = op_member.votes;
                    member.priority = op_member.priority;
                    member.tags.clone_from(&op_member.tags);
                    member.horizons = op_member.horizons.clone().filter(|h| !h.is_empty());
                }
                None => self.members.push(op_member.clone()),
            }
        }
        self.members.sort_by_key(|m| m.id);
        self.protocol_version.clone_from(&operator.protocol_version);
        removed
    }

    /// Keep at most `max_voting` voting members; later members lose their vote.
    pub fn limit_voting_members(&mut self, max_voting: usize) {
        let mut voting = 0;
        for member in &mut self.members {
            if !member.is_voting() {
                continue;
            }
            if voting >= max_voting {
                member.unvote();
            } else {
                voting += 1;
            }
        }
    }

    /// Remove the vote from each named member; unknown names are ignored.
    pub fn unvote_members(&mut self, names: &[String]) {
        for member in &mut self.members {
            if names.contains(&member.host) {
                member.unvote();
            }
        }
    }
}

/// A replica set together with its ordered member processes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSetWithProcesses {
    /// The replica set entry.
    pub rs: ReplicaSet,
    /// Member processes, in member order.
    pub processes: Vec<Process>,
}

impl ReplicaSetWithProcesses {
    /// Build a replica set from its processes; each process joins the set.
    #[must_use]
    pub fn new(
        name: &str,
        protocol_version: &str,
        processes: Vec<Process>,
        horizons: &[HorizonConfig],
    ) -> Self {
        let mut rs = ReplicaSet::new(name, protocol_version);
        let processes: Vec<Process> = processes
            .into_iter()
            .map(|p| p.with_replica_set(name))
            .collect();
        for (i, process) in processes.iter().enumerate() {
            rs.add_member(process, horizons.get(i).cloned());
        }
        Self { rs, processes }
    }

    /// Replica set name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.rs.name
    }

    /// Member process names.
    #[must_use]
    pub fn process_names(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.name.clone()).collect()
    }

    /// Member hostnames.
    #[must_use]
    pub fn hostnames(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.hostname.clone()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn processes(n: u32) -> Vec<Process> {
        (0..n)
            .map(|i| Process::mongod(format!("rs-{i}"), format!("rs-{i}.svc"), "4.2.1"))
            .collect()
    }

    #[test]
    fn members_get_sequential_ids() {
        let set = ReplicaSetWithProcesses::new("rs", PROTOCOL_VERSION, processes(3), &[]);
        let ids: Vec<u32> = set.rs.members.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(set.processes.iter().all(|p| p.replica_set_name() == "rs"));
    }

    #[test]
    fn horizons_are_attached_by_position() {
        let horizons = vec![
            HorizonConfig::from([("ext".to_owned(), "a.example:27017".to_owned())]),
            HorizonConfig::from([("ext".to_owned(), "b.example:27017".to_owned())]),
        ];
        let set = ReplicaSetWithProcesses::new("rs", PROTOCOL_VERSION, processes(2), &horizons);
        assert_eq!(
            set.rs.members[1].horizons.as_ref().unwrap()["ext"],
            "b.example:27017"
        );
    }

    #[test]
    fn merge_reports_removed_members_and_keeps_extras() {
        let mut existing = ReplicaSetWithProcesses::new("rs", "1", processes(3), &[]).rs;
        existing.members[0]
            .extra
            .insert("slaveDelay".to_owned(), Value::from(0));

        let operator = ReplicaSetWithProcesses::new("rs", "1", processes(2), &[]).rs;
        let removed = existing.merge_from(&operator);

        assert_eq!(removed, vec!["rs-2".to_owned()]);
        assert_eq!(existing.members.len(), 2);
        assert!(existing.members[0].extra.contains_key("slaveDelay"));
    }

    #[test]
    fn voting_members_are_capped() {
        let mut set = ReplicaSetWithProcesses::new("rs", "1", processes(9), &[]).rs;
        set.limit_voting_members(7);
        let voting = set.members.iter().filter(|m| m.is_voting()).count();
        assert_eq!(voting, 7);
        assert_eq!(set.members[8].priority, 0.0);
    }

    #[test]
    fn unvote_ignores_unknown_members() {
        let mut set = ReplicaSetWithProcesses::new("rs", "1", processes(3), &[]).rs;
        set.unvote_members(&["rs-2".to_owned(), "other-0".to_owned()]);
        assert!(set.members[1].is_voting());
        assert!(!set.members[2].is_voting());
    }
}
