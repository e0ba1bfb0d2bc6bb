//! Cluster topology aggregate.
//!
//! `Data` is only mutated through [`Data::apply`], which the consensus state
//! machine calls for every committed command. Readers always work on a clone.

use super::command::{Command, RetentionPolicySpec};
use super::TimeRange;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the retention policy created alongside a new database.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// A cluster member. Meta and data nodes share one id space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    /// HTTP address
    pub host: String,
    /// Cluster TCP address
    pub tcp_host: String,
    pub is_meta: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
}

impl DatabaseInfo {
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        let name = if name.is_empty() {
            self.default_retention_policy.as_str()
        } else {
            name
        };
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        let name = if name.is_empty() {
            self.default_retention_policy.clone()
        } else {
            name.to_string()
        };
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// Zero keeps data forever.
    pub duration: Duration,
    pub shard_group_duration: Duration,
    pub replica_n: usize,
    pub shard_groups: Vec<ShardGroupInfo>,
}

impl RetentionPolicyInfo {
    fn from_spec(spec: &RetentionPolicySpec) -> Result<Self> {
        let replica_n = spec.replica_n.unwrap_or(1);
        if replica_n < 1 {
            return Err(Error::Command("replication factor must be at least 1".to_string()));
        }
        let duration = spec.duration.unwrap_or(Duration::ZERO);
        let shard_group_duration = match spec.shard_group_duration {
            Some(d) if !d.is_zero() => d,
            _ => shard_group_duration_for(duration),
        };
        Ok(Self {
            name: spec.name.clone(),
            duration,
            shard_group_duration,
            replica_n,
            shard_groups: Vec::new(),
        })
    }

    fn matches_spec(&self, spec: &RetentionPolicySpec) -> bool {
        spec.duration.map_or(true, |d| d == self.duration)
            && spec.replica_n.map_or(true, |n| n == self.replica_n)
            && spec
                .shard_group_duration
                .map_or(true, |d| d.is_zero() || d == self.shard_group_duration)
    }

    /// Live shard group whose interval contains `timestamp`.
    pub fn shard_group_by_timestamp(&self, timestamp: i64) -> Option<&ShardGroupInfo> {
        self.shard_groups
            .iter()
            .find(|sg| !sg.deleted() && sg.contains(timestamp))
    }
}

/// Default shard group span for a retention duration.
pub fn shard_group_duration_for(retention: Duration) -> Duration {
    if retention.is_zero() || retention >= DAY * 180 {
        DAY * 7
    } else if retention >= DAY * 2 {
        DAY
    } else {
        HOUR
    }
}

/// A time-bounded set of shards; `end_time` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub deleted_at: Option<i64>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    /// True when the group intersects the inclusive range `[min, max]`.
    pub fn overlaps(&self, range: TimeRange) -> bool {
        self.start_time <= range.end && self.end_time > range.start
    }

    pub fn shard_ids(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u64,
    pub owners: Vec<ShardOwner>,
}

impl ShardInfo {
    pub fn owned_by(&self, node_id: u64) -> bool {
        self.owners.iter().any(|o| o.node_id == node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwner {
    pub node_id: u64,
}

/// Where a shard lives in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocation {
    pub database: String,
    pub retention_policy: String,
    pub shard_group_id: u64,
    pub shard: ShardInfo,
}

/// The full topology. `index` counts successfully applied commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub index: u64,
    pub meta_nodes: Vec<NodeInfo>,
    pub data_nodes: Vec<NodeInfo>,
    pub databases: Vec<DatabaseInfo>,
    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
}

impl Data {
    /// Apply a committed command. The index advances only when the command
    /// succeeds; a rejected command leaves `Data` untouched.
    ///
    /// Every handler finishes its validation before its first mutation, so
    /// commands apply in place.
    pub fn apply(&mut self, command: &Command) -> Result<()> {
        self.apply_inner(command)?;
        self.index += 1;
        Ok(())
    }

    fn apply_inner(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::CreateMetaNode { host, tcp_host } => self.create_meta_node(host, tcp_host),
            Command::SetMetaNode { host, tcp_host } => self.set_meta_node(host, tcp_host),
            Command::DeleteMetaNode { id } => self.delete_meta_node(*id),
            Command::CreateDataNode { host, tcp_host } => self.create_data_node(host, tcp_host),
            Command::DeleteDataNode { id } => self.delete_data_node(*id),
            Command::CreateDatabase {
                name,
                retention_policy,
            } => self.create_database(name, retention_policy.as_ref()),
            Command::DropDatabase { name } => self.drop_database(name),
            Command::CreateRetentionPolicy {
                database,
                policy,
                make_default,
            } => self.create_retention_policy(database, policy, *make_default),
            Command::DropRetentionPolicy { database, name } => {
                self.drop_retention_policy(database, name)
            }
            Command::SetDefaultRetentionPolicy { database, name } => {
                self.set_default_retention_policy(database, name)
            }
            Command::CreateShardGroup {
                database,
                policy,
                timestamp,
            } => self.create_shard_group(database, policy, *timestamp),
            Command::DeleteShardGroup {
                database,
                policy,
                id,
                deleted_at,
            } => self.delete_shard_group(database, policy, *id, *deleted_at),
            Command::DropShard { id } => self.drop_shard(*id),
        }
    }

    // ---------------------------------------------------------------------
    // Nodes
    // ---------------------------------------------------------------------

    pub fn meta_node(&self, id: u64) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.id == id)
    }

    pub fn meta_node_by_host(&self, host: &str) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.host == host)
    }

    pub fn meta_node_by_tcp_host(&self, tcp_host: &str) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.tcp_host == tcp_host)
    }

    pub fn data_node(&self, id: u64) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.id == id)
    }

    pub fn data_node_by_tcp_host(&self, tcp_host: &str) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.tcp_host == tcp_host)
    }

    fn create_meta_node(&mut self, host: &str, tcp_host: &str) -> Result<()> {
        if self.meta_nodes.iter().any(|n| n.host == host) {
            return Err(Error::NodeExists);
        }
        // A node that already serves data keeps its id when it joins the meta group.
        let id = match self.data_node_by_tcp_host(tcp_host) {
            Some(n) => n.id,
            None => self.next_node_id(),
        };
        self.meta_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            is_meta: true,
        });
        self.meta_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    /// Create or re-address the single meta node of a one-member group.
    fn set_meta_node(&mut self, host: &str, tcp_host: &str) -> Result<()> {
        match self.meta_nodes.len() {
            0 => self.create_meta_node(host, tcp_host),
            1 => {
                let node = &mut self.meta_nodes[0];
                node.host = host.to_string();
                node.tcp_host = tcp_host.to_string();
                Ok(())
            }
            n => Err(Error::Command(format!(
                "cannot set meta node with {} meta nodes in the cluster",
                n
            ))),
        }
    }

    fn delete_meta_node(&mut self, id: u64) -> Result<()> {
        let before = self.meta_nodes.len();
        self.meta_nodes.retain(|n| n.id != id);
        if self.meta_nodes.len() == before {
            return Err(Error::NodeNotFound);
        }
        Ok(())
    }

    fn create_data_node(&mut self, host: &str, tcp_host: &str) -> Result<()> {
        if self.data_nodes.iter().any(|n| n.tcp_host == tcp_host) {
            return Err(Error::NodeExists);
        }
        let id = match self.meta_node_by_tcp_host(tcp_host) {
            Some(n) => n.id,
            None => self.next_node_id(),
        };
        self.data_nodes.push(NodeInfo {
            id,
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
            is_meta: false,
        });
        self.data_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    fn delete_data_node(&mut self, id: u64) -> Result<()> {
        let before = self.data_nodes.len();
        self.data_nodes.retain(|n| n.id != id);
        if self.data_nodes.len() == before {
            return Err(Error::NodeNotFound);
        }
        // Drop the node from every shard it owned.
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    for shard in &mut sg.shards {
                        shard.owners.retain(|o| o.node_id != id);
                    }
                }
            }
        }
        Ok(())
    }

    fn next_node_id(&mut self) -> u64 {
        self.max_node_id += 1;
        self.max_node_id
    }

    // ---------------------------------------------------------------------
    // Databases and retention policies
    // ---------------------------------------------------------------------

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut DatabaseInfo> {
        self.databases
            .iter_mut()
            .find(|db| db.name == name)
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    /// Resolve a retention policy; an empty name selects the default.
    pub fn retention_policy(&self, database: &str, name: &str) -> Result<&RetentionPolicyInfo> {
        let db = self
            .database(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        db.retention_policy(name)
            .ok_or_else(|| Error::RetentionPolicyNotFound(name.to_string()))
    }

    fn create_database(&mut self, name: &str, policy: Option<&RetentionPolicySpec>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Command("database name required".to_string()));
        }
        if self.database(name).is_some() {
            return Ok(());
        }

        let spec = match policy {
            Some(spec) => spec.clone(),
            None => RetentionPolicySpec::new(DEFAULT_RETENTION_POLICY_NAME),
        };
        let rp = RetentionPolicyInfo::from_spec(&spec)?;
        self.databases.push(DatabaseInfo {
            name: name.to_string(),
            default_retention_policy: rp.name.clone(),
            retention_policies: vec![rp],
        });
        Ok(())
    }

    fn drop_database(&mut self, name: &str) -> Result<()> {
        let before = self.databases.len();
        self.databases.retain(|db| db.name != name);
        if self.databases.len() == before {
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        Ok(())
    }

    fn create_retention_policy(
        &mut self,
        database: &str,
        spec: &RetentionPolicySpec,
        make_default: bool,
    ) -> Result<()> {
        if spec.name.is_empty() {
            return Err(Error::Command("retention policy name required".to_string()));
        }
        let rp = RetentionPolicyInfo::from_spec(spec)?;
        let db = self.database_mut(database)?;

        match db.retention_policies.iter().find(|p| p.name == spec.name) {
            Some(existing) if !existing.matches_spec(spec) => {
                return Err(Error::RetentionPolicyConflict(spec.name.clone()));
            }
            Some(_) => {}
            None => db.retention_policies.push(rp),
        }
        if make_default {
            db.default_retention_policy = spec.name.clone();
        }
        Ok(())
    }

    fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self.database_mut(database)?;
        let before = db.retention_policies.len();
        db.retention_policies.retain(|rp| rp.name != name);
        if db.retention_policies.len() == before {
            return Err(Error::RetentionPolicyNotFound(name.to_string()));
        }
        if db.default_retention_policy == name {
            db.default_retention_policy.clear();
        }
        Ok(())
    }

    fn set_default_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        let db = self.database_mut(database)?;
        if !db.retention_policies.iter().any(|rp| rp.name == name) {
            return Err(Error::RetentionPolicyNotFound(name.to_string()));
        }
        db.default_retention_policy = name.to_string();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shard groups
    // ---------------------------------------------------------------------

    /// Live shard groups of `database`/`policy` overlapping `range`, ordered
    /// by start time.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        range: TimeRange,
    ) -> Result<Vec<ShardGroupInfo>> {
        let rp = self.retention_policy(database, policy)?;
        let mut groups: Vec<ShardGroupInfo> = rp
            .shard_groups
            .iter()
            .filter(|sg| !sg.deleted() && sg.overlaps(range))
            .cloned()
            .collect();
        groups.sort_by_key(|sg| sg.start_time);
        Ok(groups)
    }

    pub fn shard_location(&self, shard_id: u64) -> Option<ShardLocation> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for sg in &rp.shard_groups {
                    if let Some(shard) = sg.shards.iter().find(|s| s.id == shard_id) {
                        return Some(ShardLocation {
                            database: db.name.clone(),
                            retention_policy: rp.name.clone(),
                            shard_group_id: sg.id,
                            shard: shard.clone(),
                        });
                    }
                }
            }
        }
        None
    }

    fn create_shard_group(&mut self, database: &str, policy: &str, timestamp: i64) -> Result<()> {
        let nodes: Vec<u64> = self.data_nodes.iter().map(|n| n.id).collect();
        if nodes.is_empty() {
            return Err(Error::Command("no data nodes available for shard group".to_string()));
        }

        let start_index = self.index as usize;
        let rp = self.retention_policy(database, policy)?;
        if rp.shard_group_by_timestamp(timestamp).is_some() {
            return Ok(());
        }
        let rp_name = rp.name.clone();

        let replica_n = rp.replica_n.clamp(1, nodes.len());
        let shard_n = nodes.len() / replica_n;
        let span = rp.shard_group_duration.as_nanos().min(i64::MAX as u128) as i64;
        let span = span.max(1);
        let (start_time, end_time) = timestamp
            .checked_sub(timestamp.rem_euclid(span))
            .and_then(|start| Some((start, start.checked_add(span)?)))
            .ok_or_else(|| {
                Error::Command(format!(
                    "timestamp {} has no shard group interval of {}ns",
                    timestamp, span
                ))
            })?;

        self.max_shard_group_id += 1;
        let group_id = self.max_shard_group_id;

        let mut node_index = start_index;
        let mut shards = Vec::with_capacity(shard_n);
        for _ in 0..shard_n {
            self.max_shard_id += 1;
            let mut owners = Vec::with_capacity(replica_n);
            for _ in 0..replica_n {
                owners.push(ShardOwner {
                    node_id: nodes[node_index % nodes.len()],
                });
                node_index += 1;
            }
            shards.push(ShardInfo {
                id: self.max_shard_id,
                owners,
            });
        }

        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(&rp_name)
            .ok_or_else(|| Error::RetentionPolicyNotFound(rp_name.clone()))?;
        rp.shard_groups.push(ShardGroupInfo {
            id: group_id,
            start_time,
            end_time,
            deleted_at: None,
            shards,
        });
        rp.shard_groups.sort_by_key(|sg| sg.start_time);
        Ok(())
    }

    fn delete_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        id: u64,
        deleted_at: i64,
    ) -> Result<()> {
        let db = self.database_mut(database)?;
        let rp = db
            .retention_policy_mut(policy)
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;
        let sg = rp
            .shard_groups
            .iter_mut()
            .find(|sg| sg.id == id)
            .ok_or_else(|| Error::Command(format!("shard group not found: {}", id)))?;
        sg.deleted_at = Some(deleted_at);
        Ok(())
    }

    fn drop_shard(&mut self, id: u64) -> Result<()> {
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    let before = sg.shards.len();
                    sg.shards.retain(|s| s.id != id);
                    if sg.shards.len() != before {
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::ShardNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_NS: i64 = 3_600_000_000_000;

    fn with_data_nodes(n: u64) -> Data {
        let mut data = Data::default();
        for i in 0..n {
            data.apply(&Command::CreateDataNode {
                host: format!("host{i}:8091"),
                tcp_host: format!("host{i}:8088"),
            })
            .unwrap();
        }
        data
    }

    #[test]
    fn index_advances_only_on_success() {
        let mut data = Data::default();
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        assert_eq!(data.index, 1);

        let err = data.apply(&Command::DropDatabase { name: "missing".into() });
        assert!(matches!(err, Err(Error::DatabaseNotFound(_))));
        assert_eq!(data.index, 1, "rejected command must not advance the index");
    }

    #[test]
    fn meta_and_data_nodes_share_ids_by_tcp_host() {
        let mut data = Data::default();
        data.apply(&Command::CreateMetaNode {
            host: "a:8091".into(),
            tcp_host: "a:8088".into(),
        })
        .unwrap();
        data.apply(&Command::CreateDataNode {
            host: "a:8086".into(),
            tcp_host: "a:8088".into(),
        })
        .unwrap();
        data.apply(&Command::CreateDataNode {
            host: "b:8086".into(),
            tcp_host: "b:8088".into(),
        })
        .unwrap();

        assert_eq!(data.meta_nodes[0].id, data.data_nodes[0].id);
        assert_eq!(data.data_nodes[1].id, 2);
        assert!(matches!(
            data.apply(&Command::CreateDataNode {
                host: "b:8086".into(),
                tcp_host: "b:8088".into(),
            }),
            Err(Error::NodeExists)
        ));
    }

    #[test]
    fn set_meta_node_readdresses_sole_member() {
        let mut data = Data::default();
        data.apply(&Command::SetMetaNode {
            host: "old:8091".into(),
            tcp_host: "old:8088".into(),
        })
        .unwrap();
        data.apply(&Command::SetMetaNode {
            host: "new:8091".into(),
            tcp_host: "new:8088".into(),
        })
        .unwrap();
        assert_eq!(data.meta_nodes.len(), 1);
        assert_eq!(data.meta_nodes[0].host, "new:8091");
        assert_eq!(data.meta_nodes[0].id, 1);
    }

    #[test]
    fn shard_group_spreads_replicas_round_robin() {
        let mut data = with_data_nodes(4);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: Some(RetentionPolicySpec {
                replica_n: Some(2),
                duration: Some(DAY),
                ..RetentionPolicySpec::new("rp0")
            }),
        })
        .unwrap();
        data.apply(&Command::CreateShardGroup {
            database: "db0".into(),
            policy: "rp0".into(),
            timestamp: HOUR_NS + 5,
        })
        .unwrap();

        let rp = data.retention_policy("db0", "").unwrap();
        assert_eq!(rp.shard_group_duration, HOUR);
        let sg = &rp.shard_groups[0];
        assert_eq!(sg.start_time, HOUR_NS);
        assert_eq!(sg.end_time, 2 * HOUR_NS);
        assert_eq!(sg.shards.len(), 2);
        for shard in &sg.shards {
            assert_eq!(shard.owners.len(), 2);
        }
        let mut owners: Vec<u64> = sg
            .shards
            .iter()
            .flat_map(|s| s.owners.iter().map(|o| o.node_id))
            .collect();
        owners.sort();
        assert_eq!(owners, vec![1, 2, 3, 4]);
    }

    #[test]
    fn create_shard_group_is_idempotent_per_interval() {
        let mut data = with_data_nodes(1);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        for ts in [10, 20] {
            data.apply(&Command::CreateShardGroup {
                database: "db0".into(),
                policy: String::new(),
                timestamp: ts,
            })
            .unwrap();
        }
        let rp = data.retention_policy("db0", "autogen").unwrap();
        assert_eq!(rp.shard_groups.len(), 1);
        assert_eq!(rp.shard_group_duration, DAY * 7);
    }

    #[test]
    fn shard_group_at_time_extremes_is_rejected() {
        let mut data = with_data_nodes(1);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        let index = data.index;

        for timestamp in [i64::MIN, i64::MAX] {
            let err = data.apply(&Command::CreateShardGroup {
                database: "db0".into(),
                policy: String::new(),
                timestamp,
            });
            assert!(matches!(err, Err(Error::Command(_))), "timestamp {timestamp}: {err:?}");
        }

        assert_eq!(data.index, index);
        assert_eq!(data.max_shard_group_id, 0);
        assert_eq!(data.max_shard_id, 0);
        let rp = data.retention_policy("db0", "autogen").unwrap();
        assert!(rp.shard_groups.is_empty());
    }

    #[test]
    fn rejected_command_leaves_data_unchanged() {
        let mut data = with_data_nodes(2);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        let before = data.clone();

        let rejected = [
            Command::CreateDataNode {
                host: "other:8091".into(),
                tcp_host: "host0:8088".into(),
            },
            Command::DeleteMetaNode { id: 99 },
            Command::CreateShardGroup {
                database: "db0".into(),
                policy: "missing".into(),
                timestamp: 0,
            },
            Command::SetDefaultRetentionPolicy {
                database: "db0".into(),
                name: "missing".into(),
            },
            Command::DropShard { id: 42 },
        ];
        for command in &rejected {
            assert!(data.apply(command).is_err(), "{command:?} should be rejected");
            assert_eq!(data, before, "{command:?} must not mutate");
        }
    }

    #[test]
    fn time_range_lookup_skips_deleted_groups() {
        let mut data = with_data_nodes(1);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: Some(RetentionPolicySpec {
                duration: Some(HOUR),
                ..RetentionPolicySpec::new("rp0")
            }),
        })
        .unwrap();
        for hour in 0..3 {
            data.apply(&Command::CreateShardGroup {
                database: "db0".into(),
                policy: "rp0".into(),
                timestamp: hour * HOUR_NS,
            })
            .unwrap();
        }

        let range = TimeRange::new(HOUR_NS - 1, HOUR_NS);
        let groups = data.shard_groups_by_time_range("db0", "rp0", range).unwrap();
        assert_eq!(groups.len(), 2, "range straddles the first boundary");

        let id = groups[1].id;
        data.apply(&Command::DeleteShardGroup {
            database: "db0".into(),
            policy: "rp0".into(),
            id,
            deleted_at: 1,
        })
        .unwrap();
        let groups = data.shard_groups_by_time_range("db0", "rp0", range).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].start_time, 0);
    }

    #[test]
    fn retention_policy_conflict_is_rejected() {
        let mut data = Data::default();
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        let spec = RetentionPolicySpec {
            replica_n: Some(3),
            ..RetentionPolicySpec::new("autogen")
        };
        let err = data
            .apply(&Command::CreateRetentionPolicy {
                database: "db0".into(),
                policy: spec,
                make_default: false,
            })
            .unwrap_err();
        assert!(matches!(err, Error::RetentionPolicyConflict(_)));
    }

    #[test]
    fn shard_location_and_drop() {
        let mut data = with_data_nodes(2);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: None,
        })
        .unwrap();
        data.apply(&Command::CreateShardGroup {
            database: "db0".into(),
            policy: String::new(),
            timestamp: 0,
        })
        .unwrap();

        let loc = data.shard_location(1).unwrap();
        assert_eq!(loc.database, "db0");
        assert_eq!(loc.retention_policy, "autogen");

        data.apply(&Command::DropShard { id: 1 }).unwrap();
        assert!(data.shard_location(1).is_none());
        assert!(data.apply(&Command::DropShard { id: 1 }).is_err());
    }

    #[test]
    fn deleting_data_node_clears_ownership() {
        let mut data = with_data_nodes(2);
        data.apply(&Command::CreateDatabase {
            name: "db0".into(),
            retention_policy: Some(RetentionPolicySpec {
                replica_n: Some(2),
                ..RetentionPolicySpec::new("rp0")
            }),
        })
        .unwrap();
        data.apply(&Command::CreateShardGroup {
            database: "db0".into(),
            policy: "rp0".into(),
            timestamp: 0,
        })
        .unwrap();
        data.apply(&Command::DeleteDataNode { id: 2 }).unwrap();

        let loc = data.shard_location(1).unwrap();
        assert!(loc.shard.owned_by(1));
        assert!(!loc.shard.owned_by(2));
    }
}
