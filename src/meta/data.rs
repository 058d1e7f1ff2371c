//! Cluster metadata snapshot
//!
//! A [`Snapshot`] is an immutable, index-stamped copy of all cluster metadata.
//! The authority builds a new one for every accepted command; clients only
//! ever replace their copy wholesale.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Name given to the retention policy created alongside a database.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";

/// Replication factor used when none is specified.
pub const DEFAULT_REPLICA_N: u32 = 1;

/// Shortest finite retention a policy may have.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(3600);

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

/// Shard group width for a retention policy of the given duration.
///
/// Zero means infinite retention.
pub fn shard_group_duration_for(retention: Duration) -> Duration {
    if retention.is_zero() {
        WEEK
    } else if retention < 2 * DAY {
        HOUR
    } else if retention < 180 * DAY {
        DAY
    } else {
        WEEK
    }
}

/// Capabilities a cluster member has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Metadata authority only
    Meta,
    /// Data storage and queries only
    Data,
    /// Both metadata authority and data storage
    Hybrid,
}

impl NodeRole {
    pub fn serves_meta(&self) -> bool {
        matches!(self, NodeRole::Meta | NodeRole::Hybrid)
    }

    pub fn serves_data(&self) -> bool {
        matches!(self, NodeRole::Data | NodeRole::Hybrid)
    }

    /// Role of a node registered for both capabilities.
    pub fn merge(self, other: NodeRole) -> NodeRole {
        if self == other {
            self
        } else {
            NodeRole::Hybrid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Meta => "meta",
            NodeRole::Data => "data",
            NodeRole::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "meta" => Ok(NodeRole::Meta),
            "data" => Ok(NodeRole::Data),
            "hybrid" => Ok(NodeRole::Hybrid),
            other => Err(Error::Config(format!(
                "unsupported node type {:?}; expected one of meta, data, hybrid",
                other
            ))),
        }
    }
}

/// A cluster member. Identity is the id; addresses may change across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: u64,
    pub http_addr: String,
    pub tcp_addr: String,
    pub role: NodeRole,
}

/// Access level a user holds on a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    NoPrivileges,
    Read,
    Write,
    All,
}

impl Privilege {
    pub fn allows_read(&self) -> bool {
        matches!(self, Privilege::Read | Privilege::All)
    }

    pub fn allows_write(&self) -> bool {
        matches!(self, Privilege::Write | Privilege::All)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Privilege::NoPrivileges => "NO PRIVILEGES",
            Privilege::Read => "READ",
            Privilege::Write => "WRITE",
            Privilege::All => "ALL PRIVILEGES",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// bcrypt hash of the password
    pub hash: String,
    pub admin: bool,
    #[serde(default)]
    pub privileges: BTreeMap<String, Privilege>,
}

impl UserInfo {
    pub fn privilege(&self, database: &str) -> Privilege {
        self.privileges
            .get(database)
            .copied()
            .unwrap_or(Privilege::NoPrivileges)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub name: String,
    /// `ANY` or `ALL`
    pub mode: String,
    pub destinations: Vec<String>,
}

/// A shard and the data nodes holding its replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u64,
    pub owners: Vec<u64>,
}

impl ShardInfo {
    pub fn owned_by(&self, node_id: u64) -> bool {
        self.owners.contains(&node_id)
    }
}

/// A time-bounded set of shards. The range is half-open: `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start_time <= t && t < self.end_time
    }

    pub fn overlaps(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        self.start_time <= max && self.end_time > min
    }

    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn shard(&self, shard_id: u64) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.id == shard_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// Zero means data is kept forever.
    pub duration: Duration,
    pub shard_group_duration: Duration,
    pub replica_n: u32,
    #[serde(default)]
    pub shard_groups: Vec<ShardGroupInfo>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl RetentionPolicyInfo {
    /// Infinite-retention policy with a single replica.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: Duration::ZERO,
            shard_group_duration: shard_group_duration_for(Duration::ZERO),
            replica_n: DEFAULT_REPLICA_N,
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Live shard group covering `t`, if any.
    pub fn shard_group_by_timestamp(&self, t: DateTime<Utc>) -> Option<&ShardGroupInfo> {
        self.shard_groups
            .iter()
            .find(|g| !g.deleted() && g.contains(t))
    }

    /// Live shard groups overlapping `[min, max]`, ordered by start time.
    pub fn shard_groups_by_time_range(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<ShardGroupInfo> {
        self.shard_groups
            .iter()
            .filter(|g| !g.deleted() && g.overlaps(min, max))
            .cloned()
            .collect()
    }

    /// Most recent live shard group.
    pub fn last_shard_group(&self) -> Option<&ShardGroupInfo> {
        self.shard_groups
            .iter()
            .filter(|g| !g.deleted())
            .max_by_key(|g| g.end_time)
    }

    pub fn subscription(&self, name: &str) -> Option<&SubscriptionInfo> {
        self.subscriptions.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    /// Empty when the database has no default policy.
    pub default_retention_policy: String,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicyInfo>,
    #[serde(default)]
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_retention_policy: String::new(),
            retention_policies: Vec::new(),
            continuous_queries: Vec::new(),
        }
    }

    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    pub(crate) fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }

    pub fn default_retention_policy(&self) -> Option<&RetentionPolicyInfo> {
        if self.default_retention_policy.is_empty() {
            return None;
        }
        self.retention_policy(&self.default_retention_policy)
    }

    pub fn continuous_query(&self, name: &str) -> Option<&ContinuousQueryInfo> {
        self.continuous_queries.iter().find(|cq| cq.name == name)
    }
}

/// Index-stamped copy of all cluster metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Version of this copy; zero before the first fetch.
    pub index: u64,
    #[serde(default)]
    pub cluster_id: u64,
    #[serde(default)]
    pub databases: Vec<DatabaseInfo>,
    #[serde(default)]
    pub meta_nodes: Vec<ServerInfo>,
    #[serde(default)]
    pub data_nodes: Vec<ServerInfo>,
    #[serde(default)]
    pub users: Vec<UserInfo>,
    #[serde(default)]
    pub max_node_id: u64,
    #[serde(default)]
    pub max_shard_group_id: u64,
    #[serde(default)]
    pub max_shard_id: u64,
}

impl Snapshot {
    /// Empty snapshot at index zero.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    pub(crate) fn database_mut(&mut self, name: &str) -> Option<&mut DatabaseInfo> {
        self.databases.iter_mut().find(|db| db.name == name)
    }

    pub fn retention_policy(&self, database: &str, name: &str) -> Option<&RetentionPolicyInfo> {
        self.database(database)?.retention_policy(name)
    }

    pub fn data_node(&self, id: u64) -> Option<&ServerInfo> {
        self.data_nodes.iter().find(|n| n.id == id)
    }

    pub fn data_node_by_http_addr(&self, addr: &str) -> Option<&ServerInfo> {
        self.data_nodes.iter().find(|n| n.http_addr == addr)
    }

    pub fn meta_node(&self, id: u64) -> Option<&ServerInfo> {
        self.meta_nodes.iter().find(|n| n.id == id)
    }

    pub fn meta_node_by_http_addr(&self, addr: &str) -> Option<&ServerInfo> {
        self.meta_nodes.iter().find(|n| n.http_addr == addr)
    }

    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    pub(crate) fn user_mut(&mut self, name: &str) -> Option<&mut UserInfo> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    pub fn admin_user_exists(&self) -> bool {
        self.users.iter().any(|u| u.admin)
    }

    /// Database, policy and group that contain the given shard.
    pub fn shard_owner(&self, shard_id: u64) -> Option<(&str, &str, &ShardGroupInfo)> {
        for db in &self.databases {
            for rp in &db.retention_policies {
                for group in &rp.shard_groups {
                    if group.deleted() {
                        continue;
                    }
                    if group.shard(shard_id).is_some() {
                        return Some((db.name.as_str(), rp.name.as_str(), group));
                    }
                }
            }
        }
        None
    }
}
