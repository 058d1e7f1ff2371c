//! Metadata commands
//!
//! Every mutation the authority understands is a variant of [`Command`].
//! Commands travel to `POST /execute` as a MessagePack envelope.

use super::data::{shard_group_duration_for, Privilege, DEFAULT_REPLICA_N};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requested shape of a retention policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicySpec {
    pub name: String,
    /// Zero means keep forever.
    pub duration: Duration,
    pub replica_n: u32,
    /// Zero means derive from `duration`.
    pub shard_group_duration: Duration,
}

impl RetentionPolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: Duration::ZERO,
            replica_n: DEFAULT_REPLICA_N,
            shard_group_duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_replica_n(mut self, replica_n: u32) -> Self {
        self.replica_n = replica_n;
        self
    }

    pub fn with_shard_group_duration(mut self, duration: Duration) -> Self {
        self.shard_group_duration = duration;
        self
    }

    /// Shard group duration after defaults are applied.
    pub fn effective_shard_group_duration(&self) -> Duration {
        if self.shard_group_duration.is_zero() {
            shard_group_duration_for(self.duration)
        } else {
            self.shard_group_duration
        }
    }
}

/// Fields to change on an existing retention policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<u32>,
    pub shard_group_duration: Option<Duration>,
}

impl RetentionPolicyUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.duration.is_none()
            && self.replica_n.is_none()
            && self.shard_group_duration.is_none()
    }
}

/// A metadata mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    CreateDatabase {
        name: String,
        retention_policy: Option<RetentionPolicySpec>,
    },
    DropDatabase {
        name: String,
    },
    CreateRetentionPolicy {
        database: String,
        policy: RetentionPolicySpec,
        make_default: bool,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    SetDefaultRetentionPolicy {
        database: String,
        name: String,
    },
    UpdateRetentionPolicy {
        database: String,
        name: String,
        update: RetentionPolicyUpdate,
    },
    CreateShardGroup {
        database: String,
        policy: String,
        timestamp: DateTime<Utc>,
    },
    DeleteShardGroup {
        database: String,
        policy: String,
        id: u64,
    },
    CreateMetaNode {
        http_addr: String,
        tcp_addr: String,
    },
    CreateDataNode {
        http_addr: String,
        tcp_addr: String,
    },
    DeleteDataNode {
        id: u64,
    },
    CreateUser {
        name: String,
        hash: String,
        admin: bool,
    },
    UpdateUser {
        name: String,
        hash: String,
    },
    DropUser {
        name: String,
    },
    SetPrivilege {
        username: String,
        database: String,
        privilege: Privilege,
    },
    SetAdminPrivilege {
        username: String,
        admin: bool,
    },
    CreateContinuousQuery {
        database: String,
        name: String,
        query: String,
    },
    DropContinuousQuery {
        database: String,
        name: String,
    },
    CreateSubscription {
        database: String,
        retention_policy: String,
        name: String,
        mode: String,
        destinations: Vec<String>,
    },
    DropSubscription {
        database: String,
        retention_policy: String,
        name: String,
    },
}

impl Command {
    /// Stable name used in logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateDatabase { .. } => "create_database",
            Command::DropDatabase { .. } => "drop_database",
            Command::CreateRetentionPolicy { .. } => "create_retention_policy",
            Command::DropRetentionPolicy { .. } => "drop_retention_policy",
            Command::SetDefaultRetentionPolicy { .. } => "set_default_retention_policy",
            Command::UpdateRetentionPolicy { .. } => "update_retention_policy",
            Command::CreateShardGroup { .. } => "create_shard_group",
            Command::DeleteShardGroup { .. } => "delete_shard_group",
            Command::CreateMetaNode { .. } => "create_meta_node",
            Command::CreateDataNode { .. } => "create_data_node",
            Command::DeleteDataNode { .. } => "delete_data_node",
            Command::CreateUser { .. } => "create_user",
            Command::UpdateUser { .. } => "update_user",
            Command::DropUser { .. } => "drop_user",
            Command::SetPrivilege { .. } => "set_privilege",
            Command::SetAdminPrivilege { .. } => "set_admin_privilege",
            Command::CreateContinuousQuery { .. } => "create_continuous_query",
            Command::DropContinuousQuery { .. } => "drop_continuous_query",
            Command::CreateSubscription { .. } => "create_subscription",
            Command::DropSubscription { .. } => "drop_subscription",
        }
    }

    /// Cluster-membership changes; callers do not wait for these to become visible.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Command::CreateMetaNode { .. }
                | Command::CreateDataNode { .. }
                | Command::DeleteDataNode { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Body of a successful `POST /execute`: the index the command was applied at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub index: u64,
}

impl ExecuteResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
