//! In-memory metadata authority
//!
//! A single-node stand-in for the replicated store: it applies [`Command`]s to
//! a [`Snapshot`], stamps each result with the next index and lets readers
//! long-poll for an index newer than the one they hold.
//!
//! Every accepted command advances the index, including ones that turn out to
//! be no-ops (creating a database that already exists), so callers waiting on
//! a change gate always wake.

use super::command::{Command, RetentionPolicySpec, RetentionPolicyUpdate};
use super::data::{
    ContinuousQueryInfo, DatabaseInfo, NodeRole, Privilege, RetentionPolicyInfo, ServerInfo,
    ShardGroupInfo, ShardInfo, Snapshot, SubscriptionInfo, UserInfo,
    DEFAULT_RETENTION_POLICY_NAME, MIN_RETENTION_POLICY_DURATION,
};
use crate::duration::format_duration;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Upper bound on the replication of a database's autocreated policy.
const MAX_AUTOGEN_REPLICA_N: u32 = 3;

/// Default time a snapshot request is held waiting for a newer index.
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long `snapshot_after` waits before returning the current snapshot
    pub long_poll_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
        }
    }
}

/// Authoritative snapshot holder
pub struct MemoryStore {
    config: StoreConfig,
    data: RwLock<Arc<Snapshot>>,
    index_tx: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        let snapshot = Snapshot {
            index: 1,
            cluster_id: rand::random::<u64>(),
            ..Default::default()
        };
        let (index_tx, _) = watch::channel(snapshot.index);
        info!(cluster_id = snapshot.cluster_id, "Created metadata store");
        Self {
            config,
            data: RwLock::new(Arc::new(snapshot)),
            index_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.data.read().clone()
    }

    pub fn index(&self) -> u64 {
        self.data.read().index
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Snapshot newer than `index`, or the current one once the long-poll
    /// window elapses.
    pub async fn snapshot_after(&self, index: u64) -> Arc<Snapshot> {
        let mut rx = self.index_tx.subscribe();
        if *rx.borrow() <= index {
            let _ = tokio::time::timeout(
                self.config.long_poll_timeout,
                rx.wait_for(|current| *current > index),
            )
            .await;
        }
        self.snapshot()
    }

    /// Apply a command and return the index it was applied at.
    pub fn apply(&self, command: Command) -> Result<u64> {
        let kind = command.kind();
        let mut guard = self.data.write();
        let mut next = Snapshot::clone(&guard);
        apply_command(&mut next, command, Utc::now())?;
        next.index = guard.index + 1;
        let index = next.index;
        *guard = Arc::new(next);
        self.index_tx.send_replace(index);
        drop(guard);

        debug!(command = kind, index, "Applied metadata command");
        Ok(index)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn rejected(msg: impl Into<String>) -> Error {
    Error::Rejected(msg.into())
}

fn database_mut<'a>(data: &'a mut Snapshot, name: &str) -> Result<&'a mut DatabaseInfo> {
    data.database_mut(name)
        .ok_or_else(|| rejected(format!("database not found: {}", name)))
}

fn retention_policy_mut<'a>(
    data: &'a mut Snapshot,
    database: &str,
    name: &str,
) -> Result<&'a mut RetentionPolicyInfo> {
    database_mut(data, database)?
        .retention_policy_mut(name)
        .ok_or_else(|| rejected(format!("retention policy not found: {}.{}", database, name)))
}

fn user_mut<'a>(data: &'a mut Snapshot, name: &str) -> Result<&'a mut UserInfo> {
    data.user_mut(name)
        .ok_or_else(|| rejected(format!("user not found: {}", name)))
}

/// Command state machine.
pub(crate) fn apply_command(data: &mut Snapshot, command: Command, now: DateTime<Utc>) -> Result<()> {
    match command {
        Command::CreateDatabase {
            name,
            retention_policy,
        } => create_database(data, name, retention_policy),
        Command::DropDatabase { name } => {
            data.databases.retain(|db| db.name != name);
            for user in &mut data.users {
                user.privileges.remove(&name);
            }
            Ok(())
        }
        Command::CreateRetentionPolicy {
            database,
            policy,
            make_default,
        } => create_retention_policy(data, &database, policy, make_default),
        Command::DropRetentionPolicy { database, name } => {
            let db = database_mut(data, &database)?;
            db.retention_policies.retain(|rp| rp.name != name);
            if db.default_retention_policy == name {
                db.default_retention_policy.clear();
            }
            Ok(())
        }
        Command::SetDefaultRetentionPolicy { database, name } => {
            let db = database_mut(data, &database)?;
            if db.retention_policy(&name).is_none() {
                return Err(rejected(format!(
                    "retention policy not found: {}.{}",
                    database, name
                )));
            }
            db.default_retention_policy = name;
            Ok(())
        }
        Command::UpdateRetentionPolicy {
            database,
            name,
            update,
        } => update_retention_policy(data, &database, &name, update),
        Command::CreateShardGroup {
            database,
            policy,
            timestamp,
        } => create_shard_group(data, &database, &policy, timestamp),
        Command::DeleteShardGroup {
            database,
            policy,
            id,
        } => {
            let rp = retention_policy_mut(data, &database, &policy)?;
            if let Some(group) = rp.shard_groups.iter_mut().find(|g| g.id == id) {
                if group.deleted_at.is_none() {
                    group.deleted_at = Some(now);
                }
            }
            Ok(())
        }
        Command::CreateMetaNode {
            http_addr,
            tcp_addr,
        } => {
            register_node(data, http_addr, tcp_addr, NodeRole::Meta);
            Ok(())
        }
        Command::CreateDataNode {
            http_addr,
            tcp_addr,
        } => {
            register_node(data, http_addr, tcp_addr, NodeRole::Data);
            Ok(())
        }
        Command::DeleteDataNode { id } => {
            if data.data_node(id).is_none() {
                return Err(rejected(format!("data node not found: {}", id)));
            }
            data.data_nodes.retain(|n| n.id != id);
            if let Some(meta) = data.meta_nodes.iter_mut().find(|n| n.id == id) {
                meta.role = NodeRole::Meta;
            }
            for db in &mut data.databases {
                for rp in &mut db.retention_policies {
                    for group in &mut rp.shard_groups {
                        for shard in &mut group.shards {
                            shard.owners.retain(|owner| *owner != id);
                        }
                    }
                }
            }
            Ok(())
        }
        Command::CreateUser { name, hash, admin } => {
            if name.is_empty() {
                return Err(rejected("username required"));
            }
            if data.user(&name).is_some() {
                return Err(rejected(format!("user already exists: {}", name)));
            }
            data.users.push(UserInfo {
                name,
                hash,
                admin,
                privileges: Default::default(),
            });
            Ok(())
        }
        Command::UpdateUser { name, hash } => {
            user_mut(data, &name)?.hash = hash;
            Ok(())
        }
        Command::DropUser { name } => {
            if data.user(&name).is_none() {
                return Err(rejected(format!("user not found: {}", name)));
            }
            data.users.retain(|u| u.name != name);
            Ok(())
        }
        Command::SetPrivilege {
            username,
            database,
            privilege,
        } => {
            if data.database(&database).is_none() {
                return Err(rejected(format!("database not found: {}", database)));
            }
            let user = user_mut(data, &username)?;
            if privilege == Privilege::NoPrivileges {
                user.privileges.remove(&database);
            } else {
                user.privileges.insert(database, privilege);
            }
            Ok(())
        }
        Command::SetAdminPrivilege { username, admin } => {
            user_mut(data, &username)?.admin = admin;
            Ok(())
        }
        Command::CreateContinuousQuery {
            database,
            name,
            query,
        } => {
            let db = database_mut(data, &database)?;
            let same_query = db.continuous_query(&name).map(|cq| cq.query == query);
            match same_query {
                Some(true) => Ok(()),
                Some(false) => Err(rejected(format!("continuous query already exists: {}", name))),
                None => {
                    db.continuous_queries.push(ContinuousQueryInfo { name, query });
                    Ok(())
                }
            }
        }
        Command::DropContinuousQuery { database, name } => {
            database_mut(data, &database)?
                .continuous_queries
                .retain(|cq| cq.name != name);
            Ok(())
        }
        Command::CreateSubscription {
            database,
            retention_policy,
            name,
            mode,
            destinations,
        } => {
            let mode = mode.to_ascii_uppercase();
            if mode != "ANY" && mode != "ALL" {
                return Err(rejected(format!(
                    "subscription mode must be ANY or ALL, got {:?}",
                    mode
                )));
            }
            if destinations.is_empty() {
                return Err(rejected("subscription requires at least one destination"));
            }
            let rp = retention_policy_mut(data, &database, &retention_policy)?;
            if rp.subscription(&name).is_some() {
                return Err(rejected(format!("subscription already exists: {}", name)));
            }
            rp.subscriptions.push(SubscriptionInfo {
                name,
                mode,
                destinations,
            });
            Ok(())
        }
        Command::DropSubscription {
            database,
            retention_policy,
            name,
        } => {
            let rp = retention_policy_mut(data, &database, &retention_policy)?;
            if rp.subscription(&name).is_none() {
                return Err(rejected(format!("subscription not found: {}", name)));
            }
            rp.subscriptions.retain(|s| s.name != name);
            Ok(())
        }
    }
}

fn policy_from_spec(spec: RetentionPolicySpec) -> Result<RetentionPolicyInfo> {
    if spec.name.is_empty() {
        return Err(rejected("retention policy name required"));
    }
    if spec.replica_n < 1 {
        return Err(rejected("replication factor must be greater than 0"));
    }
    if !spec.duration.is_zero() && spec.duration < MIN_RETENTION_POLICY_DURATION {
        return Err(rejected(format!(
            "retention policy duration must be at least {}",
            format_duration(MIN_RETENTION_POLICY_DURATION)
        )));
    }
    let shard_group_duration = spec.effective_shard_group_duration();
    Ok(RetentionPolicyInfo {
        shard_group_duration,
        duration: spec.duration,
        replica_n: spec.replica_n,
        ..RetentionPolicyInfo::new(spec.name)
    })
}

fn create_database(
    data: &mut Snapshot,
    name: String,
    retention_policy: Option<RetentionPolicySpec>,
) -> Result<()> {
    if name.is_empty() {
        return Err(rejected("database name required"));
    }
    if data.database(&name).is_some() {
        return Ok(());
    }

    let policy = match retention_policy {
        Some(spec) => policy_from_spec(spec)?,
        None => {
            let mut policy = RetentionPolicyInfo::new(DEFAULT_RETENTION_POLICY_NAME);
            policy.replica_n = (data.data_nodes.len() as u32).clamp(1, MAX_AUTOGEN_REPLICA_N);
            policy
        }
    };
    let mut db = DatabaseInfo::new(name);
    db.default_retention_policy = policy.name.clone();
    db.retention_policies.push(policy);
    data.databases.push(db);
    Ok(())
}

fn create_retention_policy(
    data: &mut Snapshot,
    database: &str,
    spec: RetentionPolicySpec,
    make_default: bool,
) -> Result<()> {
    let policy = policy_from_spec(spec)?;
    let db = database_mut(data, database)?;

    let matches_existing = db.retention_policy(&policy.name).map(|existing| {
        existing.duration == policy.duration
            && existing.replica_n == policy.replica_n
            && existing.shard_group_duration == policy.shard_group_duration
    });
    match matches_existing {
        Some(true) => {}
        Some(false) => {
            return Err(rejected(format!(
                "retention policy already exists: {}",
                policy.name
            )))
        }
        None => db.retention_policies.push(policy.clone()),
    }

    if make_default || db.default_retention_policy.is_empty() {
        db.default_retention_policy = policy.name;
    }
    Ok(())
}

fn update_retention_policy(
    data: &mut Snapshot,
    database: &str,
    name: &str,
    update: RetentionPolicyUpdate,
) -> Result<()> {
    let db = database_mut(data, database)?;
    if let Some(new_name) = &update.name {
        if new_name != name && db.retention_policy(new_name).is_some() {
            return Err(rejected(format!(
                "retention policy already exists: {}",
                new_name
            )));
        }
    }
    if update.replica_n == Some(0) {
        return Err(rejected("replication factor must be greater than 0"));
    }
    if let Some(duration) = update.duration {
        if !duration.is_zero() && duration < MIN_RETENTION_POLICY_DURATION {
            return Err(rejected(format!(
                "retention policy duration must be at least {}",
                format_duration(MIN_RETENTION_POLICY_DURATION)
            )));
        }
    }

    let was_default = db.default_retention_policy == name;
    let rp = db
        .retention_policy_mut(name)
        .ok_or_else(|| rejected(format!("retention policy not found: {}.{}", database, name)))?;

    if let Some(duration) = update.duration {
        rp.duration = duration;
    }
    if let Some(replica_n) = update.replica_n {
        rp.replica_n = replica_n;
    }
    if let Some(sgd) = update.shard_group_duration {
        rp.shard_group_duration = sgd;
    }
    if let Some(new_name) = update.name {
        rp.name = new_name.clone();
        if was_default {
            db.default_retention_policy = new_name;
        }
    }
    Ok(())
}

fn create_shard_group(
    data: &mut Snapshot,
    database: &str,
    policy: &str,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    let owners: Vec<u64> = data.data_nodes.iter().map(|n| n.id).collect();
    if owners.is_empty() {
        return Err(rejected("no data nodes available to own shards"));
    }

    let mut next_group_id = data.max_shard_group_id;
    let mut next_shard_id = data.max_shard_id;

    let rp = retention_policy_mut(data, database, policy)?;
    if rp.shard_group_by_timestamp(timestamp).is_some() {
        return Ok(());
    }

    let width = rp.shard_group_duration.as_secs().max(1) as i64;
    let secs = timestamp.timestamp();
    let start_secs = secs - secs.rem_euclid(width);
    let start_time = DateTime::<Utc>::from_timestamp(start_secs, 0)
        .ok_or_else(|| rejected(format!("timestamp out of range: {}", timestamp)))?;
    let end_time = DateTime::<Utc>::from_timestamp(start_secs + width, 0)
        .ok_or_else(|| rejected(format!("timestamp out of range: {}", timestamp)))?;

    let replica_n = (rp.replica_n as usize).clamp(1, owners.len());
    let shard_n = (owners.len() / replica_n).max(1);

    next_group_id += 1;
    let mut shards = Vec::with_capacity(shard_n);
    for i in 0..shard_n {
        next_shard_id += 1;
        let shard_owners = (0..replica_n)
            .map(|j| owners[(i * replica_n + j) % owners.len()])
            .collect();
        shards.push(ShardInfo {
            id: next_shard_id,
            owners: shard_owners,
        });
    }

    rp.shard_groups.push(ShardGroupInfo {
        id: next_group_id,
        start_time,
        end_time,
        deleted_at: None,
        shards,
    });
    rp.shard_groups.sort_by_key(|g| g.start_time);

    data.max_shard_group_id = next_group_id;
    data.max_shard_id = next_shard_id;
    Ok(())
}

/// Register a node by address. A node registering for the second capability
/// under the same TCP address keeps its id and becomes hybrid.
fn register_node(data: &mut Snapshot, http_addr: String, tcp_addr: String, role: NodeRole) {
    let Snapshot {
        meta_nodes,
        data_nodes,
        max_node_id,
        ..
    } = data;
    let (own, peers) = match role {
        NodeRole::Meta => (meta_nodes, data_nodes),
        _ => (data_nodes, meta_nodes),
    };
    if own.iter().any(|n| n.tcp_addr == tcp_addr) {
        return;
    }

    let (id, role) = match peers.iter_mut().find(|n| n.tcp_addr == tcp_addr) {
        Some(peer) => {
            peer.role = NodeRole::Hybrid;
            (peer.id, NodeRole::Hybrid)
        }
        None => {
            *max_node_id += 1;
            (*max_node_id, role)
        }
    };

    info!(id, http_addr = %http_addr, role = %role, "Registered cluster node");
    own.push(ServerInfo {
        id,
        http_addr,
        tcp_addr,
        role,
    });
}
