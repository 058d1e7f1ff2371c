//! Metadata client
//!
//! Reads are served from the local [`MetadataCache`]. Schema mutations are
//! submitted to the authority and the call returns once the cache reflects
//! them. Cluster membership changes are submitted without waiting.

use super::cache::{ChangeGate, CacheWriter, MetadataCache};
use super::command::{Command, RetentionPolicySpec, RetentionPolicyUpdate};
use super::data::{
    DatabaseInfo, Privilege, RetentionPolicyInfo, ServerInfo, ShardGroupInfo, Snapshot, UserInfo,
};
use super::executor::{Statement, StatementExecutor};
use super::poller::SnapshotPoller;
use super::submitter::MutationSubmitter;
use super::transport::{CommandReceipt, HttpTransport, MetaTransport};
use crate::config::MetaClientConfig;
use crate::error::Missing;
use crate::protocol::StatementResult;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct MetaClient {
    config: MetaClientConfig,
    servers: Arc<Vec<String>>,
    transport: Arc<dyn MetaTransport>,
    cache: Arc<MetadataCache>,
    writer: Mutex<Option<CacheWriter>>,
    submitter: MutationSubmitter,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MetaClient {
    /// Client over HTTP(S).
    pub fn new(config: MetaClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Client over a caller-supplied transport.
    pub fn with_transport(
        config: MetaClientConfig,
        transport: Arc<dyn MetaTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let servers = Arc::new(config.meta_servers.clone());
        let (cache, writer) = MetadataCache::new();
        Ok(Self {
            submitter: MutationSubmitter::new(transport.clone(), servers.clone()),
            config,
            servers,
            transport,
            cache,
            writer: Mutex::new(Some(writer)),
            shutdown: CancellationToken::new(),
            poller: Mutex::new(None),
        })
    }

    /// Block until a first snapshot arrives, then start the background poller.
    pub async fn open(&self) -> Result<()> {
        let writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None if self.is_closed() => return Err(Error::Closed),
            None => return Err(Error::AlreadyOpen),
        };

        let mut poller = SnapshotPoller::new(
            self.transport.clone(),
            self.servers.clone(),
            writer,
            self.config.retry_delay,
            self.shutdown.clone(),
        );
        let Some(first) = poller.retry_until_snapshot().await else {
            return Err(Error::Closed);
        };
        poller.install(first);
        info!(index = self.cache.index(), servers = ?self.servers, "Metadata client opened");

        let handle = tokio::spawn(poller.run());
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    /// Stop the poller. In-flight fetches are left to finish on their own.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        // Detach; the task exits at its next shutdown check.
        drop(self.poller.lock().take());
        info!("Metadata client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.read()
    }

    pub fn index(&self) -> u64 {
        self.cache.index()
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn config(&self) -> &MetaClientConfig {
        &self.config
    }

    pub fn meta_servers(&self) -> &[String] {
        &self.servers
    }

    pub fn cluster_id(&self) -> u64 {
        self.cache.read().cluster_id
    }

    /// Gate that opens on the next metadata change.
    pub fn wait_for_data_changed(&self) -> ChangeGate {
        self.cache.wait_for_change()
    }

    async fn submit(&self, command: &Command) -> Result<CommandReceipt> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.submitter.submit(command).await
    }

    /// Submit `command` and wait until the cache reflects it.
    ///
    /// Returns the snapshot observed after the wait; callers resolve their
    /// object from it by identity.
    pub async fn exec_and_wait(&self, command: Command) -> Result<Arc<Snapshot>> {
        let gate = self.cache.wait_for_change();
        let receipt = self.submit(&command).await?;

        let visible = async move {
            match receipt.index {
                Some(index) => self.cache.wait_for_index(index, gate).await,
                None => gate.wait().await,
            }
        };
        tokio::select! {
            biased;
            _ = visible => Ok(self.cache.read()),
            _ = self.shutdown.cancelled() => Err(Error::Closed),
        }
    }

    // Databases

    pub fn databases(&self) -> Vec<DatabaseInfo> {
        self.cache.read().databases.clone()
    }

    pub fn database(&self, name: &str) -> Option<DatabaseInfo> {
        self.cache.read().database(name).cloned()
    }

    pub async fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        let snapshot = self
            .exec_and_wait(Command::CreateDatabase {
                name: name.to_string(),
                retention_policy: None,
            })
            .await?;
        resolve_database(&snapshot, name)
    }

    /// Like [`create_database`](Self::create_database) but answers from the
    /// cache when the database is already visible.
    pub async fn create_database_if_not_exists(&self, name: &str) -> Result<DatabaseInfo> {
        if let Some(db) = self.database(name) {
            return Ok(db);
        }
        self.create_database(name).await
    }

    /// Create a database whose default policy is `spec`.
    ///
    /// Fails if the database exists with a different policy under that name.
    pub async fn create_database_with_retention_policy(
        &self,
        name: &str,
        spec: RetentionPolicySpec,
    ) -> Result<DatabaseInfo> {
        if let Some(db) = self.database(name) {
            let matches = db
                .retention_policy(&spec.name)
                .is_some_and(|rp| policy_matches(rp, &spec));
            if !matches {
                return Err(Error::Rejected(format!(
                    "retention policy conflicts with an existing policy: {}",
                    spec.name
                )));
            }
            return Ok(db);
        }

        let snapshot = self
            .exec_and_wait(Command::CreateDatabase {
                name: name.to_string(),
                retention_policy: Some(spec),
            })
            .await?;
        resolve_database(&snapshot, name)
    }

    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.exec_and_wait(Command::DropDatabase {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    // Retention policies

    pub async fn create_retention_policy(
        &self,
        database: &str,
        spec: RetentionPolicySpec,
        make_default: bool,
    ) -> Result<RetentionPolicyInfo> {
        let name = spec.name.clone();
        let snapshot = self
            .exec_and_wait(Command::CreateRetentionPolicy {
                database: database.to_string(),
                policy: spec,
                make_default,
            })
            .await?;
        resolve_retention_policy(&snapshot, database, &name)
    }

    /// `Ok(None)` when the database exists but the policy does not.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<RetentionPolicyInfo>> {
        let snapshot = self.cache.read();
        let db = resolve_database_ref(&snapshot, database)?;
        Ok(db.retention_policy(name).cloned())
    }

    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.exec_and_wait(Command::DropRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn set_default_retention_policy(&self, database: &str, name: &str) -> Result<()> {
        self.exec_and_wait(Command::SetDefaultRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<RetentionPolicyInfo> {
        let resolved = update.name.clone().unwrap_or_else(|| name.to_string());
        let snapshot = self
            .exec_and_wait(Command::UpdateRetentionPolicy {
                database: database.to_string(),
                name: name.to_string(),
                update,
            })
            .await?;
        resolve_retention_policy(&snapshot, database, &resolved)
    }

    /// Visit every policy of every database in the current snapshot.
    pub fn visit_retention_policies<F>(&self, mut f: F)
    where
        F: FnMut(&DatabaseInfo, &RetentionPolicyInfo),
    {
        let snapshot = self.cache.read();
        for db in &snapshot.databases {
            for rp in &db.retention_policies {
                f(db, rp);
            }
        }
    }

    // Users

    pub fn users(&self) -> Vec<UserInfo> {
        self.cache.read().users.clone()
    }

    pub fn user(&self, name: &str) -> Result<UserInfo> {
        self.cache
            .read()
            .user(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(Missing::User(name.to_string())))
    }

    pub fn user_count(&self) -> usize {
        self.cache.read().users.len()
    }

    pub fn admin_user_exists(&self) -> bool {
        self.cache.read().admin_user_exists()
    }

    /// Create a user, hashing `password` with bcrypt.
    ///
    /// Creating an existing user with the same password and admin flag returns
    /// that user.
    pub async fn create_user(&self, name: &str, password: &str, admin: bool) -> Result<UserInfo> {
        if let Some(existing) = self.cache.read().user(name).cloned() {
            if existing.admin == admin && verify_password(password, &existing.hash).await? {
                return Ok(existing);
            }
            return Err(Error::Rejected(format!("user already exists: {}", name)));
        }

        let hash = hash_password(password, self.config.password_hash_cost).await?;
        let snapshot = self
            .exec_and_wait(Command::CreateUser {
                name: name.to_string(),
                hash,
                admin,
            })
            .await?;
        snapshot
            .user(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(Missing::User(name.to_string())))
    }

    pub async fn update_user(&self, name: &str, password: &str) -> Result<()> {
        let hash = hash_password(password, self.config.password_hash_cost).await?;
        self.exec_and_wait(Command::UpdateUser {
            name: name.to_string(),
            hash,
        })
        .await?;
        Ok(())
    }

    pub async fn drop_user(&self, name: &str) -> Result<()> {
        self.exec_and_wait(Command::DropUser {
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn set_privilege(
        &self,
        username: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<()> {
        self.exec_and_wait(Command::SetPrivilege {
            username: username.to_string(),
            database: database.to_string(),
            privilege,
        })
        .await?;
        Ok(())
    }

    pub async fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<()> {
        self.exec_and_wait(Command::SetAdminPrivilege {
            username: username.to_string(),
            admin,
        })
        .await?;
        Ok(())
    }

    pub fn user_privileges(&self, username: &str) -> Result<BTreeMap<String, Privilege>> {
        Ok(self.user(username)?.privileges)
    }

    pub fn user_privilege(&self, username: &str, database: &str) -> Result<Privilege> {
        Ok(self.user(username)?.privilege(database))
    }

    /// Check credentials against the cached hash.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo> {
        let user = self
            .cache
            .read()
            .user(username)
            .cloned()
            .ok_or_else(|| Error::Authentication("user not found".to_string()))?;
        if !verify_password(password, &user.hash).await? {
            return Err(Error::Authentication("invalid password".to_string()));
        }
        Ok(user)
    }

    // Shard groups

    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Result<Vec<ShardGroupInfo>> {
        let snapshot = self.cache.read();
        let rp = resolve_retention_policy_ref(&snapshot, database, policy)?;
        Ok(rp.shard_groups_by_time_range(min, max))
    }

    pub async fn create_shard_group_if_not_exists(
        &self,
        database: &str,
        policy: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ShardGroupInfo> {
        {
            let snapshot = self.cache.read();
            let rp = resolve_retention_policy_ref(&snapshot, database, policy)?;
            if let Some(group) = rp.shard_group_by_timestamp(timestamp) {
                return Ok(group.clone());
            }
        }

        let snapshot = self
            .exec_and_wait(Command::CreateShardGroup {
                database: database.to_string(),
                policy: policy.to_string(),
                timestamp,
            })
            .await?;
        resolve_retention_policy_ref(&snapshot, database, policy)?
            .shard_group_by_timestamp(timestamp)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(Missing::ShardGroup {
                    database: database.to_string(),
                    policy: policy.to_string(),
                })
            })
    }

    pub async fn delete_shard_group(&self, database: &str, policy: &str, id: u64) -> Result<()> {
        self.exec_and_wait(Command::DeleteShardGroup {
            database: database.to_string(),
            policy: policy.to_string(),
            id,
        })
        .await?;
        Ok(())
    }

    /// Create the successor of every live shard group ending in `(from, to]`.
    ///
    /// Failures are logged per policy and do not stop the pass.
    pub async fn precreate_shard_groups(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<()> {
        let mut due = Vec::new();
        self.visit_retention_policies(|db, rp| {
            let Some(last) = rp.last_shard_group() else {
                return;
            };
            if last.end_time > from && last.end_time <= to {
                due.push((db.name.clone(), rp.name.clone(), last.end_time));
            }
        });

        for (database, policy, next_start) in due {
            if let Err(e) = self
                .create_shard_group_if_not_exists(&database, &policy, next_start)
                .await
            {
                warn!(database = %database, policy = %policy, error = %e, "Failed to precreate shard group");
            }
        }
        Ok(())
    }

    /// Database, policy and group that hold `shard_id`.
    pub fn shard_owner(&self, shard_id: u64) -> Option<(String, String, ShardGroupInfo)> {
        let snapshot = self.cache.read();
        snapshot
            .shard_owner(shard_id)
            .map(|(db, rp, group)| (db.to_string(), rp.to_string(), group.clone()))
    }

    // Cluster membership (submit only)

    pub async fn create_meta_node(&self, http_addr: &str, tcp_addr: &str) -> Result<()> {
        self.submit(&Command::CreateMetaNode {
            http_addr: http_addr.to_string(),
            tcp_addr: tcp_addr.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn create_data_node(&self, http_addr: &str, tcp_addr: &str) -> Result<()> {
        self.submit(&Command::CreateDataNode {
            http_addr: http_addr.to_string(),
            tcp_addr: tcp_addr.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn delete_data_node(&self, id: u64) -> Result<()> {
        self.submit(&Command::DeleteDataNode { id }).await?;
        Ok(())
    }

    pub fn data_nodes(&self) -> Vec<ServerInfo> {
        self.cache.read().data_nodes.clone()
    }

    pub fn data_node(&self, id: u64) -> Result<ServerInfo> {
        self.cache
            .read()
            .data_node(id)
            .cloned()
            .ok_or(Error::NotFound(Missing::DataNode(id)))
    }

    pub fn data_node_by_http_addr(&self, addr: &str) -> Option<ServerInfo> {
        self.cache.read().data_node_by_http_addr(addr).cloned()
    }

    pub fn meta_nodes(&self) -> Vec<ServerInfo> {
        self.cache.read().meta_nodes.clone()
    }

    // Continuous queries and subscriptions

    pub async fn create_continuous_query(
        &self,
        database: &str,
        name: &str,
        query: &str,
    ) -> Result<()> {
        let snapshot = self
            .exec_and_wait(Command::CreateContinuousQuery {
                database: database.to_string(),
                name: name.to_string(),
                query: query.to_string(),
            })
            .await?;
        resolve_database_ref(&snapshot, database)?
            .continuous_query(name)
            .map(|_| ())
            .ok_or_else(|| {
                Error::NotFound(Missing::ContinuousQuery {
                    database: database.to_string(),
                    name: name.to_string(),
                })
            })
    }

    pub async fn drop_continuous_query(&self, database: &str, name: &str) -> Result<()> {
        self.exec_and_wait(Command::DropContinuousQuery {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn create_subscription(
        &self,
        database: &str,
        policy: &str,
        name: &str,
        mode: &str,
        destinations: Vec<String>,
    ) -> Result<()> {
        let snapshot = self
            .exec_and_wait(Command::CreateSubscription {
                database: database.to_string(),
                retention_policy: policy.to_string(),
                name: name.to_string(),
                mode: mode.to_string(),
                destinations,
            })
            .await?;
        resolve_retention_policy_ref(&snapshot, database, policy)?
            .subscription(name)
            .map(|_| ())
            .ok_or_else(|| {
                Error::NotFound(Missing::Subscription {
                    database: database.to_string(),
                    policy: policy.to_string(),
                    name: name.to_string(),
                })
            })
    }

    pub async fn drop_subscription(&self, database: &str, policy: &str, name: &str) -> Result<()> {
        self.exec_and_wait(Command::DropSubscription {
            database: database.to_string(),
            retention_policy: policy.to_string(),
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Run a typed meta statement and render its tabular result.
    pub async fn execute_statement(&self, statement: Statement) -> StatementResult {
        StatementExecutor::new(self).execute(statement).await
    }
}

impl Drop for MetaClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn policy_matches(rp: &RetentionPolicyInfo, spec: &RetentionPolicySpec) -> bool {
    rp.duration == spec.duration
        && rp.replica_n == spec.replica_n
        && rp.shard_group_duration == spec.effective_shard_group_duration()
}

fn resolve_database_ref<'a>(snapshot: &'a Snapshot, name: &str) -> Result<&'a DatabaseInfo> {
    snapshot
        .database(name)
        .ok_or_else(|| Error::NotFound(Missing::Database(name.to_string())))
}

fn resolve_database(snapshot: &Snapshot, name: &str) -> Result<DatabaseInfo> {
    resolve_database_ref(snapshot, name).cloned()
}

fn resolve_retention_policy_ref<'a>(
    snapshot: &'a Snapshot,
    database: &str,
    name: &str,
) -> Result<&'a RetentionPolicyInfo> {
    resolve_database_ref(snapshot, database)?
        .retention_policy(name)
        .ok_or_else(|| {
            Error::NotFound(Missing::RetentionPolicy {
                database: database.to_string(),
                name: name.to_string(),
            })
        })
}

fn resolve_retention_policy(
    snapshot: &Snapshot,
    database: &str,
    name: &str,
) -> Result<RetentionPolicyInfo> {
    resolve_retention_policy_ref(snapshot, database, name).cloned()
}

async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| Error::Internal(format!("password hashing task failed: {}", e)))?
        .map_err(Error::from)
}

async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| Error::Internal(format!("password verification task failed: {}", e)))?
        .map_err(Error::from)
}
