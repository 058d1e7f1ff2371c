//! Meta statement executor
//!
//! Runs typed meta statements against a [`MetaClient`] and renders the
//! tabular rows query nodes return for them. Parsing statement text is left to
//! the query layer.

use super::client::MetaClient;
use super::command::{RetentionPolicySpec, RetentionPolicyUpdate};
use super::data::Privilege;
use crate::duration::format_duration;
use crate::error::Missing;
use crate::protocol::{Row, StatementResult};
use crate::{Error, Result};
use serde_json::json;

/// A statement that reads or changes cluster metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        retention_policy: Option<RetentionPolicySpec>,
    },
    DropDatabase {
        name: String,
    },
    ShowDatabases,
    CreateRetentionPolicy {
        database: String,
        policy: RetentionPolicySpec,
        default: bool,
    },
    AlterRetentionPolicy {
        database: String,
        name: String,
        update: RetentionPolicyUpdate,
        default: bool,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    ShowRetentionPolicies {
        database: String,
    },
    ShowServers,
    ShowShards,
    CreateUser {
        name: String,
        password: String,
        admin: bool,
    },
    DropUser {
        name: String,
    },
    SetPassword {
        name: String,
        password: String,
    },
    Grant {
        user: String,
        database: String,
        privilege: Privilege,
    },
    Revoke {
        user: String,
        database: String,
        privilege: Privilege,
    },
    GrantAdmin {
        user: String,
    },
    RevokeAdmin {
        user: String,
    },
    ShowUsers,
    ShowGrants {
        user: String,
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
    ShowContinuousQueries,
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
    ShowSubscriptions,
}

pub struct StatementExecutor<'a> {
    client: &'a MetaClient,
}

impl<'a> StatementExecutor<'a> {
    pub fn new(client: &'a MetaClient) -> Self {
        Self { client }
    }

    /// Execute one statement. Failures are reported in the result's `error`.
    pub async fn execute(&self, statement: Statement) -> StatementResult {
        match self.run(statement).await {
            Ok(rows) => StatementResult::with_rows(rows),
            Err(Error::Rejected(msg)) => StatementResult::with_error(msg),
            Err(e) => StatementResult::with_error(e.to_string()),
        }
    }

    async fn run(&self, statement: Statement) -> Result<Vec<Row>> {
        let client = self.client;
        match statement {
            Statement::CreateDatabase {
                name,
                retention_policy,
            } => {
                match retention_policy {
                    Some(spec) => client.create_database_with_retention_policy(&name, spec).await?,
                    None => client.create_database(&name).await?,
                };
                Ok(Vec::new())
            }
            Statement::DropDatabase { name } => {
                client.drop_database(&name).await?;
                Ok(Vec::new())
            }
            Statement::ShowDatabases => {
                let mut row = Row::new("databases", &["name"]);
                for db in client.databases() {
                    row.push(vec![json!(db.name)]);
                }
                Ok(vec![row])
            }
            Statement::CreateRetentionPolicy {
                database,
                policy,
                default,
            } => {
                client.create_retention_policy(&database, policy, default).await?;
                Ok(Vec::new())
            }
            Statement::AlterRetentionPolicy {
                database,
                name,
                update,
                default,
            } => {
                let mut current = name;
                if !update.is_empty() {
                    current = client.update_retention_policy(&database, &current, update).await?.name;
                }
                if default {
                    client.set_default_retention_policy(&database, &current).await?;
                }
                Ok(Vec::new())
            }
            Statement::DropRetentionPolicy { database, name } => {
                client.drop_retention_policy(&database, &name).await?;
                Ok(Vec::new())
            }
            Statement::ShowRetentionPolicies { database } => self.show_retention_policies(&database),
            Statement::ShowServers => Ok(self.show_servers()),
            Statement::ShowShards => Ok(self.show_shards()),
            Statement::CreateUser {
                name,
                password,
                admin,
            } => {
                client.create_user(&name, &password, admin).await?;
                Ok(Vec::new())
            }
            Statement::DropUser { name } => {
                client.drop_user(&name).await?;
                Ok(Vec::new())
            }
            Statement::SetPassword { name, password } => {
                client.update_user(&name, &password).await?;
                Ok(Vec::new())
            }
            Statement::Grant {
                user,
                database,
                privilege,
            } => {
                client.set_privilege(&user, &database, privilege).await?;
                Ok(Vec::new())
            }
            Statement::Revoke {
                user,
                database,
                privilege,
            } => {
                let current = client.user_privilege(&user, &database)?;
                let remaining = revoke(current, privilege);
                client.set_privilege(&user, &database, remaining).await?;
                Ok(Vec::new())
            }
            Statement::GrantAdmin { user } => {
                client.set_admin_privilege(&user, true).await?;
                Ok(Vec::new())
            }
            Statement::RevokeAdmin { user } => {
                client.set_admin_privilege(&user, false).await?;
                Ok(Vec::new())
            }
            Statement::ShowUsers => {
                let mut row = Row::new("", &["user", "admin"]);
                for user in client.users() {
                    row.push(vec![json!(user.name), json!(user.admin)]);
                }
                Ok(vec![row])
            }
            Statement::ShowGrants { user } => {
                let mut row = Row::new("", &["database", "privilege"]);
                for (database, privilege) in client.user_privileges(&user)? {
                    row.push(vec![json!(database), json!(privilege.to_string())]);
                }
                Ok(vec![row])
            }
            Statement::CreateContinuousQuery {
                database,
                name,
                query,
            } => {
                client.create_continuous_query(&database, &name, &query).await?;
                Ok(Vec::new())
            }
            Statement::DropContinuousQuery { database, name } => {
                client.drop_continuous_query(&database, &name).await?;
                Ok(Vec::new())
            }
            Statement::ShowContinuousQueries => {
                let rows = client
                    .databases()
                    .into_iter()
                    .map(|db| {
                        let mut row = Row::new(db.name, &["name", "query"]);
                        for cq in db.continuous_queries {
                            row.push(vec![json!(cq.name), json!(cq.query)]);
                        }
                        row
                    })
                    .collect();
                Ok(rows)
            }
            Statement::CreateSubscription {
                database,
                retention_policy,
                name,
                mode,
                destinations,
            } => {
                client
                    .create_subscription(&database, &retention_policy, &name, &mode, destinations)
                    .await?;
                Ok(Vec::new())
            }
            Statement::DropSubscription {
                database,
                retention_policy,
                name,
            } => {
                client.drop_subscription(&database, &retention_policy, &name).await?;
                Ok(Vec::new())
            }
            Statement::ShowSubscriptions => Ok(self.show_subscriptions()),
        }
    }

    fn show_retention_policies(&self, database: &str) -> Result<Vec<Row>> {
        let db = self
            .client
            .database(database)
            .ok_or_else(|| Error::NotFound(Missing::Database(database.to_string())))?;

        let mut row = Row::new(
            "",
            &["name", "duration", "shardGroupDuration", "replicaN", "default"],
        );
        for rp in &db.retention_policies {
            row.push(vec![
                json!(rp.name),
                json!(format_duration(rp.duration)),
                json!(format_duration(rp.shard_group_duration)),
                json!(rp.replica_n),
                json!(db.default_retention_policy == rp.name),
            ]);
        }
        Ok(vec![row])
    }

    fn show_servers(&self) -> Vec<Row> {
        let snapshot = self.client.snapshot();
        let mut data = Row::new("data_nodes", &["id", "http_addr", "tcp_addr"]);
        for node in &snapshot.data_nodes {
            data.push(vec![json!(node.id), json!(node.http_addr), json!(node.tcp_addr)]);
        }
        let mut meta = Row::new("meta_nodes", &["id", "http_addr", "tcp_addr"]);
        for node in &snapshot.meta_nodes {
            meta.push(vec![json!(node.id), json!(node.http_addr), json!(node.tcp_addr)]);
        }
        vec![data, meta]
    }

    fn show_shards(&self) -> Vec<Row> {
        let snapshot = self.client.snapshot();
        let columns = [
            "id",
            "database",
            "retention_policy",
            "shard_group",
            "start_time",
            "end_time",
            "expiry_time",
            "owners",
        ];
        let mut rows = Vec::with_capacity(snapshot.databases.len());
        for db in &snapshot.databases {
            let mut row = Row::new(db.name.clone(), &columns);
            for rp in &db.retention_policies {
                let retention =
                    chrono::Duration::from_std(rp.duration).unwrap_or_else(|_| chrono::Duration::zero());
                for group in rp.shard_groups.iter().filter(|g| !g.deleted()) {
                    let expiry = group.end_time + retention;
                    for shard in &group.shards {
                        let owners = shard
                            .owners
                            .iter()
                            .map(|id| id.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        row.push(vec![
                            json!(shard.id),
                            json!(db.name),
                            json!(rp.name),
                            json!(group.id),
                            json!(group.start_time.to_rfc3339()),
                            json!(group.end_time.to_rfc3339()),
                            json!(expiry.to_rfc3339()),
                            json!(owners),
                        ]);
                    }
                }
            }
            rows.push(row);
        }
        rows
    }

    fn show_subscriptions(&self) -> Vec<Row> {
        let snapshot = self.client.snapshot();
        snapshot
            .databases
            .iter()
            .map(|db| {
                let mut row = Row::new(
                    db.name.clone(),
                    &["retention_policy", "name", "mode", "destinations"],
                );
                for rp in &db.retention_policies {
                    for sub in &rp.subscriptions {
                        row.push(vec![
                            json!(rp.name),
                            json!(sub.name),
                            json!(sub.mode),
                            json!(sub.destinations),
                        ]);
                    }
                }
                row
            })
            .collect()
    }
}

/// Privilege left after revoking `revoked` from `current`.
fn revoke(current: Privilege, revoked: Privilege) -> Privilege {
    match (current, revoked) {
        (_, Privilege::All) => Privilege::NoPrivileges,
        (Privilege::All, Privilege::Read) => Privilege::Write,
        (Privilege::All, Privilege::Write) => Privilege::Read,
        (current, revoked) if current == revoked => Privilege::NoPrivileges,
        (current, _) => current,
    }
}
