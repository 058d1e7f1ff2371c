//! Cluster verification harness
//!
//! Drives a running cluster through its query interface and checks that
//! metadata changes made on one node become visible on every data node.
//!
//! - [`LocalCluster`] spawns node processes from generated configurations
//! - [`RemoteCluster`] attaches to nodes that are already running
//! - [`converge`] polls every node until a predicate holds or a deadline passes
//! - [`Suite`] runs the scenario catalogue against either

pub mod client;
pub mod converge;
pub mod line_protocol;
pub mod local;
pub mod node_config;
pub mod remote;
pub mod results;
pub mod scenarios;

pub use client::QueryClient;
pub use converge::{converge, converge_paths, nodes_having_path, Probe, NO_NODES_ANSWERED};
pub use line_protocol::{parse_point, parse_points, FieldValue, Point};
pub use local::LocalCluster;
pub use node_config::{generate_join_arg, ptoi, shift_port, NodeConfig, PORT_JUMP};
pub use remote::RemoteCluster;
pub use results::{parse_result, CommandKind, CommandResult, RetentionPolicyRow, ShardRow};
pub use scenarios::{Outcome, Scenario, ScenarioReport, Suite};

use crate::duration::format_literal;
use crate::protocol::StatementResult;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Node binary used when none is given.
pub const DEFAULT_NODE_BINARY: &str = "influxd";

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(20);

const MAP_SERVERS_STATEMENT: &str = "SHOW SERVERS";
const MAP_SERVERS_BACKOFF: Duration = Duration::from_millis(50);

/// Response of one node
#[derive(Debug)]
pub struct NodeResponse<T = StatementResult> {
    pub node_id: u64,
    pub outcome: Result<T>,
}

impl NodeResponse {
    /// Parse a successful result; a failed query becomes an error naming the node.
    pub fn parse(&self, kind: CommandKind) -> Result<CommandResult> {
        match &self.outcome {
            Ok(result) => parse_result(kind, result),
            Err(e) => Err(Error::Query(format!("[node {}] {}", self.node_id, e))),
        }
    }
}

impl<T> NodeResponse<T> {
    /// Drop the payload, keeping the node id in the error.
    pub fn into_result(self) -> Result<T> {
        let node_id = self.node_id;
        self.outcome
            .map_err(|e| Error::Query(format!("[node {}] {}", node_id, e)))
    }
}

/// Number of meta-capable and data-capable nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub meta_n: usize,
    pub data_n: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PolicyOption {
    duration: Duration,
    replica_n: u64,
}

/// Options for [`Cluster::new_database`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseOptions {
    default_policy: Option<PolicyOption>,
    policies: Vec<(String, PolicyOption)>,
}

impl DatabaseOptions {
    /// Give the database's default policy this duration and replication factor.
    pub fn with_default_rp(mut self, duration: Duration, replica_n: u64) -> Self {
        self.default_policy = Some(PolicyOption {
            duration,
            replica_n,
        });
        self
    }

    /// Create an additional, non-default retention policy.
    pub fn with_rp(mut self, name: impl Into<String>, duration: Duration, replica_n: u64) -> Self {
        self.policies.push((
            name.into(),
            PolicyOption {
                duration,
                replica_n,
            },
        ));
        self
    }

    /// Statements that create `database` with these options, in order.
    pub fn statements(&self, database: &str) -> Vec<String> {
        let mut create = format!("CREATE DATABASE {:?}", database);
        if let Some(policy) = &self.default_policy {
            create.push_str(&format!(
                " WITH DURATION {} REPLICATION {}",
                format_literal(policy.duration),
                policy.replica_n
            ));
        }

        let mut statements = vec![create];
        for (name, policy) in &self.policies {
            statements.push(format!(
                "CREATE RETENTION POLICY {:?} ON {:?} DURATION {} REPLICATION {}",
                name,
                database,
                format_literal(policy.duration),
                policy.replica_n
            ));
        }
        statements
    }
}

/// Shape of a local cluster
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub bin_path: PathBuf,
    pub hybrid: u32,
    pub meta: u32,
    pub data: u32,
    pub query_timeout: Duration,
    pub start_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            bin_path: PathBuf::from(DEFAULT_NODE_BINARY),
            hybrid: 3,
            meta: 0,
            data: 0,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

impl ClusterOptions {
    pub fn meta_n(&self) -> u32 {
        self.hybrid + self.meta
    }

    pub fn data_n(&self) -> u32 {
        self.hybrid + self.data
    }

    pub fn validate(&self) -> Result<()> {
        if self.meta_n() < 3 {
            return Err(Error::Config(format!(
                "cluster must have at least three meta nodes, got {}",
                self.meta_n()
            )));
        }
        if self.data_n() < 1 {
            return Err(Error::Config(
                "cluster must have at least one data node".to_string(),
            ));
        }
        Ok(())
    }
}

/// A running cluster reachable through its data nodes' query interfaces.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Bring the cluster up and connect to every data node. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Release clients and processes. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Clients for the data nodes found by [`Cluster::start`].
    fn nodes(&self) -> &NodeSet;

    fn info(&self) -> ClusterInfo;

    /// Data directories visible from this host. Empty when storage is remote.
    fn data_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Run `statement` on every data node; the receiver closes after the last response.
    fn query_all(&self, statement: &str, database: &str) -> mpsc::Receiver<NodeResponse> {
        self.nodes().query_all(statement, database)
    }

    /// Run `statement` on an arbitrary data node.
    async fn query_any(&self, statement: &str, database: &str) -> NodeResponse {
        self.nodes().query_any(statement, database).await
    }

    async fn query(&self, node_id: u64, statement: &str, database: &str) -> NodeResponse {
        self.nodes().query(node_id, statement, database).await
    }

    /// Write line-protocol points to an arbitrary data node.
    async fn write_any(
        &self,
        database: &str,
        policy: Option<&str>,
        points: &[&str],
    ) -> NodeResponse<()> {
        self.nodes().write_any(database, policy, points).await
    }

    async fn write(
        &self,
        node_id: u64,
        database: &str,
        policy: Option<&str>,
        points: &[&str],
    ) -> NodeResponse<()> {
        self.nodes().write(node_id, database, policy, points).await
    }

    /// Create a uniquely named database and return its name.
    async fn new_database(&self, options: DatabaseOptions) -> Result<String> {
        let name = format!("db_{}", uuid::Uuid::new_v4());
        for statement in options.statements(&name) {
            self.query_any(&statement, "").await.into_result()?;
        }
        debug!(database = %name, "Created database");
        Ok(name)
    }
}

/// Query clients keyed by data node id
#[derive(Debug)]
pub struct NodeSet {
    clients: RwLock<BTreeMap<u64, QueryClient>>,
    query_timeout: Duration,
}

impl NodeSet {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            query_timeout,
        }
    }

    /// Replace the client set with one client per `(id, http_addr)`.
    pub fn connect(&self, nodes: &BTreeMap<u64, String>) -> Result<()> {
        let mut clients = BTreeMap::new();
        for (id, addr) in nodes {
            clients.insert(*id, QueryClient::new(addr.clone(), self.query_timeout)?);
        }
        *self.clients.write() = clients;
        Ok(())
    }

    pub fn clear(&self) {
        self.clients.write().clear();
    }

    pub fn ids(&self) -> Vec<u64> {
        self.clients.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    fn client(&self, node_id: u64) -> Option<QueryClient> {
        self.clients.read().get(&node_id).cloned()
    }

    fn any_id(&self) -> u64 {
        self.ids()
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or_default()
    }

    pub fn query_all(&self, statement: &str, database: &str) -> mpsc::Receiver<NodeResponse> {
        let targets: Vec<(u64, QueryClient)> = self
            .clients
            .read()
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        debug!(statement, nodes = targets.len(), "Fanning out query");

        for (node_id, client) in targets {
            let tx = tx.clone();
            let statement = statement.to_string();
            let database = database.to_string();
            let timeout = self.query_timeout;
            tokio::spawn(async move {
                let response = run_query(node_id, Some(client), timeout, &statement, &database).await;
                let _ = tx.send(response).await;
            });
        }
        rx
    }

    pub async fn query_any(&self, statement: &str, database: &str) -> NodeResponse {
        let node_id = self.any_id();
        self.query(node_id, statement, database).await
    }

    pub async fn query(&self, node_id: u64, statement: &str, database: &str) -> NodeResponse {
        run_query(
            node_id,
            self.client(node_id),
            self.query_timeout,
            statement,
            database,
        )
        .await
    }

    pub async fn write_any(
        &self,
        database: &str,
        policy: Option<&str>,
        points: &[&str],
    ) -> NodeResponse<()> {
        let node_id = self.any_id();
        self.write(node_id, database, policy, points).await
    }

    pub async fn write(
        &self,
        node_id: u64,
        database: &str,
        policy: Option<&str>,
        points: &[&str],
    ) -> NodeResponse<()> {
        let outcome = async {
            let client = self
                .client(node_id)
                .ok_or_else(|| Error::Query(format!("cannot find client for node {}", node_id)))?;
            let points = parse_points(&points.join("\n"))?;
            tokio::time::timeout(self.query_timeout, client.write(database, policy, &points))
                .await?
        }
        .await;
        NodeResponse { node_id, outcome }
    }
}

async fn run_query(
    node_id: u64,
    client: Option<QueryClient>,
    timeout: Duration,
    statement: &str,
    database: &str,
) -> NodeResponse {
    let outcome = match client {
        Some(client) => tokio::time::timeout(timeout, client.query(statement, database))
            .await
            .map_err(Error::from)
            .and_then(|result| result),
        None => Err(Error::Query(format!(
            "cannot find client for node {}. Possibly cluster stoppage",
            node_id
        ))),
    };
    NodeResponse { node_id, outcome }
}

/// Ask `entry` for `SHOW SERVERS` until at least the expected number of meta and
/// data nodes are listed, backing off exponentially from 50ms.
pub async fn map_servers(
    entry: &QueryClient,
    expected: ClusterInfo,
    timeout: Duration,
) -> Result<CommandResult> {
    let deadline = Instant::now() + timeout;
    let mut backoff = MAP_SERVERS_BACKOFF;

    loop {
        let observed = match entry.query(MAP_SERVERS_STATEMENT, "").await {
            Ok(result) => parse_result(CommandKind::ShowServers, &result),
            Err(e) => Err(e),
        };

        let lagging = match observed {
            Ok(servers)
                if servers.meta_servers.len() >= expected.meta_n
                    && servers.data_servers.len() >= expected.data_n =>
            {
                info!(
                    entry = entry.addr(),
                    meta = servers.meta_servers.len(),
                    data = servers.data_servers.len(),
                    "Mapped cluster servers"
                );
                return Ok(servers);
            }
            Ok(servers) => format!(
                "{} of {} meta nodes, {} of {} data nodes",
                servers.meta_servers.len(),
                expected.meta_n,
                servers.data_servers.len(),
                expected.data_n
            ),
            Err(e) => e.to_string(),
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::NotConverged {
                statement: MAP_SERVERS_STATEMENT.to_string(),
                lagging: vec![format!("{}: {}", entry.addr(), lagging)],
            });
        }
        let delay = backoff.min(deadline - now);
        info!(delay_ms = delay.as_millis() as u64, reason = %lagging, "Retrying server mapping");
        tokio::time::sleep(delay).await;
        backoff = backoff.saturating_mul(2);
    }
}
