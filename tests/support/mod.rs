//! In-process metadata authority and mock data nodes.
//!
//! Each mock node owns a real [`MetaClient`] polling the authority over HTTP
//! and answers the query-interface statements the cluster harness sends.
//! Meta statements go through the client's statement executor; series data
//! lives in one store shared by every node.

#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use metasync::api;
use metasync::cluster::{parse_points, Cluster, Point, RemoteCluster};
use metasync::config::MetaClientConfig;
use metasync::duration::parse_duration;
use metasync::meta::data::DEFAULT_RETENTION_POLICY_NAME;
use metasync::meta::{
    MemoryStore, MetaClient, RetentionPolicySpec, RetentionPolicyUpdate, Statement, StoreConfig,
};
use metasync::protocol::{Response, Row, StatementResult};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const LONG_POLL: Duration = Duration::from_millis(250);
const WRITE_METADATA_WAIT: Duration = Duration::from_secs(2);

/// Loopback address that nothing is listening on at the time of the call.
pub async fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Metadata authority on an ephemeral port
pub struct MetaServer {
    pub addr: String,
    pub store: Arc<MemoryStore>,
    shutdown: CancellationToken,
}

impl MetaServer {
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0").await
    }

    pub async fn start_on(addr: &str) -> Self {
        let store = Arc::new(MemoryStore::new(StoreConfig {
            long_poll_timeout: LONG_POLL,
        }));
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(api::serve(listener, store.clone(), shutdown.clone()));
        Self {
            addr,
            store,
            shutdown,
        }
    }

    pub fn client_config(&self) -> MetaClientConfig {
        let mut config = MetaClientConfig::new(vec![self.addr.clone()]);
        config.password_hash_cost = 4;
        config
    }

    /// Opened client of this authority.
    pub async fn client(&self) -> Arc<MetaClient> {
        let client = Arc::new(MetaClient::new(self.client_config()).unwrap());
        client.open().await.unwrap();
        client
    }
}

impl Drop for MetaServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Default)]
struct Measurement {
    series: BTreeSet<String>,
    tags: BTreeMap<String, BTreeSet<String>>,
    fields: BTreeSet<String>,
}

/// Series index shared by the mock nodes, keyed by database then measurement
#[derive(Default)]
pub struct SeriesStore {
    databases: Mutex<BTreeMap<String, BTreeMap<String, Measurement>>>,
}

impl SeriesStore {
    fn write(&self, database: &str, points: &[Point]) {
        let mut databases = self.databases.lock();
        let measurements = databases.entry(database.to_string()).or_default();
        for point in points {
            let m = measurements.entry(point.measurement.clone()).or_default();
            m.series.insert(point.series_key());
            for (k, v) in &point.tags {
                m.tags.entry(k.clone()).or_default().insert(v.clone());
            }
            m.fields.extend(point.fields.keys().cloned());
        }
    }

    fn drop_database(&self, database: &str) {
        self.databases.lock().remove(database);
    }

    fn drop_measurement(&self, database: &str, measurement: &str) {
        if let Some(measurements) = self.databases.lock().get_mut(database) {
            measurements.remove(measurement);
        }
    }

    /// One row per measurement, built by `render`; `None` skips the measurement.
    fn rows<F>(&self, database: &str, render: F) -> Vec<Row>
    where
        F: Fn(&str, &Measurement) -> Option<Row>,
    {
        self.databases
            .lock()
            .get(database)
            .map(|measurements| {
                measurements
                    .iter()
                    .filter_map(|(name, m)| render(name, m))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn show_measurements(&self, database: &str) -> Vec<Row> {
        let databases = self.databases.lock();
        match databases.get(database) {
            Some(measurements) if !measurements.is_empty() => {
                vec![single_column("measurements", "name", measurements.keys())]
            }
            _ => Vec::new(),
        }
    }
}

fn single_column<'a>(name: &str, column: &str, values: impl Iterator<Item = &'a String>) -> Row {
    let mut row = Row::new(name, &[column]);
    for value in values {
        row.push(vec![json!(value)]);
    }
    row
}

#[derive(Clone)]
struct NodeState {
    client: Arc<MetaClient>,
    series: Arc<SeriesStore>,
}

/// A data node answering `/query`, `/write` and `/ping`
pub struct MockNode {
    pub addr: String,
    pub client: Arc<MetaClient>,
    shutdown: CancellationToken,
}

impl MockNode {
    pub async fn start(meta: &MetaServer, series: Arc<SeriesStore>) -> Self {
        let client = meta.client().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        client.create_data_node(&addr, &addr).await.unwrap();

        let router = Router::new()
            .route("/query", get(query))
            .route("/write", post(write))
            .route("/ping", get(ping))
            .with_state(NodeState {
                client: client.clone(),
                series,
            });
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        Self {
            addr,
            client,
            shutdown,
        }
    }

    /// Stop following the authority; the node keeps answering from its last snapshot.
    pub fn freeze(&self) {
        self.client.close();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Authority plus `n` mock data nodes
pub struct MockCluster {
    pub meta: MetaServer,
    pub nodes: Vec<MockNode>,
    pub series: Arc<SeriesStore>,
}

impl MockCluster {
    pub async fn start(n: usize) -> Self {
        let meta = MetaServer::start().await;
        let series = Arc::new(SeriesStore::default());
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(MockNode::start(&meta, series.clone()).await);
        }
        Self {
            meta,
            nodes,
            series,
        }
    }

    pub fn entry_addr(&self) -> &str {
        &self.nodes[0].addr
    }

    /// Started harness view of this cluster.
    pub async fn remote(&self) -> Arc<RemoteCluster> {
        let cluster = RemoteCluster::new(self.entry_addr(), Duration::from_secs(5))
            .unwrap()
            .with_expected(0, self.nodes.len())
            .with_start_timeout(Duration::from_secs(5));
        cluster.start().await.unwrap();
        Arc::new(cluster)
    }
}

#[derive(Deserialize)]
struct QueryParams {
    q: String,
    #[serde(default)]
    db: String,
}

async fn query(State(state): State<NodeState>, Query(params): Query<QueryParams>) -> Json<Response> {
    let result = match execute(&state, &params.q, &params.db).await {
        Ok(rows) => StatementResult::with_rows(rows),
        Err(message) => StatementResult::with_error(message),
    };
    Json(Response::single(result))
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct WriteParams {
    db: String,
    rp: Option<String>,
}

async fn write(
    State(state): State<NodeState>,
    Query(params): Query<WriteParams>,
    body: String,
) -> HttpResponse {
    match write_points(&state, &params, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(message) => (StatusCode::BAD_REQUEST, Json(Response::failed(message))).into_response(),
    }
}

async fn write_points(state: &NodeState, params: &WriteParams, body: &str) -> Result<(), String> {
    let points = parse_points(body).map_err(|e| e.to_string())?;
    let policy = wait_for_policy(&state.client, &params.db, params.rp.as_deref()).await?;
    state
        .client
        .create_shard_group_if_not_exists(&params.db, &policy, Utc::now())
        .await
        .map_err(|e| e.to_string())?;
    state.series.write(&params.db, &points);
    Ok(())
}

/// Resolve the target policy, giving this node's cache a moment to catch up.
async fn wait_for_policy(
    client: &MetaClient,
    database: &str,
    policy: Option<&str>,
) -> Result<String, String> {
    let deadline = Instant::now() + WRITE_METADATA_WAIT;
    loop {
        let gate = client.wait_for_data_changed();
        if let Some(db) = client.database(database) {
            let name = policy
                .map(str::to_string)
                .unwrap_or_else(|| db.default_retention_policy.clone());
            if db.retention_policy(&name).is_some() {
                return Ok(name);
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("database not found: {}", database));
        }
        gate.wait_timeout(remaining).await;
    }
}

/// Split on whitespace, keeping double-quoted identifiers whole and unquoted.
fn tokenize(statement: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in statement.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

async fn execute(state: &NodeState, statement: &str, database: &str) -> Result<Vec<Row>, String> {
    let words = tokenize(statement);
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
    let keywords: Vec<&str> = upper.iter().map(String::as_str).collect();
    let series = &state.series;

    match keywords.as_slice() {
        ["SHOW", "MEASUREMENTS"] => Ok(series.show_measurements(database)),
        ["SHOW", "SERIES"] => Ok(series.rows(database, |name, m| {
            Some(single_column(name, "_key", m.series.iter()))
        })),
        ["SHOW", "TAG", "KEYS"] => Ok(series.rows(database, |name, m| {
            (!m.tags.is_empty()).then(|| single_column(name, "tagKey", m.tags.keys()))
        })),
        ["SHOW", "TAG", "VALUES", "WITH", "KEY", "=", _] => {
            let key = words[6].clone();
            Ok(series.rows(database, |name, m| {
                let values = m.tags.get(&key)?;
                let mut row = Row::new(name, &["key", "value"]);
                for value in values {
                    row.push(vec![json!(key), json!(value)]);
                }
                Some(row)
            }))
        }
        ["SHOW", "FIELD", "KEYS"] => Ok(series.rows(database, |name, m| {
            Some(single_column(name, "fieldKey", m.fields.iter()))
        })),
        ["DROP", "MEASUREMENT", _] | ["DROP", "SERIES", "FROM", _] => {
            if let Some(measurement) = words.last() {
                series.drop_measurement(database, measurement);
            }
            Ok(Vec::new())
        }
        ["DROP", "SHARD", id] => {
            id.parse::<u64>()
                .map_err(|_| format!("invalid shard id: {}", id))?;
            Ok(Vec::new())
        }
        _ => {
            let statement = meta_statement(&words, &keywords)?;
            let dropped = match &statement {
                Statement::DropDatabase { name } => Some(name.clone()),
                _ => None,
            };
            let result = state.client.execute_statement(statement).await;
            if let Some(error) = result.error {
                return Err(error);
            }
            if let Some(name) = dropped {
                series.drop_database(&name);
            }
            Ok(result.series)
        }
    }
}

fn meta_statement(words: &[String], keywords: &[&str]) -> Result<Statement, String> {
    let duration = |raw: &str| parse_duration(raw).map_err(|e| e.to_string());
    let replica = |raw: &str| {
        raw.parse::<u32>()
            .map_err(|_| format!("invalid replication factor: {}", raw))
    };

    let statement = match keywords {
        ["CREATE", "DATABASE", _] => Statement::CreateDatabase {
            name: words[2].clone(),
            retention_policy: None,
        },
        ["CREATE", "DATABASE", _, "WITH", "DURATION", _, "REPLICATION", _] => {
            Statement::CreateDatabase {
                name: words[2].clone(),
                retention_policy: Some(
                    RetentionPolicySpec::new(DEFAULT_RETENTION_POLICY_NAME)
                        .with_duration(duration(&words[5])?)
                        .with_replica_n(replica(&words[7])?),
                ),
            }
        }
        ["DROP", "DATABASE", _] => Statement::DropDatabase {
            name: words[2].clone(),
        },
        ["SHOW", "DATABASES"] => Statement::ShowDatabases,
        ["CREATE", "RETENTION", "POLICY", _, "ON", _, "DURATION", _, "REPLICATION", _, rest @ ..] => {
            Statement::CreateRetentionPolicy {
                database: words[5].clone(),
                policy: RetentionPolicySpec::new(words[3].clone())
                    .with_duration(duration(&words[7])?)
                    .with_replica_n(replica(&words[9])?),
                default: matches!(rest, ["DEFAULT"]),
            }
        }
        ["ALTER", "RETENTION", "POLICY", _, "ON", _, "DEFAULT"] => Statement::AlterRetentionPolicy {
            database: words[5].clone(),
            name: words[3].clone(),
            update: RetentionPolicyUpdate::default(),
            default: true,
        },
        ["DROP", "RETENTION", "POLICY", _, "ON", _] => Statement::DropRetentionPolicy {
            database: words[5].clone(),
            name: words[3].clone(),
        },
        ["SHOW", "RETENTION", "POLICIES", "ON", _] => Statement::ShowRetentionPolicies {
            database: words[4].clone(),
        },
        ["SHOW", "SERVERS"] => Statement::ShowServers,
        ["SHOW", "SHARDS"] => Statement::ShowShards,
        _ => return Err(format!("unsupported statement: {}", words.join(" "))),
    };
    Ok(statement)
}
