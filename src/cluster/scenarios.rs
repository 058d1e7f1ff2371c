//! Scenario catalogue
//!
//! Every scenario follows the same shape: create an object through one node,
//! wait until every data node reports it, mutate it, and wait until every data
//! node reports the mutation. Scenarios run concurrently, each against its own
//! uniquely named database.

use super::converge::{converge, converge_paths, Probe};
use super::results::{CommandKind, RetentionPolicyRow};
use super::{Cluster, DatabaseOptions};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ITERATIONS: usize = 100;

const ONE_HOUR: Duration = Duration::from_secs(3600);

/// Result of one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Skipped(String),
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("passed"),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scenario {
    ShowDropDatabase,
    DropDatabaseLocal,
    DropMeasurement,
    ShowMeasurements,
    DropSeries,
    ShowSeries,
    ShowTagKeys,
    ShowTagValues,
    ShowFieldKeys,
    ShowRetentionPolicies,
    DropRetentionPolicyLocal,
    CreateDropDatabase,
    WriteDropShard,
}

impl Scenario {
    pub const ALL: [Scenario; 13] = [
        Scenario::ShowDropDatabase,
        Scenario::DropDatabaseLocal,
        Scenario::DropMeasurement,
        Scenario::ShowMeasurements,
        Scenario::DropSeries,
        Scenario::ShowSeries,
        Scenario::ShowTagKeys,
        Scenario::ShowTagValues,
        Scenario::ShowFieldKeys,
        Scenario::ShowRetentionPolicies,
        Scenario::DropRetentionPolicyLocal,
        Scenario::CreateDropDatabase,
        Scenario::WriteDropShard,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::ShowDropDatabase => "show_drop_database",
            Scenario::DropDatabaseLocal => "drop_database_local",
            Scenario::DropMeasurement => "drop_measurement",
            Scenario::ShowMeasurements => "show_measurements",
            Scenario::DropSeries => "drop_series",
            Scenario::ShowSeries => "show_series",
            Scenario::ShowTagKeys => "show_tag_keys",
            Scenario::ShowTagValues => "show_tag_values",
            Scenario::ShowFieldKeys => "show_field_keys",
            Scenario::ShowRetentionPolicies => "show_retention_policies",
            Scenario::DropRetentionPolicyLocal => "drop_retention_policy_local",
            Scenario::CreateDropDatabase => "create_drop_database",
            Scenario::WriteDropShard => "write_drop_shard",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let wanted = value.trim().to_ascii_lowercase().replace('-', "_");
        Scenario::ALL
            .iter()
            .copied()
            .find(|scenario| scenario.name() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown scenario {:?}", value)))
    }
}

struct Context {
    cluster: Arc<dyn Cluster>,
    settle_timeout: Duration,
    iterations: usize,
}

/// Runs scenarios against a started cluster
#[derive(Clone)]
pub struct Suite {
    context: Arc<Context>,
}

impl Suite {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self::with_settings(cluster, DEFAULT_SETTLE_TIMEOUT, DEFAULT_ITERATIONS)
    }

    /// `settle_timeout` bounds every convergence wait; zero checks once.
    pub fn with_settings(cluster: Arc<dyn Cluster>, settle_timeout: Duration, iterations: usize) -> Self {
        Self {
            context: Arc::new(Context {
                cluster,
                settle_timeout,
                iterations,
            }),
        }
    }

    pub async fn run_all(&self) -> Vec<ScenarioReport> {
        self.run(&Scenario::ALL).await
    }

    /// Run `scenarios` concurrently. Reports come back in catalogue order.
    pub async fn run(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        let mut tasks = JoinSet::new();
        for scenario in scenarios.iter().copied() {
            let context = self.context.clone();
            tasks.spawn(async move { run_one(&context, scenario).await });
        }

        let mut reports = Vec::with_capacity(scenarios.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Scenario task panicked"),
            }
        }
        reports.sort_by_key(|report| report.scenario);
        reports
    }

    pub async fn run_one(&self, scenario: Scenario) -> ScenarioReport {
        run_one(&self.context, scenario).await
    }
}

async fn run_one(context: &Context, scenario: Scenario) -> ScenarioReport {
    let started = Instant::now();
    let outcome = match execute(context, scenario).await {
        Ok(outcome) => outcome,
        Err(e) => Outcome::Failed(e.to_string()),
    };
    let elapsed = started.elapsed();

    match &outcome {
        Outcome::Failed(reason) => {
            warn!(scenario = scenario.name(), reason = %reason, "Scenario failed")
        }
        outcome => info!(
            scenario = scenario.name(),
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Scenario finished"
        ),
    }
    ScenarioReport {
        scenario,
        outcome,
        elapsed,
    }
}

async fn execute(ctx: &Context, scenario: Scenario) -> Result<Outcome> {
    match scenario {
        Scenario::ShowDropDatabase => show_drop_database(ctx).await,
        Scenario::DropDatabaseLocal => drop_database_local(ctx).await,
        Scenario::DropMeasurement => drop_measurement(ctx).await,
        Scenario::ShowMeasurements => show_measurements(ctx).await,
        Scenario::DropSeries => drop_series(ctx).await,
        Scenario::ShowSeries => show_series(ctx).await,
        Scenario::ShowTagKeys => show_tag_keys(ctx).await,
        Scenario::ShowTagValues => show_tag_values(ctx).await,
        Scenario::ShowFieldKeys => show_field_keys(ctx).await,
        Scenario::ShowRetentionPolicies => show_retention_policies(ctx).await,
        Scenario::DropRetentionPolicyLocal => drop_retention_policy_local(ctx).await,
        Scenario::CreateDropDatabase => create_drop_database(ctx).await,
        Scenario::WriteDropShard => write_drop_shard(ctx).await,
    }
}

fn single_replica() -> DatabaseOptions {
    DatabaseOptions::default().with_default_rp(ONE_HOUR, 1)
}

async fn run_statement(ctx: &Context, statement: &str, database: &str) -> Result<()> {
    ctx.cluster
        .query_any(statement, database)
        .await
        .into_result()
        .map(|_| ())
}

async fn write(ctx: &Context, database: &str, policy: Option<&str>, points: &[&str]) -> Result<()> {
    ctx.cluster
        .write_any(database, policy, points)
        .await
        .into_result()
}

async fn show_drop_database(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(DatabaseOptions::default()).await?;

    converge(cluster, &Probe::show_databases(), ctx.settle_timeout, |r| {
        r.has_database(&db)
    })
    .await?;

    run_statement(ctx, &format!("DROP DATABASE {:?}", db), "").await?;
    converge(cluster, &Probe::show_databases(), ctx.settle_timeout, |r| {
        !r.has_database(&db)
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn drop_database_local(ctx: &Context) -> Result<Outcome> {
    let dirs = ctx.cluster.data_dirs();
    if dirs.is_empty() {
        return Ok(Outcome::Skipped(
            "data directories are not visible from this host".to_string(),
        ));
    }
    let data_n = ctx.cluster.info().data_n;
    let db = ctx.cluster.new_database(DatabaseOptions::default()).await?;
    write(ctx, &db, None, &["cpu value=1"]).await?;

    converge_paths(&dirs, &db, data_n, ctx.settle_timeout).await?;
    run_statement(ctx, &format!("DROP DATABASE {:?}", db), "").await?;
    converge_paths(&dirs, &db, 0, ctx.settle_timeout).await?;
    Ok(Outcome::Passed)
}

async fn drop_measurement(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(DatabaseOptions::default()).await?;
    write(ctx, &db, None, &["cpu value=1"]).await?;

    let probe = Probe::show_measurements(&db);
    converge(cluster, &probe, ctx.settle_timeout, |r| r.has_measurement("cpu")).await?;

    run_statement(ctx, "DROP MEASUREMENT \"cpu\"", &db).await?;
    converge(cluster, &probe, ctx.settle_timeout, |r| !r.has_measurement("cpu")).await?;
    Ok(Outcome::Passed)
}

/// A point stored on one node must still be listed by every node.
async fn show_measurements(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(single_replica()).await?;
    write(ctx, &db, None, &["cpu value=1"]).await?;

    converge(cluster, &Probe::show_measurements(&db), ctx.settle_timeout, |r| {
        r.has_measurement("cpu")
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn drop_series(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(DatabaseOptions::default()).await?;
    write(
        ctx,
        &db,
        None,
        &["cpu,foo=bar value=1", "cpu value=20", "other_measure value=2"],
    )
    .await?;

    let probe = Probe::show_series(&db);
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        r.has_series_for_measurement("cpu")
    })
    .await?;

    run_statement(ctx, "DROP SERIES FROM \"cpu\"", &db).await?;
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        !r.has_series_for_measurement("cpu") && r.has_series_for_measurement("other_measure")
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn show_series(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(single_replica()).await?;
    write(ctx, &db, None, &["cpu value=1"]).await?;

    converge(cluster, &Probe::show_series(&db), ctx.settle_timeout, |r| {
        r.has_series_for_measurement("cpu")
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn show_tag_keys(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(single_replica()).await?;
    write(ctx, &db, None, &["cpu,foo=bar,zah=zoo value=1", "memory,a=b value=20"]).await?;

    let probe = Probe::new("SHOW TAG KEYS", db.as_str(), CommandKind::ShowTagKeys);
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        r.has_tag_keys("cpu", &["foo", "zah"]) && r.has_tag_keys("memory", &["a"])
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn show_tag_values(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(single_replica()).await?;
    write(
        ctx,
        &db,
        None,
        &[
            "cpu,foo=bar,zah=zoo value=1",
            "cpu,foo=foo value=3",
            "memory,a=b,foo=zoo value=20",
        ],
    )
    .await?;

    let probe = Probe::new(
        "SHOW TAG VALUES WITH KEY = \"foo\"",
        db.as_str(),
        CommandKind::ShowTagValues,
    );
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        r.has_tag_values("cpu", &["bar", "foo"]) && r.has_tag_values("memory", &["zoo"])
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn show_field_keys(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let db = cluster.new_database(single_replica()).await?;
    write(ctx, &db, None, &["cpu value=1,boo=\"zoo\"", "memory,a=b power=20"]).await?;

    let probe = Probe::new("SHOW FIELD KEYS", db.as_str(), CommandKind::ShowFieldKeys);
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        r.has_field_keys("cpu", &["value", "boo"]) && r.has_field_keys("memory", &["power"])
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn show_retention_policies(ctx: &Context) -> Result<Outcome> {
    let cluster = ctx.cluster.as_ref();
    let replica_n = cluster.info().data_n as u64;
    let db = cluster
        .new_database(DatabaseOptions::default().with_rp("rp0", ONE_HOUR, replica_n))
        .await?;

    let expected = RetentionPolicyRow::new("rp0", ONE_HOUR, replica_n, false);
    let probe = Probe::new(
        format!("SHOW RETENTION POLICIES ON {:?}", db),
        db.as_str(),
        CommandKind::ShowRetentionPolicies,
    );
    converge(cluster, &probe, ctx.settle_timeout, |r| {
        r.has_retention_policy(&expected)
    })
    .await?;
    Ok(Outcome::Passed)
}

async fn drop_retention_policy_local(ctx: &Context) -> Result<Outcome> {
    let dirs = ctx.cluster.data_dirs();
    if dirs.is_empty() {
        return Ok(Outcome::Skipped(
            "data directories are not visible from this host".to_string(),
        ));
    }
    let data_n = ctx.cluster.info().data_n;
    let db = ctx
        .cluster
        .new_database(DatabaseOptions::default().with_rp("rp0", ONE_HOUR, data_n as u64))
        .await?;

    run_statement(ctx, &format!("ALTER RETENTION POLICY \"rp0\" ON {:?} DEFAULT", db), &db).await?;
    write(ctx, &db, Some("rp0"), &["cpu value=1"]).await?;

    let path = format!("{}/rp0", db);
    converge_paths(&dirs, &path, data_n, ctx.settle_timeout).await?;
    run_statement(ctx, &format!("DROP RETENTION POLICY \"rp0\" ON {:?}", db), &db).await?;
    converge_paths(&dirs, &path, 0, ctx.settle_timeout).await?;
    Ok(Outcome::Passed)
}

/// Repeated create/drop of one name must never error and leave nothing behind.
async fn create_drop_database(ctx: &Context) -> Result<Outcome> {
    let db = uuid::Uuid::new_v4().to_string();
    for _ in 0..ctx.iterations {
        run_statement(ctx, &format!("CREATE DATABASE {:?}", db), "").await?;
        run_statement(ctx, &format!("DROP DATABASE {:?}", db), "").await?;
    }

    converge(
        ctx.cluster.as_ref(),
        &Probe::show_databases(),
        ctx.settle_timeout,
        |r| !r.has_database(&db),
    )
    .await?;
    Ok(Outcome::Passed)
}

/// Writes into a shard while it is dropped concurrently, many times over.
async fn write_drop_shard(ctx: &Context) -> Result<Outcome> {
    let db = ctx.cluster.new_database(DatabaseOptions::default()).await?;
    write(ctx, &db, None, &["cpu value=1"]).await?;

    let probe = Probe::new("SHOW SHARDS", "", CommandKind::ShowShards);
    let views = converge(ctx.cluster.as_ref(), &probe, ctx.settle_timeout, |r| {
        !r.shards_for_db(&db).is_empty()
    })
    .await?;
    let Some((_, shards)) = views.first() else {
        return Ok(Outcome::Failed("no data node listed shards".to_string()));
    };
    let owned = shards.shards_for_db(&db);
    if owned.len() != 1 {
        return Ok(Outcome::Failed(format!(
            "{} shards but expected 1",
            owned.len()
        )));
    }
    let shard_id = owned[0].id;

    let writes = async {
        for _ in 0..ctx.iterations {
            write(ctx, &db, None, &["cpu value=1"]).await?;
        }
        Ok::<_, Error>(())
    };
    let drops = async {
        let statement = format!("DROP SHARD {}", shard_id);
        for _ in 0..ctx.iterations * 10 {
            run_statement(ctx, &statement, "").await?;
        }
        Ok::<_, Error>(())
    };
    tokio::try_join!(writes, drops)?;
    Ok(Outcome::Passed)
}
