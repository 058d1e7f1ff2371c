//! Waiting for every node to agree
//!
//! Propagation from the metadata authority to data nodes is asynchronous, so a
//! check made right after a mutation may race it. [`converge`] repeats the
//! probe until every node passes or the deadline is reached. A zero timeout
//! probes exactly once.

use super::results::{CommandKind, CommandResult};
use super::Cluster;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Introspective query issued to every data node
#[derive(Debug, Clone)]
pub struct Probe {
    pub statement: String,
    pub database: String,
    pub kind: CommandKind,
}

impl Probe {
    pub fn new(statement: impl Into<String>, database: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            statement: statement.into(),
            database: database.into(),
            kind,
        }
    }

    pub fn show_databases() -> Self {
        Self::new("SHOW DATABASES", "", CommandKind::ShowDatabases)
    }

    pub fn show_measurements(database: &str) -> Self {
        Self::new("SHOW MEASUREMENTS", database, CommandKind::ShowMeasurements)
    }

    pub fn show_series(database: &str) -> Self {
        Self::new("SHOW SERIES", database, CommandKind::ShowSeries)
    }
}

/// Reported as the lagging entry when a round reaches no data node.
pub const NO_NODES_ANSWERED: &str = "no data nodes answered";

/// Run `probe` on every data node until `predicate` holds for all of them.
///
/// Returns each node's parsed result from the passing round, ordered by node id.
pub async fn converge<C, F>(
    cluster: &C,
    probe: &Probe,
    timeout: Duration,
    predicate: F,
) -> Result<Vec<(u64, CommandResult)>>
where
    C: Cluster + ?Sized,
    F: Fn(&CommandResult) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;
    let mut round = 0u32;

    loop {
        round += 1;
        let mut passed = Vec::new();
        let mut lagging = Vec::new();

        let mut responses = cluster.query_all(&probe.statement, &probe.database);
        while let Some(response) = responses.recv().await {
            match response.parse(probe.kind) {
                Ok(result) if predicate(&result) => passed.push((response.node_id, result)),
                Ok(_) => lagging.push(format!("node {}", response.node_id)),
                Err(e) => lagging.push(format!("node {}: {}", response.node_id, e)),
            }
        }

        if passed.is_empty() && lagging.is_empty() {
            lagging.push(NO_NODES_ANSWERED.to_string());
        }

        if lagging.is_empty() {
            passed.sort_by_key(|(node_id, _)| *node_id);
            debug!(statement = %probe.statement, rounds = round, "Nodes converged");
            return Ok(passed);
        }

        let now = Instant::now();
        if now >= deadline {
            lagging.sort();
            return Err(Error::NotConverged {
                statement: probe.statement.clone(),
                lagging,
            });
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Count the directories under which `relative` exists.
pub async fn nodes_having_path(dirs: &[PathBuf], relative: &str) -> Result<usize> {
    let mut count = 0;
    for dir in dirs {
        if tokio::fs::try_exists(dir.join(relative)).await? {
            count += 1;
        }
    }
    Ok(count)
}

/// Wait until exactly `expected` of `dirs` contain `relative`.
pub async fn converge_paths(
    dirs: &[PathBuf],
    relative: &str,
    expected: usize,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let got = nodes_having_path(dirs, relative).await?;
        if got == expected {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::NotConverged {
                statement: format!("path {}", relative),
                lagging: vec![format!(
                    "{} nodes have the path on disk, expected {}",
                    got, expected
                )],
            });
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
