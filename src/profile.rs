//! Query latency profiling
//!
//! A profile is a TOML file of queries, each run a number of times:
//!
//! ```toml
//! [[query]]
//! statement = "SELECT count(value) FROM cpu"
//! database = "stress"
//! runs = 10
//! point_count = 100000
//! ```
//!
//! Every run is timed whether or not the node answers successfully.

use crate::cluster::QueryClient;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_ADDRESS: &str = "localhost:8086";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(rename = "query", default)]
    pub queries: Vec<QuerySpec>,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuerySpec {
    pub statement: String,
    #[serde(default = "default_runs")]
    pub runs: usize,
    #[serde(default)]
    pub database: String,
    /// Points the statement scans; enables the points-per-second figure.
    #[serde(default)]
    pub point_count: u64,
}

fn default_runs() -> usize {
    1
}

impl Profile {
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("cannot read profile {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }
}

/// Timings of one profiled statement
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStats {
    pub statement: String,
    pub responses: usize,
    pub failures: usize,
    pub mean: Duration,
    pub median: Duration,
    pub stddev: Duration,
    pub points_per_sec: Option<u64>,
}

impl QueryStats {
    /// Summarize `durations`. No samples gives zero timings.
    pub fn from_durations(spec: &QuerySpec, durations: &[Duration], failures: usize) -> Self {
        let n = durations.len() as f64;
        let nanos: Vec<f64> = durations.iter().map(|d| d.as_nanos() as f64).collect();

        let (mean, median, stddev) = if nanos.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let mean = nanos.iter().sum::<f64>() / n;
            let mut sorted = nanos.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let median = sorted[sorted.len() / 2];
            let variance = nanos.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
            (mean, median, variance.sqrt())
        };

        let mean = Duration::from_nanos(mean as u64);
        let points_per_sec = (spec.point_count != 0 && !mean.is_zero())
            .then(|| (spec.point_count as f64 / mean.as_secs_f64()) as u64);

        Self {
            statement: spec.statement.clone(),
            responses: durations.len(),
            failures,
            mean,
            median: Duration::from_nanos(median as u64),
            stddev: Duration::from_nanos(stddev as u64),
            points_per_sec,
        }
    }

    /// Human-readable report block.
    pub fn report(&self) -> String {
        let mut out = format!(
            "{}\nAverage Response Time: {:?}\nStandard Deviation: {:?}\nMedian Response Time: {:?}\n",
            self.statement, self.mean, self.stddev, self.median
        );
        if let Some(pps) = self.points_per_sec {
            out.push_str(&format!("Points Per Second: {}\n", pps));
        }
        if self.failures > 0 {
            out.push_str(&format!("Failed Runs: {} of {}\n", self.failures, self.responses));
        }
        out
    }
}

/// Run every query in `profile` sequentially against `client`.
pub async fn run_profile(client: &QueryClient, profile: &Profile) -> Vec<QueryStats> {
    let mut stats = Vec::with_capacity(profile.queries.len());
    for spec in &profile.queries {
        let mut durations = Vec::with_capacity(spec.runs);
        let mut failures = 0;
        for run in 0..spec.runs {
            let started = Instant::now();
            let outcome = client.query(&spec.statement, &spec.database).await;
            durations.push(started.elapsed());
            if let Err(e) = outcome {
                failures += 1;
                warn!(statement = %spec.statement, run, error = %e, "Profiled query failed");
            }
        }
        debug!(statement = %spec.statement, runs = spec.runs, "Profiled query");
        stats.push(QueryStats::from_durations(spec, &durations, failures));
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(point_count: u64) -> QuerySpec {
        QuerySpec {
            statement: "SELECT * FROM cpu".to_string(),
            runs: 3,
            database: "db0".to_string(),
            point_count,
        }
    }

    #[test]
    fn test_parse_profile() {
        let profile = Profile::parse(
            r#"
            [[query]]
            statement = "SELECT count(value) FROM cpu"
            database = "stress"
            runs = 10
            point_count = 1000

            [[query]]
            statement = "SHOW DATABASES"
            "#,
        )
        .unwrap();
        assert_eq!(profile.address, DEFAULT_ADDRESS);
        assert_eq!(profile.queries.len(), 2);
        assert_eq!(profile.queries[0].runs, 10);
        assert_eq!(profile.queries[1].runs, 1);
        assert_eq!(profile.queries[1].database, "");
    }

    #[test]
    fn test_statistics() {
        let durations = [
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ];
        let stats = QueryStats::from_durations(&spec(1000), &durations, 1);
        assert_eq!(stats.mean, Duration::from_millis(20));
        assert_eq!(stats.median, Duration::from_millis(20));
        let stddev_ms = stats.stddev.as_secs_f64() * 1000.0;
        assert!((stddev_ms - 8.1649).abs() < 0.01);
        let pps = stats.points_per_sec.unwrap();
        assert!((49_999..=50_000).contains(&pps));
        assert!(stats.report().contains("Failed Runs: 1 of 3"));
    }

    #[test]
    fn test_no_samples_gives_zero_timings() {
        let stats = QueryStats::from_durations(&spec(1000), &[], 0);
        assert_eq!(stats.mean, Duration::ZERO);
        assert_eq!(stats.points_per_sec, None);
        assert!(!stats.report().contains("Points Per Second"));
    }
}
