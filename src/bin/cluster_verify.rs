//! Cluster verification entry point
//!
//! Starts a local cluster (or attaches to a running one with `--remote`), runs
//! the scenario suite, and exits non-zero if any scenario failed.

use metasync::cluster::{
    Cluster, ClusterOptions, LocalCluster, RemoteCluster, Scenario, Suite,
};
use metasync::telemetry::Telemetry;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Location of the node binary
    #[arg(long, env = "METASYNC_NODE_BIN", default_value = metasync::cluster::DEFAULT_NODE_BINARY)]
    bin: PathBuf,

    /// Number of hybrid nodes in the cluster
    #[arg(long, default_value = "3")]
    hybrid: u32,

    /// Number of meta-only nodes in the cluster
    #[arg(long, default_value = "0")]
    meta: u32,

    /// Number of data-only nodes in the cluster
    #[arg(long, default_value = "0")]
    data: u32,

    /// Pause after a failure until Ctrl+C so the cluster can be inspected
    #[arg(long)]
    inspect: bool,

    /// Query address of a running cluster's entry node; skips spawning
    #[arg(long, env = "METASYNC_REMOTE_ENTRY")]
    remote: Option<String>,

    /// Milliseconds each convergence check may wait; 0 checks once
    #[arg(long, default_value = "5000")]
    settle_ms: u64,

    /// Iterations of the stress scenarios
    #[arg(long, default_value = "100")]
    iterations: usize,

    /// Only run these scenarios (repeatable)
    #[arg(long = "scenario")]
    scenarios: Vec<String>,

    /// Per-query timeout in seconds
    #[arg(long, default_value = "10")]
    query_timeout_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _telemetry = match Telemetry::init_for_component("metasync-cluster-verify", &args.log_level)
    {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Cluster verification aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let scenarios = if args.scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        args.scenarios
            .iter()
            .map(|name| name.parse::<Scenario>())
            .collect::<Result<Vec<_>, _>>()?
    };
    let query_timeout = Duration::from_secs(args.query_timeout_secs);

    let cluster: Arc<dyn Cluster> = match &args.remote {
        Some(entry) => Arc::new(RemoteCluster::new(entry.clone(), query_timeout)?),
        None => Arc::new(
            LocalCluster::new(ClusterOptions {
                bin_path: args.bin.clone(),
                hybrid: args.hybrid,
                meta: args.meta,
                data: args.data,
                query_timeout,
                ..ClusterOptions::default()
            })
            .context("invalid cluster layout")?,
        ),
    };

    if let Err(e) = cluster.start().await {
        cluster.stop().await?;
        return Err(e).context("cluster failed to start");
    }
    info!(info = ?cluster.info(), "Cluster started");

    let suite = Suite::with_settings(
        cluster.clone(),
        Duration::from_millis(args.settle_ms),
        args.iterations,
    );
    let reports = suite.run(&scenarios).await;

    let failed = reports.iter().filter(|r| r.outcome.is_failed()).count();
    for report in &reports {
        println!(
            "{:<32} {:>8.2}s  {}",
            report.scenario.name(),
            report.elapsed.as_secs_f64(),
            report.outcome
        );
    }
    println!("{} scenarios, {} failed", reports.len(), failed);

    if failed > 0 && args.inspect {
        println!("Pausing for inspection. Press Ctrl+C to exit.");
        signal::ctrl_c().await?;
        println!("Interrupt received. Shutting down.");
    }
    cluster.stop().await?;
    Ok(failed == 0)
}
