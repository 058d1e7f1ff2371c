//! Query latency profiler
//!
//! Runs each `[[query]]` of a TOML profile against one node and prints mean,
//! standard deviation, median, and points per second.

use metasync::cluster::QueryClient;
use metasync::profile::{run_profile, Profile};
use metasync::telemetry::Telemetry;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Profile file
    #[arg(long, default_value = "demos/query_profile.toml")]
    profile: PathBuf,

    /// Node address; overrides the profile's `address`
    #[arg(long, env = "METASYNC_QUERY_ADDR")]
    addr: Option<String>,

    /// Per-query timeout in seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = Telemetry::init_for_component("metasync-query-profile", &args.log_level)?;

    let profile = Profile::load(&args.profile)
        .await
        .with_context(|| format!("loading profile {}", args.profile.display()))?;
    let addr = args.addr.unwrap_or_else(|| profile.address.clone());
    let client = QueryClient::new(addr, Duration::from_secs(args.timeout_secs))?;
    info!(addr = client.addr(), queries = profile.queries.len(), "Profiling");

    for stats in run_profile(&client, &profile).await {
        println!("{}", stats.report());
    }
    Ok(())
}
