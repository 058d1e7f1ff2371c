//! # metasync
//!
//! Cluster metadata replication for a distributed time-series database.
//!
//! Every node keeps a local, read-mostly copy of the cluster metadata
//! (databases, retention policies, shard groups, users, nodes). Reads are
//! answered from that copy; mutations are sent to the metadata authority and
//! the caller waits until the resulting snapshot has been propagated back.
//!
//! ## Components
//!
//! - **meta**: snapshot model, command set, the cache with its poller and
//!   submitter, the [`meta::MetaClient`] facade, and an in-memory authority
//! - **api**: the HTTP surface of the authority (`GET /`, `POST /execute`)
//! - **cluster**: a harness that spawns or attaches to a cluster and checks
//!   that metadata changes converge on every node
//! - **profile**: query latency profiling against a single node

pub mod api;
pub mod cluster;
pub mod config;
pub mod duration;
pub mod meta;
pub mod profile;
pub mod protocol;
pub mod telemetry;

mod error;

pub use error::{Error, Missing, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{Cluster, ClusterOptions, LocalCluster, RemoteCluster, Suite};
    pub use crate::config::MetaClientConfig;
    pub use crate::meta::{MemoryStore, MetaClient, Snapshot};
    pub use crate::{Error, Missing, Result};
}
