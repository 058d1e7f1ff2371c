//! Cluster metadata
//!
//! Data model, command set, the client-side cache with its poller and
//! mutation path, and a development authority that serves them.

pub mod cache;
pub mod client;
pub mod command;
pub mod data;
pub mod executor;
pub mod local;
pub mod poller;
pub mod store;
pub mod submitter;
mod telemetry;
pub mod transport;

pub use cache::{CacheWriter, ChangeGate, MetadataCache};
pub use client::MetaClient;
pub use command::{Command, ExecuteResponse, RetentionPolicySpec, RetentionPolicyUpdate};
pub use data::{
    DatabaseInfo, NodeRole, Privilege, RetentionPolicyInfo, ServerInfo, ShardGroupInfo,
    ShardInfo, Snapshot, UserInfo,
};
pub use executor::{Statement, StatementExecutor};
pub use local::LocalTransport;
pub use poller::{ServerCursor, SnapshotPoller};
pub use store::{MemoryStore, StoreConfig};
pub use submitter::MutationSubmitter;
pub use transport::{CommandReceipt, HttpTransport, MetaTransport};
