//! Cluster whose nodes are already running elsewhere

use super::{map_servers, Cluster, ClusterInfo, NodeSet, QueryClient, DEFAULT_START_TIMEOUT};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Attaches to a running cluster through one entry node
pub struct RemoteCluster {
    entry: QueryClient,
    expected: ClusterInfo,
    start_timeout: Duration,
    data_dirs: Vec<PathBuf>,
    clients: NodeSet,
    observed: Mutex<Option<ClusterInfo>>,
}

impl RemoteCluster {
    pub fn new(entry_addr: impl Into<String>, query_timeout: Duration) -> Result<Self> {
        Ok(Self {
            entry: QueryClient::new(entry_addr, query_timeout)?,
            expected: ClusterInfo {
                meta_n: 0,
                data_n: 1,
            },
            start_timeout: DEFAULT_START_TIMEOUT,
            data_dirs: Vec::new(),
            clients: NodeSet::new(query_timeout),
            observed: Mutex::new(None),
        })
    }

    /// Wait in [`Cluster::start`] until this many nodes are listed.
    pub fn with_expected(mut self, meta_n: usize, data_n: usize) -> Self {
        self.expected = ClusterInfo { meta_n, data_n };
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Data directories of the nodes when they are mounted on this host.
    pub fn with_data_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.data_dirs = dirs;
        self
    }
}

#[async_trait]
impl Cluster for RemoteCluster {
    async fn start(&self) -> Result<()> {
        if self.observed.lock().is_some() {
            return Ok(());
        }
        let servers = map_servers(&self.entry, self.expected, self.start_timeout).await?;
        self.clients.connect(&servers.data_servers)?;
        *self.observed.lock() = Some(ClusterInfo {
            meta_n: servers.meta_servers.len(),
            data_n: servers.data_servers.len(),
        });
        info!(entry = self.entry.addr(), "Attached to remote cluster");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.clients.clear();
        self.observed.lock().take();
        Ok(())
    }

    fn nodes(&self) -> &NodeSet {
        &self.clients
    }

    /// Counts reported by the entry node, or the expected counts before start.
    fn info(&self) -> ClusterInfo {
        let observed = *self.observed.lock();
        observed.unwrap_or(self.expected)
    }

    fn data_dirs(&self) -> Vec<PathBuf> {
        self.data_dirs.clone()
    }
}
