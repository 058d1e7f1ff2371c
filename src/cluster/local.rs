//! Cluster of node processes on this host
//!
//! Nodes live in `n<i>` directories under a temporary base directory. Hybrid
//! nodes are numbered first, then meta nodes, then data nodes, so the first
//! `hybrid + meta` nodes form the meta quorum every node joins.

use super::node_config::{
    generate_join_arg, ptoi, shift_port, NodeConfig, DEFAULT_HTTP_BIND_ADDRESS,
    DEFAULT_META_HTTP_BIND_ADDRESS, PORT_JUMP,
};
use super::{map_servers, Cluster, ClusterInfo, ClusterOptions, NodeSet, QueryClient};
use crate::meta::NodeRole;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One generated node
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub number: u32,
    pub role: NodeRole,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub config: NodeConfig,
}

impl LocalNode {
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("node.log")
    }
}

#[derive(Default)]
struct Processes {
    running: bool,
    children: Vec<Child>,
}

/// Locally spawned cluster
pub struct LocalCluster {
    options: ClusterOptions,
    base: TempDir,
    nodes: Vec<LocalNode>,
    entry_addr: String,
    clients: NodeSet,
    processes: Mutex<Processes>,
}

impl LocalCluster {
    /// Generate configuration files and directories. Nothing is started yet.
    pub fn new(options: ClusterOptions) -> Result<Self> {
        options.validate()?;

        let base = tempfile::Builder::new()
            .prefix("metasync-cluster")
            .tempdir()?;
        info!(dir = %base.path().display(), "Created cluster directory");

        let join = generate_join_arg(options.meta_n(), ptoi(DEFAULT_META_HTTP_BIND_ADDRESS)?);
        let roles = std::iter::repeat(NodeRole::Hybrid)
            .take(options.hybrid as usize)
            .chain(std::iter::repeat(NodeRole::Meta).take(options.meta as usize))
            .chain(std::iter::repeat(NodeRole::Data).take(options.data as usize));

        let mut nodes = Vec::new();
        for (i, role) in roles.enumerate() {
            let number = i as u32 + 1;
            nodes.push(write_node(base.path(), number, role, &join)?);
        }

        let first_data = nodes
            .iter()
            .find(|node| node.role.serves_data())
            .map(|node| node.number)
            .ok_or_else(|| Error::Config("cluster must have at least one data node".to_string()))?;
        let entry_addr = format!(
            "localhost{}",
            shift_port(DEFAULT_HTTP_BIND_ADDRESS, first_data as i64 * PORT_JUMP)?
        );

        Ok(Self {
            clients: NodeSet::new(options.query_timeout),
            options,
            base,
            nodes,
            entry_addr,
            processes: Mutex::new(Processes::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        self.base.path()
    }

    pub fn entry_addr(&self) -> &str {
        &self.entry_addr
    }

    pub fn local_nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    /// Number of data nodes holding `relative` under their data directory.
    pub async fn nodes_having_path(&self, relative: &str) -> Result<usize> {
        super::converge::nodes_having_path(&self.data_dirs(), relative).await
    }

    fn spawn(&self, node: &LocalNode) -> Result<Child> {
        let log = File::create(node.log_path())?;
        let child = Command::new(&self.options.bin_path)
            .arg(format!("-config={}", node.config_path.display()))
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Config(format!(
                    "failed to start {}: {}",
                    self.options.bin_path.display(),
                    e
                ))
            })?;
        info!(node = node.number, role = %node.role, pid = ?child.id(), "Started node");
        Ok(child)
    }
}

fn write_node(base: &Path, number: u32, role: NodeRole, join: &str) -> Result<LocalNode> {
    let dir = base.join(format!("n{}", number));
    std::fs::create_dir_all(&dir)?;
    let config = NodeConfig::new(&dir, number, role)?.with_join(join);
    let config_path = dir.join("config.toml");
    std::fs::write(&config_path, config.to_toml()?)?;
    Ok(LocalNode {
        number,
        role,
        dir,
        config_path,
        config,
    })
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn start(&self) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if processes.running {
            return Ok(());
        }

        for node in &self.nodes {
            let child = self.spawn(node)?;
            processes.children.push(child);
        }

        let entry = QueryClient::new(self.entry_addr.clone(), self.options.query_timeout)?;
        let servers = map_servers(&entry, self.info(), self.options.start_timeout).await?;
        self.clients.connect(&servers.data_servers)?;
        processes.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut processes = self.processes.lock().await;
        self.clients.clear();

        for mut child in processes.children.drain(..) {
            if let Err(e) = child.start_kill() {
                warn!(pid = ?child.id(), error = %e, "Failed to signal node");
                continue;
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap node");
            }
        }
        if processes.running {
            info!(dir = %self.base.path().display(), "Stopped local cluster");
        }
        processes.running = false;
        Ok(())
    }

    fn nodes(&self) -> &NodeSet {
        &self.clients
    }

    fn info(&self) -> ClusterInfo {
        ClusterInfo {
            meta_n: self.options.meta_n() as usize,
            data_n: self.options.data_n() as usize,
        }
    }

    fn data_dirs(&self) -> Vec<PathBuf> {
        self.nodes
            .iter()
            .filter_map(|node| node.config.data_dir())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_numbers_hybrid_then_meta_then_data() {
        let cluster = LocalCluster::new(ClusterOptions {
            hybrid: 1,
            meta: 2,
            data: 2,
            ..ClusterOptions::default()
        })
        .unwrap();

        let roles: Vec<NodeRole> = cluster.local_nodes().iter().map(|n| n.role).collect();
        assert_eq!(
            roles,
            vec![
                NodeRole::Hybrid,
                NodeRole::Meta,
                NodeRole::Meta,
                NodeRole::Data,
                NodeRole::Data
            ]
        );
        assert_eq!(cluster.entry_addr(), "localhost:8186");
        assert_eq!(cluster.info(), ClusterInfo { meta_n: 3, data_n: 3 });
        assert_eq!(cluster.data_dirs().len(), 3);

        let join = "localhost:8191,localhost:8291,localhost:8391";
        for node in cluster.local_nodes() {
            assert_eq!(node.config.join, join);
            let raw = std::fs::read_to_string(&node.config_path).unwrap();
            assert_eq!(NodeConfig::from_toml(&raw).unwrap(), node.config);
        }
    }

    #[test]
    fn test_entry_is_first_data_node() {
        let cluster = LocalCluster::new(ClusterOptions {
            hybrid: 0,
            meta: 3,
            data: 1,
            ..ClusterOptions::default()
        })
        .unwrap();
        assert_eq!(cluster.entry_addr(), "localhost:8486");
    }

    #[test]
    fn test_rejects_undersized_cluster() {
        let err = LocalCluster::new(ClusterOptions {
            hybrid: 2,
            ..ClusterOptions::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails() {
        let cluster = LocalCluster::new(ClusterOptions {
            bin_path: PathBuf::from("/nonexistent/metasync-node"),
            ..ClusterOptions::default()
        })
        .unwrap();
        assert!(cluster.start().await.is_err());
        cluster.stop().await.unwrap();
    }
}
