//! In-process transport for development and testing
//!
//! Routes each server address to a [`MemoryStore`] without going through HTTP.
//! Servers can be marked unreachable to exercise failover, and every call is
//! counted per address.

use super::command::Command;
use super::data::Snapshot;
use super::store::MemoryStore;
use super::transport::{CommandReceipt, MetaTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct LocalServer {
    store: Arc<MemoryStore>,
    reachable: AtomicBool,
    fetches: AtomicU64,
    submits: AtomicU64,
}

/// Address-to-store routing table
#[derive(Default)]
pub struct LocalTransport {
    servers: DashMap<String, Arc<LocalServer>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `addr` to `store`. Several addresses may share one store.
    pub fn add_server(&self, addr: impl Into<String>, store: Arc<MemoryStore>) {
        self.servers.insert(
            addr.into(),
            Arc::new(LocalServer {
                store,
                reachable: AtomicBool::new(true),
                fetches: AtomicU64::new(0),
                submits: AtomicU64::new(0),
            }),
        );
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        if let Some(server) = self.servers.get(addr) {
            server.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Snapshot fetch attempts made against `addr`, reachable or not.
    pub fn fetch_count(&self, addr: &str) -> u64 {
        self.servers
            .get(addr)
            .map(|s| s.fetches.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Command submissions attempted against `addr`, reachable or not.
    pub fn submit_count(&self, addr: &str) -> u64 {
        self.servers
            .get(addr)
            .map(|s| s.submits.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn server(&self, addr: &str) -> Result<Arc<LocalServer>> {
        self.servers
            .get(addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Unreachable(addr.to_string()))
    }
}

fn ensure_reachable(addr: &str, server: &LocalServer) -> Result<()> {
    if server.reachable.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::Unreachable(addr.to_string()))
    }
}

#[async_trait]
impl MetaTransport for LocalTransport {
    async fn fetch_snapshot(&self, server: &str, index: u64) -> Result<Snapshot> {
        let target = self.server(server)?;
        target.fetches.fetch_add(1, Ordering::SeqCst);
        ensure_reachable(server, &target)?;
        let snapshot = target.store.snapshot_after(index).await;
        Ok(Snapshot::clone(&snapshot))
    }

    async fn submit(&self, server: &str, command: &Command) -> Result<CommandReceipt> {
        let target = self.server(server)?;
        target.submits.fetch_add(1, Ordering::SeqCst);
        ensure_reachable(server, &target)?;
        let index = target.store.apply(command.clone())?;
        Ok(CommandReceipt { index: Some(index) })
    }

    async fn ping(&self, server: &str) -> Result<()> {
        let target = self.server(server)?;
        ensure_reachable(server, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::store::StoreConfig;
    use std::time::Duration;

    fn transport() -> LocalTransport {
        let store = Arc::new(MemoryStore::new(StoreConfig {
            long_poll_timeout: Duration::from_millis(20),
        }));
        let transport = LocalTransport::new();
        transport.add_server("m1:8091", store.clone());
        transport.add_server("m2:8091", store);
        transport
    }

    #[tokio::test]
    async fn test_unknown_server_is_unreachable() {
        let transport = transport();
        let err = transport.ping("nowhere:1").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unreachable_server_counts_attempts() {
        let transport = transport();
        transport.set_reachable("m1:8091", false);

        assert!(transport.fetch_snapshot("m1:8091", 0).await.is_err());
        assert_eq!(transport.fetch_count("m1:8091"), 1);

        transport.set_reachable("m1:8091", true);
        let snapshot = transport.fetch_snapshot("m1:8091", 0).await.unwrap();
        assert_eq!(snapshot.index, 1);
        assert_eq!(transport.fetch_count("m1:8091"), 2);
    }

    #[tokio::test]
    async fn test_submit_reports_applied_index() {
        let transport = transport();
        let receipt = transport
            .submit(
                "m2:8091",
                &Command::CreateDatabase {
                    name: "db0".to_string(),
                    retention_policy: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.index, Some(2));

        let snapshot = transport.fetch_snapshot("m1:8091", 1).await.unwrap();
        assert!(snapshot.database("db0").is_some(), "servers share one store");
    }
}
