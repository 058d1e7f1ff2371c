//! Snapshot poller
//!
//! Background task that keeps a [`MetadataCache`] converging toward the
//! authoritative index. Every server is equally authoritative for reads, so
//! failover is plain round-robin with no leader discovery.

use super::cache::{CacheWriter, MetadataCache};
use super::data::Snapshot;
use super::telemetry;
use super::transport::MetaTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Persistent round-robin position in the server list.
///
/// Advances by one after every fetch attempt, successful or not.
#[derive(Debug, Clone, Default)]
pub struct ServerCursor {
    position: usize,
}

impl ServerCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Server under the cursor, wrapping if the list has shrunk.
    pub fn current<'a>(&self, servers: &'a [String]) -> Option<&'a str> {
        if servers.is_empty() {
            return None;
        }
        servers.get(self.position % servers.len()).map(|s| s.as_str())
    }

    pub fn advance(&mut self, len: usize) {
        if len == 0 {
            self.position = 0;
        } else {
            self.position = (self.position + 1) % len;
        }
    }
}

pub struct SnapshotPoller {
    transport: Arc<dyn MetaTransport>,
    servers: Arc<Vec<String>>,
    cache: Arc<MetadataCache>,
    writer: CacheWriter,
    cursor: ServerCursor,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl SnapshotPoller {
    pub fn new(
        transport: Arc<dyn MetaTransport>,
        servers: Arc<Vec<String>>,
        writer: CacheWriter,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            servers,
            cache: writer.cache().clone(),
            writer,
            cursor: ServerCursor::new(),
            retry_delay,
            shutdown,
        }
    }

    pub fn cursor(&self) -> &ServerCursor {
        &self.cursor
    }

    /// One fetch against the server under the cursor, then advance.
    async fn fetch_once(&mut self) -> Option<Snapshot> {
        let server = self.cursor.current(&self.servers)?.to_string();
        let index = self.cache.index();

        let start = Instant::now();
        let result = self.transport.fetch_snapshot(&server, index).await;
        telemetry::record_fetch(&server, result.is_ok(), start.elapsed().as_secs_f64());
        self.cursor.advance(self.servers.len());

        match result {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(server = %server, index, error = %e, "Failure getting snapshot");
                None
            }
        }
    }

    /// Fetch until one server answers. Returns `None` once shutdown is requested.
    pub async fn retry_until_snapshot(&mut self) -> Option<Snapshot> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            if let Some(snapshot) = self.fetch_once().await {
                return Some(snapshot);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Install a fetched snapshot unless shutdown was requested meanwhile.
    pub fn install(&self, snapshot: Snapshot) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.writer.install(snapshot)
    }

    /// Poll until shutdown. Successful fetches loop immediately; the server
    /// long-polls so this does not spin.
    pub async fn run(mut self) {
        info!(servers = ?self.servers, "Snapshot poller started");
        while let Some(snapshot) = self.retry_until_snapshot().await {
            let fetched = snapshot.index;
            if !self.install(snapshot) && self.shutdown.is_cancelled() {
                break;
            }
            debug!(fetched, current = self.cache.index(), "Snapshot poll complete");
        }
        info!("Snapshot poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::local::LocalTransport;
    use crate::meta::store::{MemoryStore, StoreConfig};

    fn servers(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("m{}:8091", i)).collect()
    }

    #[test]
    fn test_cursor_wraps() {
        let list = servers(3);
        let mut cursor = ServerCursor::new();
        assert_eq!(cursor.current(&list), Some("m1:8091"));
        for _ in 0..4 {
            cursor.advance(list.len());
        }
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.current(&list), Some("m2:8091"));
        assert_eq!(cursor.current(&[]), None);
    }

    #[tokio::test]
    async fn test_failover_advances_cursor_k_plus_one() {
        let store = Arc::new(MemoryStore::new(StoreConfig {
            long_poll_timeout: Duration::from_millis(20),
        }));
        let transport = Arc::new(LocalTransport::new());
        let list = servers(4);
        for addr in &list {
            transport.add_server(addr.clone(), store.clone());
        }
        transport.set_reachable("m1:8091", false);
        transport.set_reachable("m2:8091", false);

        let (cache, writer) = MetadataCache::new();
        let mut poller = SnapshotPoller::new(
            transport.clone(),
            Arc::new(list),
            writer,
            Duration::from_millis(1),
            CancellationToken::new(),
        );

        let snapshot = poller.retry_until_snapshot().await.unwrap();
        assert_eq!(poller.cursor().position(), 3);
        assert_eq!(transport.fetch_count("m1:8091"), 1);
        assert_eq!(transport.fetch_count("m2:8091"), 1);
        assert_eq!(transport.fetch_count("m3:8091"), 1);
        assert_eq!(transport.fetch_count("m4:8091"), 0);

        assert!(poller.install(snapshot));
        assert_eq!(cache.index(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let transport = Arc::new(LocalTransport::new());
        let (_cache, writer) = MetadataCache::new();
        let shutdown = CancellationToken::new();
        let mut poller = SnapshotPoller::new(
            transport,
            Arc::new(servers(1)),
            writer,
            Duration::from_secs(60),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move { poller.retry_until_snapshot().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller should stop during backoff")
            .unwrap();
        assert!(result.is_none());
    }
}
