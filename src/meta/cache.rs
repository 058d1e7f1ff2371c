//! Local metadata cache
//!
//! Holds the most recent [`Snapshot`] and the current [`ChangeGate`]. Any
//! number of tasks may read; only the holder of the [`CacheWriter`] can
//! install. The index comparison, snapshot swap and gate swap all happen under
//! one write lock, so a waiter never sees the old gate once the index has
//! advanced.

use super::data::Snapshot;
use super::telemetry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One-shot signal that opens when the cache index next advances.
///
/// Once open it stays open. Clones share the same underlying gate.
#[derive(Debug, Clone)]
pub struct ChangeGate {
    token: CancellationToken,
}

impl ChangeGate {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    fn open(&self) {
        self.token.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the gate opens. Returns immediately if it already has.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Wait up to `timeout`; returns whether the gate opened.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

struct CacheState {
    snapshot: Arc<Snapshot>,
    gate: ChangeGate,
}

/// Concurrency-safe holder of the latest known snapshot
pub struct MetadataCache {
    state: RwLock<CacheState>,
}

impl MetadataCache {
    /// Create an empty cache (index 0) and the only writer for it.
    pub fn new() -> (Arc<Self>, CacheWriter) {
        let cache = Arc::new(Self {
            state: RwLock::new(CacheState {
                snapshot: Arc::new(Snapshot::empty()),
                gate: ChangeGate::new(),
            }),
        });
        let writer = CacheWriter {
            cache: cache.clone(),
        };
        (cache, writer)
    }

    /// Most recently installed snapshot. Never blocks on the network.
    pub fn read(&self) -> Arc<Snapshot> {
        self.state.read().snapshot.clone()
    }

    pub fn index(&self) -> u64 {
        self.state.read().snapshot.index
    }

    /// Gate for the next index advance after now.
    ///
    /// Obtain it before submitting a mutation, never after.
    pub fn wait_for_change(&self) -> ChangeGate {
        self.state.read().gate.clone()
    }

    /// Current snapshot together with the gate for the advance after it.
    pub fn read_with_gate(&self) -> (Arc<Snapshot>, ChangeGate) {
        let state = self.state.read();
        (state.snapshot.clone(), state.gate.clone())
    }

    /// Block until the cache index is at least `index`.
    ///
    /// `gate` must have been obtained before the event that produced `index`.
    pub async fn wait_for_index(&self, index: u64, mut gate: ChangeGate) {
        loop {
            if self.index() >= index {
                return;
            }
            gate.wait().await;
            gate = self.wait_for_change();
        }
    }
}

/// Sole handle allowed to install snapshots into a [`MetadataCache`].
pub struct CacheWriter {
    cache: Arc<MetadataCache>,
}

impl CacheWriter {
    /// Replace the snapshot iff `snapshot.index` is strictly greater than the
    /// current index, opening the current gate and arming a fresh one.
    ///
    /// Returns whether the snapshot was installed.
    pub fn install(&self, snapshot: Snapshot) -> bool {
        let mut state = self.cache.state.write();
        let current = state.snapshot.index;
        if snapshot.index <= current {
            drop(state);
            debug!(current, fetched = snapshot.index, "Discarding stale snapshot");
            telemetry::record_install(false);
            return false;
        }

        let index = snapshot.index;
        state.snapshot = Arc::new(snapshot);
        let opened = std::mem::replace(&mut state.gate, ChangeGate::new());
        opened.open();
        drop(state);

        debug!(previous = current, index, "Installed metadata snapshot");
        telemetry::record_install(true);
        true
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }
}
