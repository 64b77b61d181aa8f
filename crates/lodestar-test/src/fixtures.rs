//! Shared fixtures for driver tests.

use std::sync::Once;

use bson::{doc, Document};
use lodestar_client::{ClientResult, MemoryNetwork, Session};
use tracing_subscriber::EnvFilter;

/// Address of the primary created by [`MemoryNetwork::replica_set`].
pub const PRIMARY: &str = "localhost:40001";

/// Address of the first secondary created by [`MemoryNetwork::replica_set`].
pub const SECONDARY: &str = "localhost:40002";

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A replica set with one primary and `secondaries` secondaries.
pub struct ReplicaSet {
    /// The simulated network.
    pub network: MemoryNetwork,
}

impl ReplicaSet {
    /// Builds the set and installs tracing.
    pub fn new(secondaries: u16) -> Self {
        init_tracing();
        let network = MemoryNetwork::replica_set(secondaries);
        tracing::debug!(servers = ?network.addrs(), "replica set ready");
        Self { network }
    }

    /// Dials the primary and returns a Strong session.
    pub async fn dial(&self) -> ClientResult<Session> {
        Session::dial(PRIMARY, &self.network).await
    }

    /// Dials with a full connection URL.
    pub async fn dial_url(&self, url: &str) -> ClientResult<Session> {
        Session::dial(url, &self.network).await
    }

    /// Zeroes the request counters of every server.
    pub fn reset_stats(&self) {
        self.network.reset_stats();
    }
}

/// Returns `n` documents `{_id: i, n: i}` for `i` in `0..n`.
pub fn numbered(n: i32) -> Vec<Document> {
    (0..n).map(|i| doc! { "_id": i, "n": i }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered() {
        let docs = numbered(3);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[2], doc! { "_id": 2, "n": 2 });
    }

    #[tokio::test]
    async fn test_replica_set_dial() {
        let set = ReplicaSet::new(1);
        let session = set.dial().await.unwrap();
        assert_eq!(session.live_servers(), vec![PRIMARY, SECONDARY]);
    }
}
