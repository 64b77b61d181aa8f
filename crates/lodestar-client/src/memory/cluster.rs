//! Cluster view over a memory network.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use dashmap::DashMap;

use super::connection::MemoryConnection;
use super::{NetworkInner, ServerCounters};
use crate::cluster::Cluster;
use crate::config::DialInfo;
use crate::error::{ClientError, ClientResult};
use crate::index::IndexCache;
use crate::pool::{Dialer, PoolConfig, ServerPool};
use crate::socket::Socket;
use crate::wire::{BoxFuture, Connection};

/// How often socket acquisition re-checks for a suitable server.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct MemoryDialer {
    network: Arc<NetworkInner>,
}

impl Dialer for MemoryDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, ClientResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            if !self.network.is_up(addr) {
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: connection refused",
                    addr
                )));
            }
            ServerCounters::bump(&self.network.counters(addr).connections);
            let conn: Arc<dyn Connection> =
                Arc::new(MemoryConnection::new(Arc::clone(&self.network), addr));
            Ok(conn)
        })
    }
}

/// The servers of a memory network reachable from one set of seeds.
///
/// Without `direct`, any known seed discovers the whole network. With it,
/// only the seeds are used.
pub struct MemoryCluster {
    network: Arc<NetworkInner>,
    seeds: Vec<String>,
    direct: bool,
    pool_config: PoolConfig,
    pools: DashMap<String, Arc<ServerPool>>,
    index_cache: IndexCache,
}

impl MemoryCluster {
    pub(crate) fn new(network: Arc<NetworkInner>, info: &DialInfo) -> Self {
        Self {
            network,
            seeds: info.addrs.clone(),
            direct: info.direct,
            pool_config: info.pool_config(),
            pools: DashMap::new(),
            index_cache: IndexCache::new(),
        }
    }

    fn candidates(&self) -> Vec<String> {
        let discovered = self.seeds.iter().any(|seed| self.network.has_server(seed));
        if self.direct || !discovered {
            self.seeds.clone()
        } else {
            self.network.addrs()
        }
    }

    /// Picks a live server. Secondaries matching `tags` are preferred when
    /// allowed; the primary is the fallback.
    fn select(&self, prefer_secondary: bool, tags: &[Document]) -> Option<String> {
        let live: Vec<_> = self
            .candidates()
            .iter()
            .filter(|addr| self.network.is_up(addr))
            .filter_map(|addr| self.network.server_info(addr))
            .collect();
        if prefer_secondary {
            if let Some(secondary) = live.iter().find(|s| !s.master && s.matches_tags(tags)) {
                return Some(secondary.addr.clone());
            }
        }
        live.into_iter().find(|s| s.master).map(|s| s.addr)
    }

    fn pool(&self, addr: &str) -> ClientResult<Arc<ServerPool>> {
        if let Some(pool) = self.pools.get(addr) {
            return Ok(Arc::clone(&pool));
        }
        let dialer = Arc::new(MemoryDialer {
            network: Arc::clone(&self.network),
        });
        let pool = ServerPool::new(addr, self.pool_config.clone(), dialer)?;
        Ok(Arc::clone(&self.pools.entry(addr.to_string()).or_insert(pool)))
    }
}

impl Cluster for MemoryCluster {
    fn acquire_socket<'a>(
        &'a self,
        prefer_secondary: bool,
        sync_timeout: Duration,
        socket_timeout: Duration,
        tags: &'a [Document],
    ) -> BoxFuture<'a, ClientResult<Socket>> {
        Box::pin(async move {
            let started = Instant::now();
            loop {
                if let Some(addr) = self.select(prefer_secondary, tags) {
                    tracing::trace!(%addr, prefer_secondary, "selected server");
                    return self.pool(&addr)?.acquire(sync_timeout, socket_timeout).await;
                }
                if !sync_timeout.is_zero() && started.elapsed() >= sync_timeout {
                    tracing::debug!(prefer_secondary, "no reachable servers");
                    return Err(ClientError::NoReachableServers);
                }
                tokio::time::sleep(SYNC_POLL_INTERVAL).await;
            }
        })
    }

    fn acquire_server_socket<'a>(
        &'a self,
        addr: &'a str,
        socket_timeout: Duration,
    ) -> BoxFuture<'a, ClientResult<Socket>> {
        Box::pin(async move {
            if !self.network.is_up(addr) {
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: server unavailable",
                    addr
                )));
            }
            self.pool(addr)?.acquire(Duration::ZERO, socket_timeout).await
        })
    }

    fn live_servers(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .candidates()
            .into_iter()
            .filter(|addr| self.network.is_up(addr))
            .collect();
        live.sort();
        live
    }

    fn index_cache(&self) -> &IndexCache {
        &self.index_cache
    }
}

impl Drop for MemoryCluster {
    fn drop(&mut self) {
        for pool in self.pools.iter() {
            pool.close();
        }
    }
}

impl fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("seeds", &self.seeds)
            .field("direct", &self.direct)
            .field("pools", &self.pools.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use bson::doc;

    fn tagged_network() -> MemoryNetwork {
        let network = MemoryNetwork::new();
        network.add_primary("a:1");
        network.add_secondary("b:1", doc! { "dc": "east" });
        network.add_secondary("c:1", doc! { "dc": "west" });
        network
    }

    #[tokio::test]
    async fn test_primary_only_without_secondary_preference() {
        let network = tagged_network();
        let cluster = network.cluster(&DialInfo::new(["a:1"]));
        let socket = cluster
            .acquire_socket(false, Duration::from_millis(50), Duration::ZERO, &[])
            .await
            .unwrap();
        assert_eq!(socket.addr(), "a:1");
        assert!(socket.server().master);
    }

    #[tokio::test]
    async fn test_tag_selection_and_fallback() {
        let network = tagged_network();
        let cluster = network.cluster(&DialInfo::new(["a:1"]));
        let tags = [doc! { "dc": "west" }];
        let socket = cluster
            .acquire_socket(true, Duration::from_millis(50), Duration::ZERO, &tags)
            .await
            .unwrap();
        assert_eq!(socket.addr(), "c:1");

        let tags = [doc! { "dc": "north" }];
        let socket = cluster
            .acquire_socket(true, Duration::from_millis(50), Duration::ZERO, &tags)
            .await
            .unwrap();
        assert_eq!(socket.addr(), "a:1");
    }

    #[tokio::test]
    async fn test_direct_uses_seeds_only() {
        let network = tagged_network();
        let cluster = network.cluster(&DialInfo::new(["b:1"]).direct(true));
        assert_eq!(cluster.live_servers(), vec!["b:1"]);
        let err = cluster
            .acquire_socket(false, Duration::from_millis(30), Duration::ZERO, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoReachableServers));
    }

    #[tokio::test]
    async fn test_socket_returns_to_pool() {
        let network = tagged_network();
        let cluster = network.cluster(&DialInfo::new(["a:1"]));
        let socket = cluster
            .acquire_server_socket("a:1", Duration::ZERO)
            .await
            .unwrap();
        drop(socket);
        let _again = cluster
            .acquire_server_socket("a:1", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(network.stats("a:1").connections, 1);
    }

    #[tokio::test]
    async fn test_down_server_unavailable() {
        let network = tagged_network();
        let cluster = network.cluster(&DialInfo::new(["a:1"]));
        network.set_down("b:1");
        assert_eq!(cluster.live_servers(), vec!["a:1", "c:1"]);
        assert!(cluster
            .acquire_server_socket("b:1", Duration::ZERO)
            .await
            .is_err());
    }
}
