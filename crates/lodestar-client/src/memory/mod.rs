//! In-memory replica set.
//!
//! A [`MemoryNetwork`] simulates a set of servers sharing one document
//! store. It implements [`Connector`](crate::Connector), so sessions dial it
//! like a real deployment, and it counts requests per server so tests can
//! assert on round trips. Servers can be taken down, brought back and
//! promoted at any time.

mod cluster;
mod commands;
mod connection;
mod matcher;
mod store;

pub use cluster::MemoryCluster;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::cluster::{Cluster, Connector};
use crate::config::{normalize_addr, DialInfo};
use crate::error::ClientResult;
use crate::session::{Mode, Session};
use crate::wire::{BoxFuture, Credential, ServerInfo};

use store::Store;

/// Address of the primary created by [`MemoryNetwork::single`].
pub const DEFAULT_ADDR: &str = "localhost:27017";

/// Timeout used by sessions created with [`MemoryNetwork::session`].
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-server request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Queries on collections.
    pub queries: u64,
    /// Commands, including `getLastError`.
    pub commands: u64,
    /// Get-more requests.
    pub get_mores: u64,
    /// Kill-cursors requests.
    pub kill_cursors: u64,
    /// Insert requests, including index creation.
    pub inserts: u64,
    /// Update requests.
    pub updates: u64,
    /// Delete requests.
    pub deletes: u64,
    /// Login attempts.
    pub logins: u64,
    /// Connections opened.
    pub connections: u64,
}

impl std::ops::AddAssign for RequestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.queries += rhs.queries;
        self.commands += rhs.commands;
        self.get_mores += rhs.get_mores;
        self.kill_cursors += rhs.kill_cursors;
        self.inserts += rhs.inserts;
        self.updates += rhs.updates;
        self.deletes += rhs.deletes;
        self.logins += rhs.logins;
        self.connections += rhs.connections;
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerCounters {
    pub queries: AtomicU64,
    pub commands: AtomicU64,
    pub get_mores: AtomicU64,
    pub kill_cursors: AtomicU64,
    pub inserts: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub logins: AtomicU64,
    pub connections: AtomicU64,
}

impl ServerCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RequestStats {
        RequestStats {
            queries: self.queries.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            get_mores: self.get_mores.load(Ordering::Relaxed),
            kill_cursors: self.kill_cursors.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            logins: self.logins.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.queries,
            &self.commands,
            &self.get_mores,
            &self.kill_cursors,
            &self.inserts,
            &self.updates,
            &self.deletes,
            &self.logins,
            &self.connections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct ServerEntry {
    primary: bool,
    tags: Document,
    up: bool,
    silent: bool,
    counters: Arc<ServerCounters>,
}

/// State shared by the network, its clusters and connections.
#[derive(Debug, Default)]
pub(crate) struct NetworkInner {
    servers: DashMap<String, ServerEntry>,
    users: RwLock<HashMap<(String, String), String>>,
    pub(crate) store: Mutex<Store>,
    next_connection_id: AtomicU64,
}

impl NetworkInner {
    pub(crate) fn has_server(&self, addr: &str) -> bool {
        self.servers.contains_key(addr)
    }

    pub(crate) fn is_up(&self, addr: &str) -> bool {
        self.servers.get(addr).map_or(false, |s| s.up)
    }

    pub(crate) fn is_silent(&self, addr: &str) -> bool {
        self.servers.get(addr).map_or(false, |s| s.silent)
    }

    pub(crate) fn is_primary(&self, addr: &str) -> bool {
        self.servers.get(addr).map_or(false, |s| s.primary)
    }

    pub(crate) fn server_info(&self, addr: &str) -> Option<ServerInfo> {
        self.servers.get(addr).map(|s| ServerInfo {
            addr: addr.to_string(),
            master: s.primary,
            tags: s.tags.clone(),
        })
    }

    pub(crate) fn counters(&self, addr: &str) -> Arc<ServerCounters> {
        self.servers
            .get(addr)
            .map(|s| Arc::clone(&s.counters))
            .unwrap_or_default()
    }

    /// Returns every server address, sorted.
    pub(crate) fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        addrs.sort();
        addrs
    }

    pub(crate) fn up_count(&self) -> usize {
        self.servers.iter().filter(|e| e.up).count()
    }

    pub(crate) fn auth_required(&self) -> bool {
        !self.users.read().is_empty()
    }

    pub(crate) fn check_credential(&self, credential: &Credential) -> bool {
        self.users
            .read()
            .get(&(credential.source.clone(), credential.username.clone()))
            .map_or(false, |password| *password == credential.password)
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A simulated replica set.
///
/// Cloning shares the same servers and data.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Creates a network with no servers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a network with a single primary at [`DEFAULT_ADDR`].
    pub fn single() -> Self {
        let network = Self::new();
        network.add_primary(DEFAULT_ADDR);
        network
    }

    /// Creates a primary at `localhost:40001` and `secondaries` secondaries
    /// on the following ports.
    pub fn replica_set(secondaries: u16) -> Self {
        let network = Self::new();
        network.add_primary("localhost:40001");
        for i in 0..secondaries {
            network.add_secondary(&format!("localhost:{}", 40002 + i), Document::new());
        }
        network
    }

    /// Adds a primary. Any existing primary becomes a secondary.
    pub fn add_primary(&self, addr: &str) {
        let addr = normalize_addr(addr.to_string());
        for mut entry in self.inner.servers.iter_mut() {
            entry.primary = false;
        }
        self.insert_server(addr, true, Document::new());
    }

    /// Adds a secondary with the given tags.
    pub fn add_secondary(&self, addr: &str, tags: Document) {
        self.insert_server(normalize_addr(addr.to_string()), false, tags);
    }

    fn insert_server(&self, addr: String, primary: bool, tags: Document) {
        tracing::debug!(%addr, primary, "adding memory server");
        self.inner.servers.insert(
            addr,
            ServerEntry {
                primary,
                tags,
                up: true,
                silent: false,
                counters: Arc::new(ServerCounters::default()),
            },
        );
    }

    /// Makes `addr` the primary and every other server a secondary.
    pub fn step_up(&self, addr: &str) {
        let addr = normalize_addr(addr.to_string());
        for mut entry in self.inner.servers.iter_mut() {
            let primary = *entry.key() == addr;
            entry.primary = primary;
        }
    }

    /// Takes a server down. Its connections fail from now on.
    pub fn set_down(&self, addr: &str) {
        self.set_up_state(addr, false);
    }

    /// Brings a server back up.
    pub fn set_up(&self, addr: &str) {
        self.set_up_state(addr, true);
    }

    /// Makes a server accept queries and get-more requests without ever
    /// answering them, while its connections stay open.
    pub fn set_silent(&self, addr: &str, silent: bool) {
        let addr = normalize_addr(addr.to_string());
        if let Some(mut entry) = self.inner.servers.get_mut(&addr) {
            entry.silent = silent;
            tracing::debug!(%addr, silent, "memory server replies changed");
        }
    }

    fn set_up_state(&self, addr: &str, up: bool) {
        let addr = normalize_addr(addr.to_string());
        if let Some(mut entry) = self.inner.servers.get_mut(&addr) {
            entry.up = up;
            tracing::debug!(%addr, up, "memory server state changed");
        }
    }

    /// Defines a user. Once any user exists, operations require login.
    pub fn add_user(&self, db: &str, username: &str, password: &str) {
        self.inner
            .users
            .write()
            .insert((db.to_string(), username.to_string()), password.to_string());
    }

    /// Returns every server address, sorted.
    pub fn addrs(&self) -> Vec<String> {
        self.inner.addrs()
    }

    /// Returns the current primary.
    pub fn primary(&self) -> Option<String> {
        self.inner
            .servers
            .iter()
            .find(|e| e.primary)
            .map(|e| e.key().clone())
    }

    /// Returns the request counters of one server.
    pub fn stats(&self, addr: &str) -> RequestStats {
        self.inner
            .counters(&normalize_addr(addr.to_string()))
            .snapshot()
    }

    /// Returns the request counters summed over every server.
    pub fn total_stats(&self) -> RequestStats {
        let mut total = RequestStats::default();
        for entry in self.inner.servers.iter() {
            total += entry.counters.snapshot();
        }
        total
    }

    /// Zeroes every request counter.
    pub fn reset_stats(&self) {
        for entry in self.inner.servers.iter() {
            entry.counters.reset();
        }
    }

    /// Returns the number of open server cursors.
    pub fn open_cursors(&self) -> usize {
        self.inner.store.lock().open_cursors()
    }

    /// Returns the documents of a collection, bypassing the driver.
    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.inner.store.lock().documents(namespace)
    }

    /// Builds a cluster for `info`.
    pub fn cluster(&self, info: &DialInfo) -> MemoryCluster {
        MemoryCluster::new(Arc::clone(&self.inner), info)
    }

    /// Creates a session over every server of the network without dialing.
    pub fn session(&self, mode: Mode) -> Session {
        let cluster = self.cluster(&DialInfo::new(self.addrs()));
        Session::with_cluster(mode, Arc::new(cluster), SESSION_TIMEOUT)
    }
}

impl Connector for MemoryNetwork {
    fn connect<'a>(&'a self, info: &'a DialInfo) -> BoxFuture<'a, ClientResult<Arc<dyn Cluster>>> {
        Box::pin(async move {
            let cluster: Arc<dyn Cluster> = Arc::new(self.cluster(info));
            Ok(cluster)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_set_layout() {
        let network = MemoryNetwork::replica_set(2);
        assert_eq!(
            network.addrs(),
            vec!["localhost:40001", "localhost:40002", "localhost:40003"]
        );
        assert_eq!(network.primary().as_deref(), Some("localhost:40001"));

        network.step_up("localhost:40003");
        assert_eq!(network.primary().as_deref(), Some("localhost:40003"));
        assert!(!network.inner.is_primary("localhost:40001"));
    }

    #[test]
    fn test_server_state() {
        let network = MemoryNetwork::single();
        assert!(network.inner.is_up(DEFAULT_ADDR));
        network.set_down("localhost");
        assert!(!network.inner.is_up(DEFAULT_ADDR));
        network.set_up("localhost");
        assert!(network.inner.is_up(DEFAULT_ADDR));
        assert_eq!(network.inner.up_count(), 1);
    }

    #[test]
    fn test_credentials() {
        let network = MemoryNetwork::single();
        assert!(!network.inner.auth_required());
        network.add_user("admin", "root", "pw");
        assert!(network.inner.auth_required());
        assert!(network.inner.check_credential(&Credential::new("admin", "root", "pw")));
        assert!(!network.inner.check_credential(&Credential::new("admin", "root", "bad")));
        assert!(!network.inner.check_credential(&Credential::new("app", "root", "pw")));
    }
}
