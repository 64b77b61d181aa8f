//! Per-server connection pool.
//!
//! Each server in a cluster owns one pool. Connections are recycled when the
//! last [`Socket`] sharing them is dropped, and discarded once they expire,
//! sit idle too long, or report themselves dead.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{ClientError, ClientResult};
use crate::socket::Socket;
use crate::wire::{BoxFuture, Connection};

/// Opens new connections to a server.
pub trait Dialer: Send + Sync {
    /// Dials `addr`.
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, ClientResult<Arc<dyn Connection>>>;
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections per server.
    pub max_connections: usize,
    /// How long a connection can be idle before being closed.
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

impl PoolConfig {
    /// Creates a new pool configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the max lifetime.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ClientResult<()> {
        if self.max_connections == 0 {
            return Err(ClientError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A pooled connection with its bookkeeping.
pub(crate) struct PooledConnection {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
}

impl PooledConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    /// Rebuilds the bookkeeping for a connection coming back from a socket.
    pub(crate) fn returned(
        connection: Arc<dyn Connection>,
        created_at: Instant,
        use_count: u64,
    ) -> Self {
        Self {
            connection,
            created_at,
            last_used: Instant::now(),
            use_count: use_count + 1,
        }
    }

    fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created.
    pub connections_created: u64,
    /// Total connections closed.
    pub connections_closed: u64,
    /// Total acquisitions.
    pub acquisitions: u64,
    /// Total releases.
    pub releases: u64,
    /// Acquisition timeouts.
    pub timeouts: u64,
    /// Current pool size.
    pub current_size: usize,
    /// Current idle connections.
    pub idle_connections: usize,
}

struct PoolState {
    available: VecDeque<PooledConnection>,
    closed: bool,
}

/// The connection pool of one server.
pub struct ServerPool {
    addr: String,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
    stats: Mutex<PoolStats>,
    current_size: AtomicUsize,
}

impl ServerPool {
    /// Creates a pool for `addr`.
    pub fn new(
        addr: impl Into<String>,
        config: PoolConfig,
        dialer: Arc<dyn Dialer>,
    ) -> ClientResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            addr: addr.into(),
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                closed: false,
            }),
            stats: Mutex::new(PoolStats::default()),
            current_size: AtomicUsize::new(0),
            dialer,
            config,
        }))
    }

    /// Returns the server address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Acquires a socket, waiting at most `wait` for a free slot.
    ///
    /// A zero `wait` waits forever. The socket's round-trip timeout is set to
    /// `socket_timeout`.
    pub async fn acquire(
        self: &Arc<Self>,
        wait: Duration,
        socket_timeout: Duration,
    ) -> ClientResult<Socket> {
        if self.state.lock().closed {
            return Err(ClientError::PoolExhausted);
        }

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = if wait.is_zero() {
            acquire.await.map_err(|_| ClientError::PoolExhausted)?
        } else {
            match tokio::time::timeout(wait, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(ClientError::PoolExhausted),
                Err(_) => {
                    self.stats.lock().timeouts += 1;
                    return Err(ClientError::PoolTimeout(wait.as_millis() as u64));
                }
            }
        };

        let conn = self.get_or_create_connection().await?;
        self.stats.lock().acquisitions += 1;
        Ok(Socket::new(Arc::clone(self), conn, permit, socket_timeout))
    }

    /// Returns a connection to the pool.
    pub(crate) fn release(&self, conn: PooledConnection) {
        let keep = !conn.is_expired(self.config.max_lifetime)
            && conn.connection.is_alive()
            && !self.state.lock().closed;

        if keep {
            self.state.lock().available.push_back(conn);
        } else {
            self.close_connection(conn);
        }
        self.stats.lock().releases += 1;
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().clone();
        stats.current_size = self.current_size.load(Ordering::Relaxed);
        stats.idle_connections = self.state.lock().available.len();
        stats
    }

    /// Returns the number of open connections.
    pub fn size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Returns the number of idle connections.
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Closes the pool and all idle connections.
    pub fn close(&self) {
        let connections = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.available)
        };
        for conn in connections {
            self.close_connection(conn);
        }
    }

    /// Returns true if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn get_or_create_connection(&self) -> ClientResult<PooledConnection> {
        {
            let mut state = self.state.lock();
            while let Some(conn) = state.available.pop_front() {
                if conn.is_expired(self.config.max_lifetime)
                    || conn.is_idle(self.config.idle_timeout)
                    || !conn.connection.is_alive()
                {
                    self.close_connection(conn);
                    continue;
                }
                return Ok(conn);
            }
        }

        let connection = self.dialer.dial(&self.addr).await?;
        self.current_size.fetch_add(1, Ordering::Relaxed);
        self.stats.lock().connections_created += 1;
        tracing::debug!(addr = %self.addr, "opened connection");
        Ok(PooledConnection::new(connection))
    }

    fn close_connection(&self, conn: PooledConnection) {
        self.current_size.fetch_sub(1, Ordering::Relaxed);
        self.stats.lock().connections_closed += 1;
        tracing::debug!(addr = %self.addr, uses = conn.use_count, "closed connection");
    }
}

impl fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPool")
            .field("addr", &self.addr)
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Credential, Op, ServerInfo};
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Default)]
    struct NullConnection {
        dead: AtomicBool,
    }

    impl Connection for NullConnection {
        fn server(&self) -> ServerInfo {
            ServerInfo {
                addr: "null:27017".into(),
                master: true,
                ..Default::default()
            }
        }

        fn send(&self, _ops: Vec<Op>) -> BoxFuture<'_, ClientResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn login<'a>(&'a self, _credential: &'a Credential) -> BoxFuture<'a, ClientResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn logout<'a>(&'a self, _db: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }

        fn set_timeout(&self, _timeout: Duration) {}

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::Relaxed)
        }
    }

    struct NullDialer;

    impl Dialer for NullDialer {
        fn dial<'a>(&'a self, _addr: &'a str) -> BoxFuture<'a, ClientResult<Arc<dyn Connection>>> {
            Box::pin(async { Ok(Arc::new(NullConnection::default()) as Arc<dyn Connection>) })
        }
    }

    fn pool(max: usize) -> Arc<ServerPool> {
        ServerPool::new(
            "null:27017",
            PoolConfig::new().max_connections(max),
            Arc::new(NullDialer),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::new().validate().is_ok());
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_release_on_last_drop() {
        let pool = pool(4);
        let socket = pool.acquire(Duration::ZERO, Duration::ZERO).await.unwrap();
        let shared = socket.clone();
        assert_eq!(socket.ref_count(), 2);
        assert!(socket.same(&shared));

        drop(socket);
        assert_eq!(pool.available(), 0);
        drop(shared);
        assert_eq!(pool.available(), 1);

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.releases, 1);
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let pool = pool(4);
        drop(pool.acquire(Duration::ZERO, Duration::ZERO).await.unwrap());
        drop(pool.acquire(Duration::ZERO, Duration::ZERO).await.unwrap());
        assert_eq!(pool.stats().connections_created, 1);
        assert_eq!(pool.stats().acquisitions, 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = pool(1);
        let _held = pool.acquire(Duration::ZERO, Duration::ZERO).await.unwrap();
        let result = pool.acquire(Duration::from_millis(20), Duration::ZERO).await;
        assert!(matches!(result, Err(ClientError::PoolTimeout(20))));
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = pool(2);
        pool.close();
        assert!(pool.is_closed());
        let result = pool.acquire(Duration::ZERO, Duration::ZERO).await;
        assert!(matches!(result, Err(ClientError::PoolExhausted)));
    }
}
