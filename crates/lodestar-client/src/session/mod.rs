//! Sessions.
//!
//! A [`Session`] carries a consistency mode, the sockets it has reserved,
//! credentials, query defaults and write acknowledgement settings. All of
//! that lives in one owned state struct behind a read/write lock; the slow
//! path of socket acquisition is additionally serialized by an async mutex so
//! concurrent callers do not race to reserve two sockets for one role.
//!
//! Operations that reach the network fail with
//! [`ClientError::SessionClosed`] once the session is closed.

mod binding;
mod consistency;

pub use consistency::Mode;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::cluster::{Cluster, Connector};
use crate::config::DialInfo;
use crate::database::{Command, Database, DbRef};
use crate::error::{ClientError, ClientResult};
use crate::query::Query;
use crate::safe::{GetLastError, Safe};
use crate::socket::Socket;
use crate::wire::{Credential, QueryFlags};

use binding::SocketBinding;
use consistency::{Consistency, Release};

/// Timeout used by [`Session::dial`] while establishing the session.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync and socket timeout set by [`Session::dial`] once connected.
pub const DIAL_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default prefetch ratio.
pub const DEFAULT_PREFETCH: f64 = 0.25;

const DEFAULT_DATABASE: &str = "test";
const AUTH_DATABASE: &str = "admin";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Query settings new queries start from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryDefaults {
    /// Batch size sent with queries.
    pub batch: i32,
    /// Prefetch ratio.
    pub prefetch: f64,
    /// Flags added to every query.
    pub flags: QueryFlags,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            batch: 0,
            prefetch: DEFAULT_PREFETCH,
            flags: QueryFlags::NONE,
        }
    }
}

struct SessionState {
    cluster: Option<Arc<dyn Cluster>>,
    consistency: Consistency,
    binding: SocketBinding,
    query: QueryDefaults,
    safe: Option<GetLastError>,
    sync_timeout: Duration,
    socket_timeout: Duration,
    default_db: String,
    dial_credential: Option<Credential>,
    credentials: Vec<Credential>,
    server_tags: Vec<Document>,
}

impl SessionState {
    fn cluster(&self) -> ClientResult<Arc<dyn Cluster>> {
        self.cluster.clone().ok_or(ClientError::SessionClosed)
    }

    fn usable_socket(&self, accepts_secondary: bool) -> Option<Socket> {
        self.binding
            .usable(self.consistency.allows_secondary(accepts_secondary))
    }
}

/// Server build details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Version string.
    #[serde(default)]
    pub version: String,
    /// Version components, padded to four entries.
    #[serde(default, rename = "versionArray")]
    pub version_array: Vec<i32>,
    /// Git revision.
    #[serde(default, rename = "gitVersion")]
    pub git_version: String,
    /// Build system description.
    #[serde(default, rename = "sysInfo")]
    pub sys_info: String,
    /// Pointer width.
    #[serde(default)]
    pub bits: i32,
    /// Debug build.
    #[serde(default)]
    pub debug: bool,
    /// Largest accepted document size.
    #[serde(default, rename = "maxBsonObjectSize")]
    pub max_object_size: i32,
}

#[derive(Debug, Deserialize)]
struct DatabaseEntry {
    name: String,
    #[serde(default)]
    empty: bool,
}

#[derive(Debug, Deserialize)]
struct ListDatabasesResult {
    #[serde(default)]
    databases: Vec<DatabaseEntry>,
}

/// A logical connection to a replica set.
pub struct Session {
    id: SessionId,
    state: RwLock<SessionState>,
    acquire_lock: AsyncMutex<()>,
}

impl Session {
    /// Connects to the servers in `url` and returns a Strong session.
    ///
    /// Establishing the session may take up to ten seconds; afterwards the
    /// sync and socket timeouts are set to one minute.
    pub async fn dial(url: &str, connector: &dyn Connector) -> ClientResult<Session> {
        Self::dial_with_timeout(url, DIAL_TIMEOUT, connector)
            .await
            .map(|session| {
                session.set_sync_timeout(DIAL_OPERATION_TIMEOUT);
                session.set_socket_timeout(DIAL_OPERATION_TIMEOUT);
                session
            })
    }

    /// Connects to the servers in `url`, waiting at most `timeout`.
    pub async fn dial_with_timeout(
        url: &str,
        timeout: Duration,
        connector: &dyn Connector,
    ) -> ClientResult<Session> {
        let info = DialInfo::from_url(url)?.timeout(timeout);
        Self::dial_with_info(&info, connector).await
    }

    /// Connects using `info`.
    ///
    /// The new session pings the cluster before returning and fails if no
    /// server answers. It starts in Strong mode.
    pub async fn dial_with_info(
        info: &DialInfo,
        connector: &dyn Connector,
    ) -> ClientResult<Session> {
        info.validate()?;
        let cluster = connector.connect(info).await?;
        let session = Session::with_cluster(Mode::Eventual, cluster, info.timeout_duration());
        {
            let mut state = session.state.write();
            if !info.database.is_empty() {
                state.default_db = info.database.clone();
            }
            if !info.username.is_empty() {
                let source = if info.database.is_empty() {
                    AUTH_DATABASE
                } else {
                    info.database.as_str()
                };
                let credential = Credential::new(source, &info.username, &info.password);
                state.dial_credential = Some(credential.clone());
                state.credentials = vec![credential];
            }
        }

        if let Err(e) = session.ping().await {
            tracing::debug!(session = %session.id, error = %e, "dial ping failed");
            session.close();
            return Err(e);
        }
        session.set_mode(Mode::Strong, true);
        tracing::debug!(session = %session.id, addrs = ?info.addrs, "session established");
        Ok(session)
    }

    /// Creates a session over an existing cluster.
    pub fn with_cluster(mode: Mode, cluster: Arc<dyn Cluster>, timeout: Duration) -> Session {
        let mut safe = None;
        merge_safe(&mut safe, &Safe::default());
        Session::from_state(SessionState {
            cluster: Some(cluster),
            consistency: Consistency::new(mode),
            binding: SocketBinding::default(),
            query: QueryDefaults::default(),
            safe,
            sync_timeout: timeout,
            socket_timeout: timeout,
            default_db: DEFAULT_DATABASE.to_string(),
            dial_credential: None,
            credentials: Vec::new(),
            server_tags: Vec::new(),
        })
    }

    fn from_state(state: SessionState) -> Session {
        let id = SessionId::next();
        tracing::debug!(session = %id, mode = %state.consistency.mode(), "new session");
        Session {
            id,
            state: RwLock::new(state),
            acquire_lock: AsyncMutex::new(()),
        }
    }

    /// Returns the session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    // =========================================================================
    // Session Derivation
    // =========================================================================

    /// Creates a fresh session with the same settings and the dial
    /// credentials only. No sockets are shared.
    pub fn new_session(&self) -> ClientResult<Session> {
        let session = self.copy_session(false)?;
        session.refresh();
        Ok(session)
    }

    /// Creates a fresh session with the same settings and credentials. No
    /// sockets are shared.
    pub fn copy(&self) -> ClientResult<Session> {
        let session = self.copy_session(true)?;
        session.refresh();
        Ok(session)
    }

    /// Creates a session sharing this session's reserved sockets, so writes
    /// made through either are visible to both.
    pub fn clone_session(&self) -> ClientResult<Session> {
        self.copy_session(true)
    }

    fn copy_session(&self, keep_credentials: bool) -> ClientResult<Session> {
        let state = self.state.read();
        let cluster = state.cluster()?;
        let credentials = if keep_credentials {
            state.credentials.clone()
        } else {
            state.dial_credential.iter().cloned().collect()
        };
        Ok(Session::from_state(SessionState {
            cluster: Some(cluster),
            consistency: state.consistency,
            binding: state.binding.clone(),
            query: state.query.clone(),
            safe: state.safe.clone(),
            sync_timeout: state.sync_timeout,
            socket_timeout: state.socket_timeout,
            default_db: state.default_db.clone(),
            dial_credential: state.dial_credential.clone(),
            credentials,
            server_tags: state.server_tags.clone(),
        }))
    }

    /// Releases reserved sockets and the cluster. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.cluster.take().is_some() {
            state.binding.release_all();
            tracing::debug!(session = %self.id, "session closed");
        }
    }

    /// Returns true once the session is closed.
    pub fn is_closed(&self) -> bool {
        self.state.read().cluster.is_none()
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Releases reserved sockets and restores the mode's default for
    /// secondary reads.
    pub fn refresh(&self) {
        let mut state = self.state.write();
        state.consistency.refresh();
        state.binding.release_all();
    }

    /// Changes the consistency mode.
    ///
    /// With `refresh`, reserved sockets are released as in
    /// [`refresh`](Self::refresh). Without it, a reserved primary is kept and
    /// a reserved secondary is dropped when entering Strong mode.
    pub fn set_mode(&self, mode: Mode, refresh: bool) {
        let mut state = self.state.write();
        let has_master = state.binding.has_master();
        match state.consistency.set_mode(mode, refresh, has_master) {
            Release::All => state.binding.release_all(),
            Release::Secondary => state.binding.release_slave(),
            Release::Nothing => {}
        }
        tracing::debug!(session = %self.id, %mode, refresh, "mode changed");
    }

    /// Returns the consistency mode.
    pub fn mode(&self) -> Mode {
        self.state.read().consistency.mode()
    }

    /// Returns true if reads may currently go to a secondary.
    pub fn slave_ok(&self) -> bool {
        self.state.read().consistency.slave_ok()
    }

    /// Returns the addresses of the reserved primary and secondary sockets.
    pub fn reserved_servers(&self) -> (Option<String>, Option<String>) {
        let state = self.state.read();
        (state.binding.master_addr(), state.binding.slave_addr())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Sets how long to wait for a suitable server. Zero waits forever.
    pub fn set_sync_timeout(&self, timeout: Duration) {
        self.state.write().sync_timeout = timeout;
    }

    /// Sets the round-trip timeout, including on reserved sockets.
    pub fn set_socket_timeout(&self, timeout: Duration) {
        let mut state = self.state.write();
        state.socket_timeout = timeout;
        state.binding.set_timeout(timeout);
    }

    /// Controls the server-side idle cursor timeout. Only zero, which
    /// disables the timeout, is supported.
    pub fn set_cursor_timeout(&self, timeout: Duration) -> ClientResult<()> {
        if !timeout.is_zero() {
            return Err(ClientError::InvalidArgument(
                "set_cursor_timeout: only 0 (disable timeout) supported".to_string(),
            ));
        }
        self.state.write().query.flags |= QueryFlags::NO_CURSOR_TIMEOUT;
        Ok(())
    }

    /// Sets the default batch size. A batch of one is sent as two, since the
    /// server treats one as a single-batch request.
    pub fn set_batch(&self, n: i32) {
        self.state.write().query.batch = if n == 1 { 2 } else { n };
    }

    /// Sets the default prefetch ratio.
    pub fn set_prefetch(&self, p: f64) {
        self.state.write().query.prefetch = p;
    }

    /// Restricts secondary selection to servers matching one of `tags`.
    pub fn select_servers(&self, tags: Vec<Document>) {
        self.state.write().server_tags = tags;
    }

    /// Returns the acknowledgement settings, or `None` for unacknowledged
    /// writes.
    pub fn safe(&self) -> Option<Safe> {
        self.state.read().safe.as_ref().map(GetLastError::to_safe)
    }

    /// Replaces the acknowledgement settings. `None` disables acknowledgement.
    pub fn set_safe(&self, safe: Option<Safe>) {
        let mut state = self.state.write();
        state.safe = None;
        if let Some(safe) = safe {
            merge_safe(&mut state.safe, &safe);
        }
    }

    /// Merges `safe` into the acknowledgement settings, keeping the stricter
    /// requirement of each field.
    pub fn ensure_safe(&self, safe: &Safe) {
        merge_safe(&mut self.state.write().safe, safe);
    }

    // =========================================================================
    // Databases and Commands
    // =========================================================================

    /// Returns a handle to database `name`. An empty name selects the
    /// default database.
    pub fn db(&self, name: &str) -> Database<'_> {
        let name = if name.is_empty() {
            self.state.read().default_db.clone()
        } else {
            name.to_string()
        };
        Database::new(self, name)
    }

    /// Runs a command against the `admin` database.
    pub async fn run<T: DeserializeOwned>(&self, cmd: impl Into<Command>) -> ClientResult<T> {
        self.db(AUTH_DATABASE).run(cmd).await
    }

    /// Checks that a server answers.
    pub async fn ping(&self) -> ClientResult<()> {
        self.run::<Document>(doc! { "ping": 1 }).await.map(|_| ())
    }

    /// Flushes pending writes to disk. With `async_flush` the server returns
    /// before the flush completes.
    pub async fn fsync(&self, async_flush: bool) -> ClientResult<()> {
        self.run::<Document>(doc! { "fsync": 1, "async": async_flush })
            .await
            .map(|_| ())
    }

    /// Flushes and blocks writes on the server.
    pub async fn fsync_lock(&self) -> ClientResult<()> {
        self.run::<Document>(doc! { "fsync": 1, "lock": true })
            .await
            .map(|_| ())
    }

    /// Releases a lock taken by [`fsync_lock`](Self::fsync_lock).
    pub async fn fsync_unlock(&self) -> ClientResult<()> {
        self.db(AUTH_DATABASE)
            .c("$cmd.sys.unlock")
            .find(Document::new())
            .one::<Document>()
            .await
            .map(|_| ())
    }

    /// Returns build details of the server.
    pub async fn build_info(&self) -> ClientResult<BuildInfo> {
        let mut info: BuildInfo = self.run("buildInfo").await?;
        if info.version_array.len() < 4 {
            info.version_array.resize(4, 0);
        }
        Ok(info)
    }

    /// Returns the names of non-empty databases, sorted.
    pub async fn database_names(&self) -> ClientResult<Vec<String>> {
        let result: ListDatabasesResult = self.run("listDatabases").await?;
        let mut names: Vec<String> = result
            .databases
            .into_iter()
            .filter(|db| !db.empty)
            .map(|db| db.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Returns the addresses of the servers currently reachable.
    pub fn live_servers(&self) -> Vec<String> {
        match &self.state.read().cluster {
            Some(cluster) => cluster.live_servers(),
            None => Vec::new(),
        }
    }

    /// Returns a query for the document a reference points to. The
    /// reference must name its database.
    pub fn find_ref(&self, dbref: &DbRef) -> ClientResult<Query<'_>> {
        match &dbref.database {
            Some(db) if !db.is_empty() => {
                Ok(self.db(db).c(&dbref.collection).find_id(dbref.id.clone()))
            }
            _ => Err(ClientError::InvalidArgument(
                "can't resolve database for reference".to_string(),
            )),
        }
    }

    /// Forgets every index known to exist, for all sessions on the cluster.
    pub fn reset_index_cache(&self) {
        if let Some(cluster) = &self.state.read().cluster {
            cluster.index_cache().clear();
        }
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Authenticates with `credential` and remembers it for every socket the
    /// session acquires afterwards.
    pub async fn login(&self, credential: Credential) -> ClientResult<()> {
        let socket = self.acquire_socket(true).await?;
        socket.login(&credential).await?;
        let mut state = self.state.write();
        state.credentials.retain(|c| c.source != credential.source);
        state.credentials.push(credential);
        Ok(())
    }

    /// Drops the credentials for `db`.
    pub async fn logout(&self, db: &str) {
        let sockets = {
            let mut state = self.state.write();
            let before = state.credentials.len();
            state.credentials.retain(|c| c.source != db);
            if before == state.credentials.len() {
                return;
            }
            state.binding.sockets()
        };
        for socket in sockets {
            socket.logout(db).await;
        }
    }

    /// Drops every credential.
    pub async fn logout_all(&self) {
        let (sockets, credentials) = {
            let mut state = self.state.write();
            (state.binding.sockets(), std::mem::take(&mut state.credentials))
        };
        for credential in &credentials {
            for socket in &sockets {
                socket.logout(&credential.source).await;
            }
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Returns a socket for the next operation.
    ///
    /// A reserved socket is reused when the consistency state allows it.
    /// Otherwise a new socket is requested from the cluster, logged in with
    /// every credential, and reserved unless the session is in Eventual mode
    /// without a pinned secondary.
    pub(crate) async fn acquire_socket(&self, accepts_secondary: bool) -> ClientResult<Socket> {
        {
            let state = self.state.read();
            state.cluster()?;
            if let Some(socket) = state.usable_socket(accepts_secondary) {
                return Ok(socket);
            }
        }

        let _guard = self.acquire_lock.lock().await;

        let (cluster, prefer_secondary, sync_timeout, socket_timeout, tags) = {
            let state = self.state.read();
            let cluster = state.cluster()?;
            if let Some(socket) = state.usable_socket(accepts_secondary) {
                return Ok(socket);
            }
            (
                cluster,
                state.consistency.allows_secondary(accepts_secondary),
                state.sync_timeout,
                state.socket_timeout,
                state.server_tags.clone(),
            )
        };

        let socket = cluster
            .acquire_socket(prefer_secondary, sync_timeout, socket_timeout, &tags)
            .await?;
        self.socket_login(&socket).await?;

        let mut state = self.state.write();
        if state.cluster.is_none() {
            return Err(ClientError::SessionClosed);
        }
        let has_slave = state.binding.has_slave();
        if state.consistency.should_reserve(has_slave) {
            state.binding.reserve(socket.clone());
            tracing::debug!(session = %self.id, addr = %socket.addr(), "reserved socket");
        }
        state.consistency.note_primary_required(accepts_secondary);
        Ok(socket)
    }

    /// Logs `socket` in with every credential of the session.
    pub(crate) async fn socket_login(&self, socket: &Socket) -> ClientResult<()> {
        let credentials = self.state.read().credentials.clone();
        for credential in &credentials {
            socket.login(credential).await?;
        }
        Ok(())
    }

    pub(crate) fn cluster(&self) -> ClientResult<Arc<dyn Cluster>> {
        self.state.read().cluster()
    }

    pub(crate) fn socket_timeout(&self) -> Duration {
        self.state.read().socket_timeout
    }

    pub(crate) fn query_defaults(&self) -> QueryDefaults {
        self.state.read().query.clone()
    }

    pub(crate) fn slave_ok_flag(&self) -> QueryFlags {
        self.state.read().consistency.query_flags()
    }

    pub(crate) fn safe_op(&self) -> Option<GetLastError> {
        self.state.read().safe.clone()
    }
}

fn merge_safe(current: &mut Option<GetLastError>, safe: &Safe) {
    match current {
        Some(cmd) => cmd.merge(safe),
        None => *current = Some(GetLastError::from_safe(safe)),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &state.consistency.mode())
            .field("slave_ok", &state.consistency.slave_ok())
            .field("closed", &state.cluster.is_none())
            .field("default_db", &state.default_db)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    #[test]
    fn test_session_ids_are_unique() {
        let network = MemoryNetwork::single();
        let a = network.session(Mode::Strong);
        let b = network.session(Mode::Strong);
        assert_ne!(a.id(), b.id());
        assert!(b.id().as_u64() > a.id().as_u64());
    }

    #[test]
    fn test_query_defaults() {
        let session = MemoryNetwork::single().session(Mode::Strong);
        session.set_batch(1);
        assert_eq!(session.query_defaults().batch, 2);
        session.set_batch(50);
        session.set_prefetch(0.5);
        let defaults = session.query_defaults();
        assert_eq!(defaults.batch, 50);
        assert_eq!(defaults.prefetch, 0.5);
    }

    #[test]
    fn test_cursor_timeout_only_zero() {
        let session = MemoryNetwork::single().session(Mode::Strong);
        assert!(matches!(
            session.set_cursor_timeout(Duration::from_secs(1)),
            Err(ClientError::InvalidArgument(_))
        ));
        session.set_cursor_timeout(Duration::ZERO).unwrap();
        assert!(session
            .query_defaults()
            .flags
            .contains(QueryFlags::NO_CURSOR_TIMEOUT));
    }

    #[test]
    fn test_default_database() {
        let session = MemoryNetwork::single().session(Mode::Strong);
        assert_eq!(session.db("").name(), DEFAULT_DATABASE);
        assert_eq!(session.db("app").name(), "app");
    }

    #[test]
    fn test_slave_ok_flag_follows_mode() {
        let session = MemoryNetwork::single().session(Mode::Eventual);
        assert_eq!(session.slave_ok_flag(), QueryFlags::SLAVE_OK);
        session.set_mode(Mode::Strong, false);
        assert_eq!(session.slave_ok_flag(), QueryFlags::NONE);
    }

    #[test]
    fn test_set_safe_none_disables_acknowledgement() {
        let session = MemoryNetwork::single().session(Mode::Strong);
        assert!(session.safe_op().is_some());
        session.set_safe(None);
        assert!(session.safe_op().is_none());
        session.ensure_safe(&Safe::w(2));
        assert_eq!(session.safe().map(|s| s.w), Some(2));
    }

    #[tokio::test]
    async fn test_clone_shares_reserved_socket() {
        let network = MemoryNetwork::single();
        let session = network.session(Mode::Strong);
        let socket = session.acquire_socket(false).await.unwrap();
        let clone = session.clone_session().unwrap();
        let shared = clone.acquire_socket(false).await.unwrap();
        assert_eq!(socket.addr(), shared.addr());
        assert_eq!(network.stats("localhost").connections, 1);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let session = MemoryNetwork::single().session(Mode::Strong);
        session.close();
        assert!(matches!(
            session.acquire_socket(true).await,
            Err(ClientError::SessionClosed)
        ));
        assert!(session.find_ref(&DbRef::new("c", 1)).is_err());
    }
}
