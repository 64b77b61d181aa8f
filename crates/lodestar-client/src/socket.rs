//! Reference-counted socket handles.
//!
//! A [`Socket`] is a scoped handle over one pooled connection. Clones share
//! the same connection; the connection returns to its server pool when the
//! last clone is dropped, on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::RawDocumentBuf;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{ClientError, ClientResult};
use crate::pool::{PooledConnection, ServerPool};
use crate::wire::{
    reply_channel, Connection, Credential, Op, QueryOp, ReplyEvent, ReplyReceiver, ServerInfo,
};

/// A shared handle to a pooled connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    use_count: u64,
    timeout: Mutex<Duration>,
    pool: Arc<ServerPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.pool.release(PooledConnection::returned(
            Arc::clone(&self.conn),
            self.created_at,
            self.use_count,
        ));
    }
}

impl Socket {
    pub(crate) fn new(
        pool: Arc<ServerPool>,
        conn: PooledConnection,
        permit: OwnedSemaphorePermit,
        timeout: Duration,
    ) -> Self {
        conn.connection.set_timeout(timeout);
        Self {
            inner: Arc::new(SocketInner {
                conn: conn.connection,
                created_at: conn.created_at,
                use_count: conn.use_count,
                timeout: Mutex::new(timeout),
                pool,
                _permit: permit,
            }),
        }
    }

    /// Returns the server this socket is connected to.
    pub fn server(&self) -> ServerInfo {
        self.inner.conn.server()
    }

    /// Returns the server address.
    pub fn addr(&self) -> String {
        self.inner.conn.server().addr
    }

    /// Returns the number of live handles sharing this connection.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns true if both handles share one connection.
    pub fn same(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the round-trip timeout. Zero waits forever.
    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    /// Sets the round-trip timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.timeout.lock() = timeout;
        self.inner.conn.set_timeout(timeout);
    }

    /// Sends operations as one unit.
    pub async fn send(&self, ops: Vec<Op>) -> ClientResult<()> {
        if let Some(op) = ops.first() {
            tracing::trace!(
                addr = %self.addr(),
                kind = op.kind(),
                count = ops.len(),
                "sending operations"
            );
        }
        self.inner.conn.send(ops).await
    }

    /// Authenticates the connection with `credential`.
    pub async fn login(&self, credential: &Credential) -> ClientResult<()> {
        self.inner.conn.login(credential).await
    }

    /// Drops the authentication for `db`.
    pub async fn logout(&self, db: &str) {
        self.inner.conn.logout(db).await
    }

    /// Runs a single-document query and returns the first reply document.
    pub async fn simple_query(&self, mut op: QueryOp) -> ClientResult<Option<RawDocumentBuf>> {
        let (tx, mut rx) = reply_channel();
        op.reply = Some(tx);
        self.send(vec![Op::Query(op)]).await?;
        match self.await_reply(&mut rx).await? {
            ReplyEvent::Document { data, .. } => Ok(Some(data)),
            ReplyEvent::Empty { .. } => Ok(None),
            ReplyEvent::Failed(e) => Err(e),
        }
    }

    /// Waits for the next reply event, bounded by the socket timeout.
    pub(crate) async fn await_reply(&self, rx: &mut ReplyReceiver) -> ClientResult<ReplyEvent> {
        let timeout = self.timeout();
        let event = if timeout.is_zero() {
            rx.recv().await
        } else {
            tokio::time::timeout(timeout, rx.recv())
                .await
                .map_err(|_| ClientError::Timeout(timeout.as_millis() as u64))?
        };
        event.ok_or(ClientError::ConnectionClosed)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("server", &self.addr())
            .field("refs", &self.ref_count())
            .finish()
    }
}
