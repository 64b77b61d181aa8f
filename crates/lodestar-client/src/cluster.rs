//! Cluster contract.
//!
//! Topology discovery and server monitoring live behind [`Cluster`]. The
//! session layer only asks it for sockets, live server addresses and the
//! shared index cache. Sessions keep the cluster alive through `Arc`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;

use crate::config::DialInfo;
use crate::error::ClientResult;
use crate::index::IndexCache;
use crate::socket::Socket;
use crate::wire::BoxFuture;

/// A replica set as seen by the driver.
pub trait Cluster: Send + Sync + fmt::Debug {
    /// Acquires a socket.
    ///
    /// With `prefer_secondary` unset only the primary qualifies. Otherwise a
    /// secondary matching one of `tags` is preferred, falling back to the
    /// primary. Waits up to `sync_timeout` for a suitable server; zero waits
    /// forever.
    fn acquire_socket<'a>(
        &'a self,
        prefer_secondary: bool,
        sync_timeout: Duration,
        socket_timeout: Duration,
        tags: &'a [Document],
    ) -> BoxFuture<'a, ClientResult<Socket>>;

    /// Acquires a socket to the server at `addr`.
    fn acquire_server_socket<'a>(
        &'a self,
        addr: &'a str,
        socket_timeout: Duration,
    ) -> BoxFuture<'a, ClientResult<Socket>>;

    /// Returns the addresses of the servers currently reachable.
    fn live_servers(&self) -> Vec<String>;

    /// Returns the index cache shared by every session on this cluster.
    fn index_cache(&self) -> &IndexCache;
}

/// Builds clusters from dial information.
pub trait Connector: Send + Sync {
    /// Connects to the servers named in `info`.
    fn connect<'a>(&'a self, info: &'a DialInfo) -> BoxFuture<'a, ClientResult<Arc<dyn Cluster>>>;
}
