//! # lodestar-client
//!
//! Client driver for replicated document databases.
//!
//! This crate is the session layer of a driver for a replica set of
//! document servers. It includes:
//!
//! - **Sessions**: Eventual, Monotonic and Strong consistency with socket
//!   reservation per session
//! - **Acknowledged Writes**: writes paired with `getLastError` on the same
//!   socket, with merged write-concern settings
//! - **Queries and Cursors**: a fluent query builder and batched cursors with
//!   prefetching, limits and tailable iteration
//! - **Index Cache**: ensured indexes remembered per cluster
//! - **Memory Backend**: an in-process replica set for tests and embedding
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bson::doc;
//! use lodestar_client::{MemoryNetwork, Mode, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::single();
//!     let session = Session::dial("localhost", &network).await?;
//!
//!     let people = session.db("app").c("people");
//!     people.insert(&[doc! { "name": "Ada", "age": 36 }]).await?;
//!
//!     let ada: bson::Document = people.find(doc! { "name": "Ada" }).one().await?;
//!     println!("found {}", ada);
//!
//!     // Read from secondaries until the first write
//!     session.set_mode(Mode::Monotonic, true);
//!     let adults = people.find(doc! { "age": { "$gte": 18 } }).sort(&["-age"]).count().await?;
//!     println!("{} adults", adults);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Cursors
//!
//! ```rust,ignore
//! let query = people.find(doc! {});
//! query.batch(100).limit(1000);
//! let mut cursor = query.iter().await;
//! while let Some(person) = cursor.next::<bson::Document>().await {
//!     println!("{}", person);
//! }
//! cursor.close().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types.
pub mod error;

/// Typed wire operations and the connection contract.
pub mod wire;

/// Reference-counted socket handles.
pub mod socket;

/// Per-server connection pool.
pub mod pool;

/// Cluster contract.
pub mod cluster;

/// Dial configuration and connection strings.
pub mod config;

/// Write acknowledgement settings.
pub mod safe;

/// Index keys, specs and the index cache.
pub mod index;

/// Sessions and consistency modes.
pub mod session;

/// Database handles.
pub mod database;

/// Collection handles.
pub mod collection;

/// Query builder.
pub mod query;

/// Result cursors.
pub mod cursor;

/// In-memory replica set.
pub mod memory;

// Re-exports
pub use cluster::{Cluster, Connector};
pub use collection::{Change, ChangeInfo, Collection, Pipe};
pub use config::{DialInfo, DEFAULT_PORT};
pub use cursor::Cursor;
pub use database::{Command, Database, DbRef};
pub use error::{is_dup, ClientError, ClientResult, LastError, QueryError};
pub use index::{parse_index_key, simple_index_key, Index, IndexCache, IndexCacheStats, IndexSpec};
pub use memory::{MemoryCluster, MemoryNetwork, RequestStats};
pub use pool::{Dialer, PoolConfig, PoolStats, ServerPool};
pub use query::Query;
pub use safe::{GetLastError, Safe, WriteConcern};
pub use session::{BuildInfo, Mode, Session, SessionId};
pub use socket::Socket;
pub use wire::{Connection, Credential, QueryFlags, ServerInfo};
