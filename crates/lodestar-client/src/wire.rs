//! Typed wire operations and the connection contract.
//!
//! The driver never encodes messages itself. It hands typed operations to a
//! [`Connection`], which delivers each reply document back over the channel
//! carried by the operation.

use std::fmt;
use std::future::Future;
use std::ops::{BitOr, BitOrAssign};
use std::pin::Pin;
use std::time::Duration;

use bson::{Document, RawDocumentBuf};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ClientError, ClientResult};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sending half of a reply channel.
pub type ReplySender = mpsc::UnboundedSender<ReplyEvent>;

/// Receiving half of a reply channel.
pub type ReplyReceiver = mpsc::UnboundedReceiver<ReplyEvent>;

/// Creates a reply channel.
pub fn reply_channel() -> (ReplySender, ReplyReceiver) {
    mpsc::unbounded_channel()
}

/// Query flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// No flags.
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Keep the cursor open at the end of the data.
    pub const TAILABLE: QueryFlags = QueryFlags(1 << 1);
    /// Allow the query to run on a secondary.
    pub const SLAVE_OK: QueryFlags = QueryFlags(1 << 2);
    /// Replay an oplog collection from a timestamp.
    pub const LOG_REPLAY: QueryFlags = QueryFlags(1 << 3);
    /// Disable the server-side idle cursor timeout.
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(1 << 4);
    /// Block on the server for a while instead of returning no data.
    pub const AWAIT_DATA: QueryFlags = QueryFlags(1 << 5);

    /// Returns the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if all bits of `other` are set.
    pub fn contains(&self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        QueryFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Query modifiers sent alongside the filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Sort document.
    pub order_by: Option<Document>,
    /// Index hint.
    pub hint: Option<Document>,
    /// Return the query plan instead of results.
    pub explain: bool,
    /// Use snapshot mode.
    pub snapshot: bool,
}

impl QueryOptions {
    /// Returns true if any modifier is set.
    pub fn is_empty(&self) -> bool {
        self.order_by.is_none() && self.hint.is_none() && !self.explain && !self.snapshot
    }
}

/// A query operation.
#[derive(Clone)]
pub struct QueryOp {
    /// Full namespace, `db.collection`.
    pub collection: String,
    /// Filter or command document.
    pub query: Document,
    /// Documents to skip.
    pub skip: i32,
    /// Batch size; negative requests a single batch.
    pub limit: i32,
    /// Projection.
    pub selector: Option<Document>,
    /// Query flags.
    pub flags: QueryFlags,
    /// Query modifiers.
    pub options: QueryOptions,
    /// Where reply documents are delivered.
    pub reply: Option<ReplySender>,
}

impl QueryOp {
    /// Creates a query against `collection`.
    pub fn new(collection: impl Into<String>, query: Document) -> Self {
        Self {
            collection: collection.into(),
            query,
            skip: 0,
            limit: 0,
            selector: None,
            flags: QueryFlags::NONE,
            options: QueryOptions::default(),
            reply: None,
        }
    }

    /// Returns true if the query targets a command namespace.
    pub fn is_command(&self) -> bool {
        self.collection.ends_with(".$cmd")
    }
}

impl fmt::Debug for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOp")
            .field("collection", &self.collection)
            .field("query", &self.query)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("flags", &self.flags)
            .field("options", &self.options)
            .finish()
    }
}

/// Requests the next batch of an open cursor.
#[derive(Debug, Clone)]
pub struct GetMoreOp {
    /// Full namespace.
    pub collection: String,
    /// Batch size.
    pub limit: i32,
    /// Server cursor id.
    pub cursor_id: i64,
    /// Where reply documents are delivered.
    pub reply: Option<ReplySender>,
}

/// Update flags.
pub mod update_flags {
    /// Insert when nothing matches.
    pub const UPSERT: u32 = 1;
    /// Update every matching document.
    pub const MULTI: u32 = 2;
}

/// Delete flags.
pub mod delete_flags {
    /// Remove at most one document.
    pub const SINGLE: u32 = 1;
}

/// A typed wire operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Query or command.
    Query(QueryOp),
    /// Next batch of a cursor.
    GetMore(GetMoreOp),
    /// Kill server cursors.
    KillCursors {
        /// Cursor ids to kill.
        cursor_ids: Vec<i64>,
    },
    /// Insert documents.
    Insert {
        /// Full namespace.
        collection: String,
        /// Documents to insert.
        documents: Vec<Document>,
    },
    /// Update documents.
    Update {
        /// Full namespace.
        collection: String,
        /// Filter.
        selector: Document,
        /// Replacement or modifier document.
        update: Document,
        /// See [`update_flags`].
        flags: u32,
    },
    /// Delete documents.
    Delete {
        /// Full namespace.
        collection: String,
        /// Filter.
        selector: Document,
        /// See [`delete_flags`].
        flags: u32,
    },
}

impl Op {
    /// Returns the operation kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Query(_) => "query",
            Op::GetMore(_) => "get_more",
            Op::KillCursors { .. } => "kill_cursors",
            Op::Insert { .. } => "insert",
            Op::Update { .. } => "update",
            Op::Delete { .. } => "delete",
        }
    }
}

/// One event delivered for a query or get-more reply.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    /// A reply document.
    Document {
        /// Cursor id reported by the reply.
        cursor_id: i64,
        /// Position of this document in its reply.
        doc_num: i32,
        /// Number of documents in the reply.
        reply_docs: i32,
        /// Encoded document.
        data: RawDocumentBuf,
    },
    /// A reply carrying no documents.
    Empty {
        /// Cursor id reported by the reply.
        cursor_id: i64,
    },
    /// The request failed.
    Failed(ClientError),
}

/// Identity and role of a server as seen by a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    /// Server address, `host:port`.
    pub addr: String,
    /// Whether the server is the primary.
    pub master: bool,
    /// Server tags used for secondary selection.
    pub tags: Document,
}

impl ServerInfo {
    /// Returns true if every key/value of every tag set in `tags` matches,
    /// or if no tag sets are given. Any one matching set is enough.
    pub fn matches_tags(&self, tags: &[Document]) -> bool {
        if tags.is_empty() {
            return true;
        }
        tags.iter()
            .any(|set| set.iter().all(|(k, v)| self.tags.get(k) == Some(v)))
    }
}

/// Credentials for one database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Database the user is defined in.
    pub source: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credential {
    /// Creates a credential.
    pub fn new(
        source: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A wire-level connection to one server.
///
/// Implementations deliver replies in receipt order on the channel carried by
/// each query or get-more operation.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Returns the server this connection talks to.
    fn server(&self) -> ServerInfo;

    /// Sends operations as one unit.
    fn send(&self, ops: Vec<Op>) -> BoxFuture<'_, ClientResult<()>>;

    /// Authenticates the connection. Repeating a login is a no-op.
    fn login<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, ClientResult<()>>;

    /// Drops the authentication for `db`.
    fn logout<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()>;

    /// Sets the round-trip timeout.
    fn set_timeout(&self, timeout: Duration);

    /// Returns false once the connection is unusable.
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_query_flags() {
        let mut flags = QueryFlags::TAILABLE | QueryFlags::AWAIT_DATA;
        assert!(flags.contains(QueryFlags::TAILABLE));
        assert!(!flags.contains(QueryFlags::SLAVE_OK));
        flags |= QueryFlags::SLAVE_OK;
        assert!(flags.contains(QueryFlags::SLAVE_OK));
        assert_eq!(flags.bits(), 2 | 4 | 32);
    }

    #[test]
    fn test_matches_tags() {
        let info = ServerInfo {
            addr: "a:27017".into(),
            master: false,
            tags: doc! { "dc": "east", "rack": "1" },
        };
        assert!(info.matches_tags(&[]));
        assert!(info.matches_tags(&[doc! { "dc": "east" }]));
        assert!(!info.matches_tags(&[doc! { "dc": "west" }]));
        assert!(info.matches_tags(&[doc! { "dc": "west" }, doc! { "rack": "1" }]));
    }

    #[test]
    fn test_credential_debug_hides_password() {
        let cred = Credential::new("admin", "root", "secret");
        let shown = format!("{:?}", cred);
        assert!(shown.contains("root"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_command_namespace() {
        assert!(QueryOp::new("admin.$cmd", doc! { "ping": 1 }).is_command());
        assert!(!QueryOp::new("db.users", doc! {}).is_command());
    }
}
