//! Error types for the driver.
//!
//! Errors fall into a handful of families: the not-found sentinel, errors the
//! server embedded in a reply document, write-acknowledgement failures, usage
//! errors, and transport or authentication failures. Transport failures are
//! never retried internally.

use std::fmt;

use bson::{Bson, Document, RawBsonRef, RawDocument};
use thiserror::Error;

/// Error codes reported by the server for duplicate key violations.
const DUP_KEY_CODES: [i32; 3] = [11000, 11001, 12582];

/// Driver error type.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// No document matched the query or write.
    #[error("not found")]
    NotFound,

    /// The server reported an error inside a reply document.
    #[error(transparent)]
    Query(QueryError),

    /// The write acknowledgement reported an error.
    #[error(transparent)]
    LastError(LastError),

    /// The session was used after being closed.
    #[error("session already closed")]
    SessionClosed,

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration or connection string.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No server suitable for the request could be reached.
    #[error("no reachable servers")]
    NoReachableServers,

    /// Pool exhausted or closed.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Pool timeout.
    #[error("pool acquisition timeout after {0}ms")]
    PoolTimeout(u64),

    /// The server no longer knows the cursor.
    #[error("cursor {0} not found")]
    CursorNotFound(i64),

    /// Document encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for driver operations.
pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Returns true for the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
    }

    /// Returns the server error code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Query(e) => Some(e.code),
            ClientError::LastError(e) => Some(e.code),
            _ => None,
        }
    }

    /// Returns true if the error reports a duplicate key violation.
    pub fn is_dup(&self) -> bool {
        self.code().map_or(false, |code| DUP_KEY_CODES.contains(&code))
    }
}

/// Returns true if `err` reports a duplicate key violation.
pub fn is_dup(err: &ClientError) -> bool {
    err.is_dup()
}

impl From<bson::de::Error> for ClientError {
    fn from(e: bson::de::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

impl From<bson::ser::Error> for ClientError {
    fn from(e: bson::ser::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

impl From<bson::raw::Error> for ClientError {
    fn from(e: bson::raw::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

/// An error the server embedded in a query or command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryError {
    /// Numeric error code.
    pub code: i32,
    /// Error message.
    pub message: String,
    /// Whether the server reported this as an assertion.
    pub assertion: bool,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for QueryError {}

/// Outcome of a write acknowledgement.
///
/// Returned as an error when `err` is non-empty; otherwise its counters
/// feed [`ChangeInfo`](crate::ChangeInfo).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastError {
    /// Error message, empty on success.
    pub err: String,
    /// Error code.
    pub code: i32,
    /// Number of documents affected.
    pub n: i64,
    /// Milliseconds spent waiting for replication.
    pub waited: i64,
    /// Number of files synced when fsync was requested.
    pub fsync_files: i64,
    /// Whether replication timed out.
    pub wtimeout: bool,
    /// Whether an update touched an existing document.
    pub updated_existing: bool,
    /// Identifier of the document inserted by an upsert.
    pub upserted_id: Option<Bson>,
}

impl LastError {
    /// Decodes an acknowledgement reply.
    pub fn from_document(doc: &Document) -> Self {
        Self {
            err: doc.get_str("err").unwrap_or_default().to_string(),
            code: int_field(doc, "code") as i32,
            n: int_field(doc, "n"),
            waited: int_field(doc, "waited"),
            fsync_files: int_field(doc, "fsyncFiles"),
            wtimeout: doc.get_bool("wtimeout").unwrap_or(false),
            updated_existing: doc.get_bool("updatedExisting").unwrap_or(false),
            upserted_id: doc.get("upserted").filter(|v| !matches!(v, Bson::Null)).cloned(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.err)
    }
}

impl std::error::Error for LastError {}

/// Reads a numeric field regardless of its stored width.
pub(crate) fn int_field(doc: &Document, key: &str) -> i64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => *v as i64,
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Double(v)) => *v as i64,
        Some(Bson::Boolean(v)) => *v as i64,
        _ => 0,
    }
}

/// Returns true if the reply carries a string `errmsg` field.
pub(crate) fn has_errmsg(raw: &RawDocument) -> bool {
    matches!(raw.get("errmsg"), Ok(Some(RawBsonRef::String(_))))
}

/// Extracts the error embedded in a reply document, if any.
///
/// A leading `$err` field always signals an error. Replies from a `.$cmd`
/// namespace also signal one through a top-level `errmsg` field; an `errmsg`
/// nested in a sub-document of a successful reply is data, not an error.
pub(crate) fn check_query_error(namespace: &str, raw: &RawDocument) -> Option<ClientError> {
    let leading_err = matches!(
        raw.iter().next(),
        Some(Ok(("$err", RawBsonRef::String(_))))
    );
    if !leading_err && !(namespace.ends_with(".$cmd") && has_errmsg(raw)) {
        return None;
    }

    let doc: Document = match bson::from_slice(raw.as_bytes()) {
        Ok(doc) => doc,
        Err(e) => return Some(e.into()),
    };
    if let Ok(last) = doc.get_document("lastErrorObject") {
        return Some(ClientError::LastError(LastError::from_document(last)));
    }

    let err = doc.get_str("$err").unwrap_or_default();
    let errmsg = doc.get_str("errmsg").unwrap_or_default();
    if err.is_empty() && errmsg.is_empty() {
        return None;
    }
    let assertion = doc.get_str("assertion").unwrap_or_default();
    let assertion_code = int_field(&doc, "assertionCode") as i32;
    let query_error = if assertion_code != 0 && !assertion.is_empty() {
        QueryError {
            code: assertion_code,
            message: assertion.to_string(),
            assertion: true,
        }
    } else {
        QueryError {
            code: int_field(&doc, "code") as i32,
            message: (if err.is_empty() { errmsg } else { err }).to_string(),
            assertion: false,
        }
    };
    Some(ClientError::Query(query_error))
}
