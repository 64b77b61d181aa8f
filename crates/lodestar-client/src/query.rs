//! Query builder.
//!
//! A [`Query`] accumulates filter, projection, sort, skip, limit and options
//! under its own lock, so one query can be shared before it runs. Running a
//! query snapshots its settings; later changes do not affect a cursor already
//! in flight. Bad sort or hint keys are remembered and reported when the
//! query runs.

use std::fmt;
use std::time::Duration;

use bson::{doc, Bson, Document};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::collection::{Change, ChangeInfo};
use crate::cursor::Cursor;
use crate::error::{check_query_error, int_field, ClientError, ClientResult, LastError};
use crate::index::parse_index_key;
use crate::session::{Mode, Session};
use crate::wire::{QueryFlags, QueryOp};

/// Query settings captured when the query runs.
#[derive(Debug, Clone)]
pub(crate) struct QuerySpec {
    /// The wire operation, without a reply channel.
    pub op: QueryOp,
    /// Client-side cap on returned documents; zero means none.
    pub limit: i32,
    /// Prefetch ratio.
    pub prefetch: f64,
    /// Error from a modifier, reported on execution.
    pub error: Option<ClientError>,
}

impl QuerySpec {
    /// Splits the namespace into database and collection names.
    pub(crate) fn split_namespace(&self) -> ClientResult<(String, String)> {
        split_namespace(&self.op.collection)
    }
}

/// Splits `db.collection` at the first dot.
pub(crate) fn split_namespace(namespace: &str) -> ClientResult<(String, String)> {
    match namespace.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {
            Ok((db.to_string(), coll.to_string()))
        }
        _ => Err(ClientError::InvalidArgument(format!(
            "bad collection name: {}",
            namespace
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct DistinctResult<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

/// A query against one collection.
pub struct Query<'s> {
    session: &'s Session,
    spec: Mutex<QuerySpec>,
}

impl<'s> Query<'s> {
    pub(crate) fn new(session: &'s Session, namespace: &str, filter: Document) -> Self {
        let defaults = session.query_defaults();
        let mut op = QueryOp::new(namespace, filter);
        op.limit = defaults.batch;
        op.flags = defaults.flags;
        Self::from_spec(
            session,
            QuerySpec {
                op,
                limit: 0,
                prefetch: defaults.prefetch,
                error: None,
            },
        )
    }

    fn from_spec(session: &'s Session, spec: QuerySpec) -> Self {
        Self {
            session,
            spec: Mutex::new(spec),
        }
    }

    /// Returns the namespace the query targets.
    pub fn namespace(&self) -> String {
        self.spec.lock().op.collection.clone()
    }

    // =========================================================================
    // Modifiers
    // =========================================================================

    /// Sets the batch size. A batch of one is sent as two, since the server
    /// treats one as a single-batch request.
    pub fn batch(&self, n: i32) -> &Self {
        let n = if n == 1 { 2 } else { n };
        self.spec.lock().op.limit = n;
        self
    }

    /// Sets how much of a batch may remain queued before the next batch is
    /// requested, as a fraction of the batch size.
    pub fn prefetch(&self, p: f64) -> &Self {
        self.spec.lock().prefetch = p;
        self
    }

    /// Skips the first `n` documents.
    pub fn skip(&self, n: i32) -> &Self {
        self.spec.lock().op.skip = n;
        self
    }

    /// Caps the number of documents returned.
    ///
    /// One requests a single document and closes the cursor. Any other
    /// negative value requests a single batch of that size. A positive value
    /// caps results across as many batches as needed.
    pub fn limit(&self, n: i32) -> &Self {
        let mut spec = self.spec.lock();
        let (limit, wire) = match n {
            1 => (1, -1),
            i32::MIN => (i32::MAX, i32::MIN + 1),
            n if n < 0 => (-n, n),
            n => (n, n),
        };
        spec.limit = limit;
        spec.op.limit = wire;
        self
    }

    /// Restricts the fields returned.
    pub fn select(&self, selector: Document) -> &Self {
        self.spec.lock().op.selector = Some(selector);
        self
    }

    /// Orders results by `fields`. Prefix a field with `-` for descending
    /// order; `+` is accepted for ascending.
    pub fn sort<S: AsRef<str>>(&self, fields: &[S]) -> &Self {
        let mut order = Document::new();
        let mut error = None;
        for field in fields {
            let field = field.as_ref();
            let (name, direction) = match field.strip_prefix('-') {
                Some(name) => (name, -1),
                None => (field.strip_prefix('+').unwrap_or(field), 1),
            };
            if name.is_empty() {
                error = Some(ClientError::InvalidArgument(
                    "sort: empty field name".to_string(),
                ));
                break;
            }
            order.insert(name, direction);
        }

        let mut spec = self.spec.lock();
        match error {
            Some(e) => {
                spec.error.get_or_insert(e);
            }
            None => spec.op.options.order_by = Some(order),
        }
        self
    }

    /// Forces the use of the index described by `key`.
    pub fn hint<S: AsRef<str>>(&self, key: &[S]) -> &Self {
        let mut spec = self.spec.lock();
        match parse_index_key(key) {
            Ok((_, real_key)) => spec.op.options.hint = Some(real_key),
            Err(e) => {
                spec.error.get_or_insert(e);
            }
        }
        self
    }

    /// Runs the query in snapshot mode.
    pub fn snapshot(&self) -> &Self {
        self.spec.lock().op.options.snapshot = true;
        self
    }

    /// Replays an oplog collection from the timestamp in the filter.
    pub fn log_replay(&self) -> &Self {
        self.spec.lock().op.flags |= QueryFlags::LOG_REPLAY;
        self
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn snapshot_spec(&self) -> QuerySpec {
        self.spec.lock().clone()
    }

    fn checked_spec(&self) -> ClientResult<QuerySpec> {
        let spec = self.snapshot_spec();
        match spec.error {
            Some(e) => Err(e),
            None => Ok(spec),
        }
    }

    /// Returns the first matching document, or [`ClientError::NotFound`].
    pub async fn one<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let spec = self.checked_spec()?;
        let socket = self.session.acquire_socket(true).await?;

        let mut op = spec.op;
        op.flags |= self.session.slave_ok_flag();
        op.limit = -1;
        let namespace = op.collection.clone();

        let data = socket.simple_query(op).await?.ok_or(ClientError::NotFound)?;
        if let Some(e) = check_query_error(&namespace, &data) {
            return Err(e);
        }
        Ok(bson::from_slice(data.as_bytes())?)
    }

    /// Runs the query and returns a cursor over the results.
    pub async fn iter(&self) -> Cursor<'s> {
        Cursor::open(self.session, self.snapshot_spec(), None).await
    }

    /// Runs the query with a tailable cursor.
    ///
    /// `timeout` bounds how long [`Cursor::next`] waits for new documents
    /// once the current results are exhausted. `None` waits as long as the
    /// cursor lives. A timeout does not invalidate the cursor.
    pub async fn tail(&self, timeout: Option<Duration>) -> Cursor<'s> {
        Cursor::open(self.session, self.snapshot_spec(), Some(timeout)).await
    }

    /// Returns every matching document.
    pub async fn all<T: DeserializeOwned>(&self) -> ClientResult<Vec<T>> {
        self.iter().await.all().await
    }

    /// Counts matching documents, honoring skip and limit.
    pub async fn count(&self) -> ClientResult<i64> {
        let spec = self.checked_spec()?;
        let (db, coll) = spec.split_namespace()?;
        let mut cmd = doc! { "count": coll, "query": spec.op.query };
        if spec.limit != 0 {
            cmd.insert("limit", spec.limit);
        }
        if spec.op.skip != 0 {
            cmd.insert("skip", spec.op.skip);
        }
        let result: Document = self.session.db(&db).run(cmd).await?;
        Ok(int_field(&result, "n"))
    }

    /// Returns the distinct values of `key` among matching documents.
    pub async fn distinct<T: DeserializeOwned>(&self, key: &str) -> ClientResult<Vec<T>> {
        let spec = self.checked_spec()?;
        let (db, coll) = spec.split_namespace()?;
        let cmd = doc! { "distinct": coll, "key": key, "query": spec.op.query };
        let result: DistinctResult<T> = self.session.db(&db).run(cmd).await?;
        Ok(result.values)
    }

    /// Returns the server's plan for the query.
    pub async fn explain<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let mut spec = self.checked_spec()?;
        spec.op.options.explain = true;
        if spec.op.limit > 0 {
            spec.op.limit = -spec.op.limit;
        }
        let mut cursor = Query::from_spec(self.session, spec).iter().await;
        match cursor.next().await {
            Some(plan) => Ok(plan),
            None => {
                cursor.close().await?;
                Err(ClientError::NotFound)
            }
        }
    }

    /// Modifies or removes the first matching document atomically.
    ///
    /// Returns the change summary and, when the server returned one, the
    /// document before the change (or after it, with `return_new`).
    pub async fn apply<T: DeserializeOwned>(
        &self,
        change: Change,
    ) -> ClientResult<(ChangeInfo, Option<T>)> {
        let spec = self.checked_spec()?;
        let (db, coll) = spec.split_namespace()?;

        let mut cmd = doc! { "findAndModify": coll, "query": spec.op.query };
        if let Some(update) = &change.update {
            cmd.insert("update", update.clone());
        }
        if let Some(order) = spec.op.options.order_by {
            cmd.insert("sort", order);
        }
        if let Some(fields) = spec.op.selector {
            cmd.insert("fields", fields);
        }
        if change.upsert {
            cmd.insert("upsert", true);
        }
        if change.remove {
            cmd.insert("remove", true);
        }
        if change.return_new {
            cmd.insert("new", true);
        }

        let session = self.session.clone_session()?;
        session.set_mode(Mode::Strong, false);
        let reply: Document = match session.db(&db).run(cmd).await {
            Ok(reply) => reply,
            Err(ClientError::Query(e)) if e.message == "No matching object found" => {
                return Err(ClientError::NotFound)
            }
            Err(e) => return Err(e),
        };

        let last = reply
            .get_document("lastErrorObject")
            .map(LastError::from_document)
            .unwrap_or_default();
        if last.n == 0 {
            return Err(ClientError::NotFound);
        }

        let value = match reply.get("value") {
            Some(Bson::Null) | None => None,
            Some(value) => Some(bson::from_bson(value.clone())?),
        };

        let mut info = ChangeInfo::default();
        if last.updated_existing {
            info.updated = last.n;
        } else if change.remove {
            info.removed = last.n;
        } else if change.upsert {
            info.upserted_id = last.upserted_id;
        }
        Ok((info, value))
    }
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.spec.lock();
        f.debug_struct("Query")
            .field("op", &spec.op)
            .field("limit", &spec.limit)
            .field("prefetch", &spec.prefetch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn session() -> Session {
        MemoryNetwork::single().session(Mode::Strong)
    }

    #[test]
    fn test_limit_encoding() {
        let s = session();
        let q = s.db("db").c("c").find(Document::new());

        q.limit(1);
        assert_eq!((q.snapshot_spec().limit, q.snapshot_spec().op.limit), (1, -1));
        q.limit(-5);
        assert_eq!((q.snapshot_spec().limit, q.snapshot_spec().op.limit), (5, -5));
        q.limit(5);
        assert_eq!((q.snapshot_spec().limit, q.snapshot_spec().op.limit), (5, 5));
        q.limit(i32::MIN);
        let spec = q.snapshot_spec();
        assert_eq!(spec.limit, i32::MAX);
        assert_eq!(spec.op.limit, i32::MIN + 1);
    }

    #[test]
    fn test_batch_of_one_is_promoted() {
        let s = session();
        let q = s.db("db").c("c").find(Document::new());
        q.batch(1);
        assert_eq!(q.snapshot_spec().op.limit, 2);
        q.batch(50);
        assert_eq!(q.snapshot_spec().op.limit, 50);
    }

    #[test]
    fn test_sort_document() {
        let s = session();
        let q = s.db("db").c("c").find(Document::new());
        q.sort(&["a", "-b", "+c"]);
        assert_eq!(
            q.snapshot_spec().op.options.order_by,
            Some(doc! { "a": 1, "b": -1, "c": 1 })
        );
    }

    #[tokio::test]
    async fn test_empty_sort_field_is_deferred() {
        let s = session();
        let q = s.db("db").c("c").find(Document::new());
        q.sort(&["a", "-"]).skip(2);
        assert_eq!(q.snapshot_spec().op.skip, 2);
        let err = q.one::<Document>().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let mut cursor = q.iter().await;
        assert!(cursor.next::<Document>().await.is_none());
        assert!(cursor.close().await.is_err());
    }

    #[test]
    fn test_hint_parses_index_key() {
        let s = session();
        let q = s.db("db").c("c").find(Document::new());
        q.hint(&["a", "-b"]);
        assert_eq!(q.snapshot_spec().op.options.hint, Some(doc! { "a": 1, "b": -1 }));

        let q = s.db("db").c("c").find(Document::new());
        q.hint(&["$bad"]);
        assert!(q.snapshot_spec().error.is_some());
    }

    #[test]
    fn test_session_defaults_applied() {
        let s = session();
        s.set_batch(1);
        s.set_prefetch(0.5);
        s.set_cursor_timeout(Duration::ZERO).unwrap();
        let q = s.db("db").c("c").find(Document::new());
        let spec = q.snapshot_spec();
        assert_eq!(spec.op.limit, 2);
        assert!((spec.prefetch - 0.5).abs() < f64::EPSILON);
        assert!(spec.op.flags.contains(QueryFlags::NO_CURSOR_TIMEOUT));
    }

    #[test]
    fn test_modifiers_after_snapshot_do_not_leak() {
        let s = session();
        let q = s.db("db").c("c").find(doc! { "a": 1 });
        let before = q.snapshot_spec();
        q.skip(10).select(doc! { "a": 1 }).snapshot().log_replay();
        assert_eq!(before.op.skip, 0);
        assert!(before.op.selector.is_none());
        let after = q.snapshot_spec();
        assert!(after.op.options.snapshot);
        assert!(after.op.flags.contains(QueryFlags::LOG_REPLAY));
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(
            split_namespace("db.a.b").unwrap(),
            ("db".to_string(), "a.b".to_string())
        );
        assert!(split_namespace("nodot").is_err());
        assert!(split_namespace(".c").is_err());
    }
}
