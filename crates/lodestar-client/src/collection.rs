//! Collection handles, writes, and index management.
//!
//! Writes go out on a socket the session acquires for the primary. When the
//! session has acknowledgement settings, a `getLastError` query is sent in
//! the same unit on the same socket and its reply decides the outcome.

use bson::{doc, Bson, Document, RawDocumentBuf};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cursor::Cursor;
use crate::database::Database;
use crate::error::{check_query_error, has_errmsg, ClientError, ClientResult, LastError};
use crate::index::{cache_key, parse_index_key, Index, IndexSpec};
use crate::query::Query;
use crate::safe::Safe;
use crate::session::{Mode, Session};
use crate::wire::{delete_flags, reply_channel, update_flags, Op, QueryOp, ReplyEvent};

/// Summary of a write that may touch several documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeInfo {
    /// Documents updated.
    pub updated: i64,
    /// Documents removed.
    pub removed: i64,
    /// Id of the document inserted by an upsert.
    pub upserted_id: Option<Bson>,
}

/// A find-and-modify request, see [`Query::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
    /// Replacement or modifier document.
    pub update: Option<Document>,
    /// Insert when nothing matches.
    pub upsert: bool,
    /// Remove the matching document instead of updating it.
    pub remove: bool,
    /// Return the document after the change rather than before.
    pub return_new: bool,
}

impl Change {
    /// Updates the matching document with `update`.
    pub fn update(update: Document) -> Self {
        Self {
            update: Some(update),
            ..Self::default()
        }
    }

    /// Removes the matching document.
    pub fn remove() -> Self {
        Self {
            remove: true,
            ..Self::default()
        }
    }

    /// Sets whether to insert when nothing matches.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    /// Sets whether to return the changed document.
    pub fn return_new(mut self, return_new: bool) -> Self {
        self.return_new = return_new;
        self
    }
}

/// A collection bound to a session.
#[derive(Debug, Clone)]
pub struct Collection<'s> {
    database: Database<'s>,
    name: String,
    full_name: String,
}

impl<'s> Collection<'s> {
    pub(crate) fn new(database: Database<'s>, name: &str) -> Self {
        let full_name = format!("{}.{}", database.name(), name);
        Self {
            database,
            name: name.to_string(),
            full_name,
        }
    }

    /// Returns the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `db.collection`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Returns the owning database.
    pub fn database(&self) -> &Database<'s> {
        &self.database
    }

    /// Returns the same collection bound to another session.
    pub fn with<'t>(&self, session: &'t Session) -> Collection<'t> {
        Collection::new(self.database.with(session), &self.name)
    }

    fn session(&self) -> &'s Session {
        self.database.session()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Starts a query matching `filter`.
    pub fn find(&self, filter: Document) -> Query<'s> {
        Query::new(self.session(), &self.full_name, filter)
    }

    /// Starts a query for the document with `_id` equal to `id`.
    pub fn find_id(&self, id: impl Into<Bson>) -> Query<'s> {
        self.find(doc! { "_id": id.into() })
    }

    /// Counts every document in the collection.
    pub async fn count(&self) -> ClientResult<i64> {
        self.find(Document::new()).count().await
    }

    /// Runs an aggregation pipeline.
    pub fn pipe(&self, pipeline: Vec<Document>) -> Pipe<'s> {
        Pipe {
            collection: self.clone(),
            pipeline,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts `docs`.
    pub async fn insert<T: Serialize>(&self, docs: &[T]) -> ClientResult<()> {
        let documents = docs
            .iter()
            .map(bson::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        self.write_query(Op::Insert {
            collection: self.full_name.clone(),
            documents,
        })
        .await
        .map(|_| ())
    }

    /// Updates the first document matching `selector`.
    ///
    /// With acknowledged writes, fails with [`ClientError::NotFound`] when
    /// nothing matched.
    pub async fn update(&self, selector: Document, update: Document) -> ClientResult<()> {
        let last = self.write_update(selector, update, 0).await?;
        match last {
            Some(last) if !last.updated_existing => Err(ClientError::NotFound),
            _ => Ok(()),
        }
    }

    /// Updates the document with `_id` equal to `id`.
    pub async fn update_id(&self, id: impl Into<Bson>, update: Document) -> ClientResult<()> {
        self.update(doc! { "_id": id.into() }, update).await
    }

    /// Updates every document matching `selector`.
    pub async fn update_all(
        &self,
        selector: Document,
        update: Document,
    ) -> ClientResult<ChangeInfo> {
        let last = self.write_update(selector, update, update_flags::MULTI).await?;
        Ok(ChangeInfo {
            updated: last.map(|l| l.n).unwrap_or_default(),
            ..ChangeInfo::default()
        })
    }

    /// Updates the first document matching `selector`, inserting one when
    /// nothing matches.
    pub async fn upsert(&self, selector: Document, update: Document) -> ClientResult<ChangeInfo> {
        let mut info = ChangeInfo::default();
        if let Some(last) = self.write_update(selector, update, update_flags::UPSERT).await? {
            if last.updated_existing {
                info.updated = last.n;
            } else {
                info.upserted_id = last.upserted_id;
            }
        }
        Ok(info)
    }

    /// Upserts the document with `_id` equal to `id`.
    pub async fn upsert_id(
        &self,
        id: impl Into<Bson>,
        update: Document,
    ) -> ClientResult<ChangeInfo> {
        self.upsert(doc! { "_id": id.into() }, update).await
    }

    /// Removes the first document matching `selector`.
    ///
    /// With acknowledged writes, fails with [`ClientError::NotFound`] when
    /// nothing matched.
    pub async fn remove(&self, selector: Document) -> ClientResult<()> {
        let last = self.write_delete(selector, delete_flags::SINGLE).await?;
        match last {
            Some(last) if last.n == 0 => Err(ClientError::NotFound),
            _ => Ok(()),
        }
    }

    /// Removes the document with `_id` equal to `id`.
    pub async fn remove_id(&self, id: impl Into<Bson>) -> ClientResult<()> {
        self.remove(doc! { "_id": id.into() }).await
    }

    /// Removes every document matching `selector`.
    pub async fn remove_all(&self, selector: Document) -> ClientResult<ChangeInfo> {
        let last = self.write_delete(selector, 0).await?;
        Ok(ChangeInfo {
            removed: last.map(|l| l.n).unwrap_or_default(),
            ..ChangeInfo::default()
        })
    }

    /// Drops the collection.
    pub async fn drop_collection(&self) -> ClientResult<()> {
        self.database
            .run::<Document>(doc! { "drop": self.name.clone() })
            .await
            .map(|_| ())
    }

    async fn write_update(
        &self,
        selector: Document,
        update: Document,
        flags: u32,
    ) -> ClientResult<Option<LastError>> {
        self.write_query(Op::Update {
            collection: self.full_name.clone(),
            selector,
            update,
            flags,
        })
        .await
    }

    async fn write_delete(
        &self,
        selector: Document,
        flags: u32,
    ) -> ClientResult<Option<LastError>> {
        self.write_query(Op::Delete {
            collection: self.full_name.clone(),
            selector,
            flags,
        })
        .await
    }

    /// Sends a write and, when the session acknowledges writes, waits for
    /// the server's verdict.
    ///
    /// Returns `None` for unacknowledged writes. A write rejected by the
    /// server fails with [`ClientError::LastError`].
    async fn write_query(&self, op: Op) -> ClientResult<Option<LastError>> {
        let session = self.session();
        let local = self.database.name() == "local";
        let socket = session.acquire_socket(local).await?;

        let safe = match session.safe_op() {
            Some(safe) => safe,
            None => {
                socket.send(vec![op]).await?;
                return Ok(None);
            }
        };

        let namespace = if local { "local.$cmd" } else { "admin.$cmd" };
        let (tx, mut rx) = reply_channel();
        let mut ack = QueryOp::new(namespace, safe.to_command());
        ack.limit = -1;
        ack.reply = Some(tx);
        socket.send(vec![op, Op::Query(ack)]).await?;

        let data = match socket.await_reply(&mut rx).await? {
            ReplyEvent::Document { data, .. } => data,
            ReplyEvent::Empty { .. } => {
                return Err(ClientError::Internal(
                    "getLastError returned no document".to_string(),
                ))
            }
            ReplyEvent::Failed(e) => return Err(e),
        };
        if has_errmsg(&data) {
            if let Some(e) = check_query_error(namespace, &data) {
                return Err(e);
            }
        }

        let doc: Document = bson::from_slice(data.as_bytes())?;
        let last = LastError::from_document(&doc);
        tracing::trace!(
            collection = %self.full_name,
            n = last.n,
            code = last.code,
            "write acknowledged"
        );
        if !last.err.is_empty() {
            return Err(ClientError::LastError(last));
        }
        Ok(Some(last))
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Ensures an index on `key` exists. See [`ensure_index`](Self::ensure_index).
    pub async fn ensure_index_key<S: AsRef<str>>(&self, key: &[S]) -> ClientResult<()> {
        self.ensure_index(&Index::new(key)).await
    }

    /// Ensures `index` exists.
    ///
    /// Indexes created or confirmed through any session are remembered by the
    /// cluster, and later calls for the same index return without contacting
    /// the server. The index is always named after its key, so `index.name`
    /// is ignored and [`drop_index`](Self::drop_index) finds it again.
    pub async fn ensure_index(&self, index: &Index) -> ClientResult<()> {
        let (name, key) = parse_index_key(&index.key)?;

        let cluster = self.session().cluster()?;
        let cached = cache_key(&self.full_name, &name);
        if cluster.index_cache().contains(&cached) {
            return Ok(());
        }

        tracing::debug!(collection = %self.full_name, index = %name, "ensuring index");
        let spec = IndexSpec::new(&self.full_name, name, key, index);
        let session = self.session().clone_session()?;
        session.set_mode(Mode::Strong, false);
        session.ensure_safe(&Safe::default());
        session
            .db(self.database.name())
            .c("system.indexes")
            .insert(&[spec])
            .await?;

        cluster.index_cache().insert(cached);
        Ok(())
    }

    /// Drops the index on `key`.
    pub async fn drop_index<S: AsRef<str>>(&self, key: &[S]) -> ClientResult<()> {
        let (name, _) = parse_index_key(key)?;
        let cluster = self.session().cluster()?;
        cluster.index_cache().remove(&cache_key(&self.full_name, &name));

        let session = self.session().clone_session()?;
        session.set_mode(Mode::Strong, false);
        let reply: Document = session
            .db(self.database.name())
            .run(doc! { "dropIndexes": self.name.clone(), "index": name })
            .await?;
        if crate::error::int_field(&reply, "ok") == 0 {
            let message = reply.get_str("errmsg").unwrap_or("dropIndexes failed");
            return Err(ClientError::Internal(message.to_string()));
        }
        Ok(())
    }

    /// Returns the indexes of the collection, sorted by name.
    pub async fn indexes(&self) -> ClientResult<Vec<Index>> {
        let specs: Vec<IndexSpec> = self
            .database
            .c("system.indexes")
            .find(doc! { "ns": self.full_name.clone() })
            .sort(&["name"])
            .all()
            .await?;
        specs.into_iter().map(IndexSpec::into_index).collect()
    }
}

/// An aggregation pipeline ready to run.
#[derive(Debug, Clone)]
pub struct Pipe<'s> {
    collection: Collection<'s>,
    pipeline: Vec<Document>,
}

impl<'s> Pipe<'s> {
    /// Runs the pipeline and returns a cursor over its results.
    pub async fn iter(&self) -> Cursor<'s> {
        let session = self.collection.session();
        let namespace = self.collection.full_name.clone();
        let cmd = doc! {
            "aggregate": self.collection.name.clone(),
            "pipeline": self.pipeline.clone(),
        };
        let reply: ClientResult<Document> = self.collection.database.run(cmd).await;
        let docs = reply.and_then(|reply| {
            let results = match reply.get("result") {
                Some(Bson::Array(results)) => results.clone(),
                _ => Vec::new(),
            };
            results
                .into_iter()
                .map(|value| match value {
                    Bson::Document(doc) => Ok(RawDocumentBuf::from_document(&doc)?),
                    other => Err(ClientError::Serialization(format!(
                        "aggregation result is not a document: {}",
                        other
                    ))),
                })
                .collect::<ClientResult<Vec<_>>>()
        });
        Cursor::prefilled(session, namespace, docs)
    }

    /// Returns every result.
    pub async fn all<T: DeserializeOwned>(&self) -> ClientResult<Vec<T>> {
        self.iter().await.all().await
    }

    /// Returns the first result, or [`ClientError::NotFound`].
    pub async fn one<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let mut cursor = self.iter().await;
        match cursor.next().await {
            Some(value) => Ok(value),
            None => {
                cursor.close().await?;
                Err(ClientError::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_builders() {
        let change = Change::update(doc! { "$inc": { "n": 1 } })
            .upsert(true)
            .return_new(true);
        assert!(change.upsert && change.return_new && !change.remove);

        let change = Change::remove();
        assert!(change.remove);
        assert!(change.update.is_none());
    }
}
