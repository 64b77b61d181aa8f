//! Document storage shared by every server of a memory network.
//!
//! Writes replicate immediately, so every server sees the same data. Server
//! cursors remember the server that opened them.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};

use super::matcher::{
    apply_update, get_path, matches, project, sort_documents, upsert_document, values_equal,
};
use crate::error::ClientError;
use crate::wire::{delete_flags, update_flags};

/// Documents returned by a query or get-more when no batch size is given.
pub(crate) const DEFAULT_BATCH: usize = 101;

const DUP_KEY_CODE: i32 = 11000;

/// Outcome of a write, kept per connection for `getLastError`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct WriteOutcome {
    pub n: i64,
    pub updated_existing: Option<bool>,
    pub upserted: Option<Bson>,
    pub err: Option<(String, i32)>,
}

impl WriteOutcome {
    pub(crate) fn failed(message: impl Into<String>, code: i32) -> Self {
        Self {
            err: Some((message.into(), code)),
            ..Self::default()
        }
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "n": self.n };
        match &self.err {
            Some((message, code)) => {
                doc.insert("err", message.clone());
                doc.insert("code", *code);
            }
            None => {
                doc.insert("err", Bson::Null);
            }
        }
        if let Some(updated) = self.updated_existing {
            doc.insert("updatedExisting", updated);
        }
        if let Some(id) = &self.upserted {
            doc.insert("upserted", id.clone());
        }
        doc
    }
}

/// Tailable cursor position.
#[derive(Debug, Clone)]
struct TailState {
    filter: Document,
    selector: Option<Document>,
    seen: usize,
    await_data: bool,
}

#[derive(Debug)]
struct ServerCursor {
    owner: String,
    namespace: String,
    pending: VecDeque<Document>,
    tail: Option<TailState>,
}

/// One batch of cursor results.
#[derive(Debug)]
pub(crate) struct Batch {
    pub cursor_id: i64,
    pub docs: Vec<Document>,
    /// Set when an empty batch should be delayed before it is delivered.
    pub await_data: bool,
}

/// Options for opening a tailable cursor.
#[derive(Debug, Clone)]
pub(crate) struct TailOptions {
    pub filter: Document,
    pub selector: Option<Document>,
    pub await_data: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    collections: BTreeMap<String, Vec<Document>>,
    indexes: BTreeMap<String, Vec<Document>>,
    cursors: HashMap<i64, ServerCursor>,
    next_cursor_id: i64,
    fsync_locked: bool,
}

fn split(namespace: &str) -> (&str, &str) {
    namespace.split_once('.').unwrap_or((namespace, ""))
}

impl Store {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Runs a query and returns every match after sort, skip and projection.
    pub(crate) fn find(
        &self,
        namespace: &str,
        filter: &Document,
        order: Option<&Document>,
        skip: i32,
        selector: Option<&Document>,
    ) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .source(namespace)
            .into_iter()
            .filter(|doc| matches(doc, filter))
            .collect();
        if let Some(order) = order {
            sort_documents(&mut docs, order);
        }
        docs.into_iter()
            .skip(skip.max(0) as usize)
            .map(|doc| match selector {
                Some(selector) => project(&doc, selector),
                None => doc,
            })
            .collect()
    }

    fn source(&self, namespace: &str) -> Vec<Document> {
        let (db, coll) = split(namespace);
        match coll {
            "system.namespaces" => self.namespaces(db),
            "system.indexes" => self
                .indexes
                .iter()
                .filter(|(ns, _)| split(ns).0 == db)
                .flat_map(|(_, specs)| specs.iter().cloned())
                .collect(),
            _ => self.collections.get(namespace).cloned().unwrap_or_default(),
        }
    }

    fn namespaces(&self, db: &str) -> Vec<Document> {
        let mut names = Vec::new();
        for ns in self.collections.keys().filter(|ns| split(ns).0 == db) {
            names.push(doc! { "name": ns.clone() });
            for spec in self.indexes.get(ns).into_iter().flatten() {
                let index = spec.get_str("name").unwrap_or_default();
                names.push(doc! { "name": format!("{}.${}", ns, index) });
            }
        }
        if self.indexes.keys().any(|ns| split(ns).0 == db) {
            names.push(doc! { "name": format!("{}.system.indexes", db) });
        }
        names
    }

    /// Returns the documents of a collection in insertion order.
    pub(crate) fn documents(&self, namespace: &str) -> Vec<Document> {
        self.collections.get(namespace).cloned().unwrap_or_default()
    }

    /// Returns the databases holding at least one collection.
    pub(crate) fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .keys()
            .map(|ns| split(ns).0.to_string())
            .collect();
        names.dedup();
        names
    }

    pub(crate) fn database_size(&self, db: &str) -> usize {
        self.collections
            .iter()
            .filter(|(ns, _)| split(ns).0 == db)
            .map(|(_, docs)| docs.len())
            .sum()
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Returns the first batch of `docs`, keeping a server cursor for the
    /// rest when needed.
    ///
    /// A negative `limit`, or one, requests a single batch and never leaves
    /// a cursor behind. Tailable cursors stay open at the end of the data.
    pub(crate) fn open_cursor(
        &mut self,
        owner: &str,
        namespace: &str,
        docs: Vec<Document>,
        limit: i32,
        tail: Option<TailOptions>,
    ) -> Batch {
        let (size, single) = match limit {
            0 => (DEFAULT_BATCH, false),
            1 => (1, true),
            n if n < 0 => (n.unsigned_abs() as usize, true),
            n => (n as usize, false),
        };
        let mut pending: VecDeque<Document> = docs.into();
        let first: Vec<Document> = pending.drain(..size.min(pending.len())).collect();

        if single || (pending.is_empty() && tail.is_none()) {
            return Batch {
                cursor_id: 0,
                docs: first,
                await_data: false,
            };
        }

        let seen = self.collections.get(namespace).map_or(0, Vec::len);
        self.next_cursor_id += 1;
        let cursor_id = self.next_cursor_id;
        self.cursors.insert(
            cursor_id,
            ServerCursor {
                owner: owner.to_string(),
                namespace: namespace.to_string(),
                pending,
                tail: tail.map(|t| TailState {
                    filter: t.filter,
                    selector: t.selector,
                    seen,
                    await_data: t.await_data,
                }),
            },
        );
        Batch {
            cursor_id,
            docs: first,
            await_data: false,
        }
    }

    /// Returns the next batch of an open cursor.
    pub(crate) fn get_more(
        &mut self,
        owner: &str,
        cursor_id: i64,
        limit: i32,
    ) -> Result<Batch, ClientError> {
        let size = match limit {
            0 => DEFAULT_BATCH,
            n => n.unsigned_abs() as usize,
        };
        let collections = &self.collections;
        let cursor = match self.cursors.get_mut(&cursor_id) {
            Some(cursor) if cursor.owner == owner => cursor,
            _ => return Err(ClientError::CursorNotFound(cursor_id)),
        };

        if let Some(tail) = &mut cursor.tail {
            if cursor.pending.is_empty() {
                let docs = collections.get(&cursor.namespace).map(Vec::as_slice).unwrap_or(&[]);
                for doc in docs.iter().skip(tail.seen) {
                    if matches(doc, &tail.filter) {
                        cursor.pending.push_back(match &tail.selector {
                            Some(selector) => project(doc, selector),
                            None => doc.clone(),
                        });
                    }
                }
                tail.seen = docs.len();
            }
        }

        let docs: Vec<Document> = cursor.pending.drain(..size.min(cursor.pending.len())).collect();
        let tail = cursor.tail.clone();
        let exhausted = cursor.pending.is_empty() && tail.is_none();
        if exhausted {
            self.cursors.remove(&cursor_id);
        }
        Ok(Batch {
            cursor_id: if exhausted { 0 } else { cursor_id },
            await_data: docs.is_empty() && tail.map_or(false, |t| t.await_data),
            docs,
        })
    }

    /// Drops server cursors. Unknown ids are ignored.
    pub(crate) fn kill_cursors(&mut self, cursor_ids: &[i64]) {
        for id in cursor_ids {
            self.cursors.remove(id);
        }
    }

    pub(crate) fn open_cursors(&self) -> usize {
        self.cursors.len()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub(crate) fn insert(&mut self, namespace: &str, docs: Vec<Document>) -> WriteOutcome {
        let (db, coll) = split(namespace);
        if coll == "system.indexes" {
            for spec in docs {
                if let Err(outcome) = self.create_index(db, spec) {
                    return outcome;
                }
            }
            return WriteOutcome::default();
        }

        for doc in docs {
            let doc = with_id(doc);
            if let Err(outcome) = self.check_unique(namespace, &doc, None) {
                return outcome;
            }
            self.collections.entry(namespace.to_string()).or_default().push(doc);
        }
        WriteOutcome::default()
    }

    pub(crate) fn update(
        &mut self,
        namespace: &str,
        selector: &Document,
        update: &Document,
        flags: u32,
    ) -> WriteOutcome {
        let positions: Vec<usize> = self
            .collections
            .get(namespace)
            .map(|docs| {
                docs.iter()
                    .enumerate()
                    .filter(|(_, doc)| matches(doc, selector))
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();

        if positions.is_empty() {
            if flags & update_flags::UPSERT == 0 {
                return WriteOutcome {
                    updated_existing: Some(false),
                    ..WriteOutcome::default()
                };
            }
            let doc = match upsert_document(selector, update) {
                Ok(doc) => with_id(doc),
                Err(message) => return WriteOutcome::failed(message, 10147),
            };
            if let Err(outcome) = self.check_unique(namespace, &doc, None) {
                return outcome;
            }
            let id = doc.get("_id").cloned();
            self.collections.entry(namespace.to_string()).or_default().push(doc);
            return WriteOutcome {
                n: 1,
                updated_existing: Some(false),
                upserted: id,
                err: None,
            };
        }

        let multi = flags & update_flags::MULTI != 0;
        let mut n = 0;
        for position in positions.into_iter().take(if multi { usize::MAX } else { 1 }) {
            let current = self.collections.get(namespace).and_then(|docs| docs.get(position));
            let mut updated = match current {
                Some(doc) => doc.clone(),
                None => continue,
            };
            if let Err(message) = apply_update(&mut updated, update) {
                return WriteOutcome::failed(message, 10147);
            }
            if let Err(outcome) = self.check_unique(namespace, &updated, Some(position)) {
                return outcome;
            }
            let slot = self
                .collections
                .get_mut(namespace)
                .and_then(|docs| docs.get_mut(position));
            if let Some(slot) = slot {
                *slot = updated;
                n += 1;
            }
        }
        WriteOutcome {
            n,
            updated_existing: Some(n > 0),
            ..WriteOutcome::default()
        }
    }

    pub(crate) fn delete(
        &mut self,
        namespace: &str,
        selector: &Document,
        flags: u32,
    ) -> WriteOutcome {
        let single = flags & delete_flags::SINGLE != 0;
        let mut n = 0;
        if let Some(docs) = self.collections.get_mut(namespace) {
            docs.retain(|doc| {
                if (single && n > 0) || !matches(doc, selector) {
                    return true;
                }
                n += 1;
                false
            });
        }
        WriteOutcome {
            n,
            ..WriteOutcome::default()
        }
    }

    /// Finds, modifies and returns one document.
    ///
    /// Returns the document to report and the write outcome, or `None` when
    /// nothing matched and no upsert was requested.
    pub(crate) fn find_and_modify(
        &mut self,
        namespace: &str,
        cmd: &Document,
    ) -> Result<Option<(Option<Document>, WriteOutcome)>, (String, i32)> {
        let query = cmd.get_document("query").cloned().unwrap_or_default();
        let order = cmd.get_document("sort").ok();
        let fields = cmd.get_document("fields").ok();
        let update = cmd.get_document("update").cloned().unwrap_or_default();
        let remove = cmd.get_bool("remove").unwrap_or(false);
        let upsert = cmd.get_bool("upsert").unwrap_or(false);
        let return_new = cmd.get_bool("new").unwrap_or(false);

        let mut candidates: Vec<Document> = self
            .documents(namespace)
            .into_iter()
            .filter(|d| matches(d, &query))
            .collect();
        if let Some(order) = order {
            sort_documents(&mut candidates, order);
        }
        let shape = |doc: Document| match fields {
            Some(fields) => project(&doc, fields),
            None => doc,
        };

        let found = match candidates.into_iter().next() {
            Some(found) => found,
            None if upsert && !remove => {
                let outcome = self.update(namespace, &query, &update, update_flags::UPSERT);
                if let Some(err) = outcome.err {
                    return Err(err);
                }
                let created = outcome
                    .upserted
                    .as_ref()
                    .and_then(|id| self.by_id(namespace, id));
                let value = if return_new { created.map(shape) } else { None };
                return Ok(Some((value, outcome)));
            }
            None => return Ok(None),
        };

        let id = found.get("_id").cloned().unwrap_or(Bson::Null);
        if remove {
            let outcome = self.delete(namespace, &doc! { "_id": id }, delete_flags::SINGLE);
            return Ok(Some((Some(shape(found)), outcome)));
        }

        let outcome = self.update(namespace, &doc! { "_id": id.clone() }, &update, 0);
        if let Some(err) = outcome.err {
            return Err(err);
        }
        let value = if return_new { self.by_id(namespace, &id) } else { Some(found) };
        Ok(Some((value.map(shape), outcome)))
    }

    fn by_id(&self, namespace: &str, id: &Bson) -> Option<Document> {
        self.collections
            .get(namespace)?
            .iter()
            .find(|doc| doc.get("_id").map_or(false, |v| values_equal(v, id)))
            .cloned()
    }

    // =========================================================================
    // Collections and Indexes
    // =========================================================================

    pub(crate) fn create_collection(&mut self, namespace: &str) -> bool {
        if self.collections.contains_key(namespace) {
            return false;
        }
        self.collections.insert(namespace.to_string(), Vec::new());
        true
    }

    pub(crate) fn drop_collection(&mut self, namespace: &str) -> bool {
        self.indexes.remove(namespace);
        self.collections.remove(namespace).is_some()
    }

    pub(crate) fn drop_database(&mut self, db: &str) {
        self.collections.retain(|ns, _| split(ns).0 != db);
        self.indexes.retain(|ns, _| split(ns).0 != db);
    }

    fn create_index(&mut self, db: &str, spec: Document) -> Result<(), WriteOutcome> {
        let namespace = spec.get_str("ns").unwrap_or_default().to_string();
        let name = spec.get_str("name").unwrap_or_default().to_string();
        if split(&namespace).0 != db || name.is_empty() || spec.get_document("key").is_err() {
            return Err(WriteOutcome::failed("bad index spec", 10096));
        }
        let specs = self.indexes.entry(namespace.clone()).or_default();
        if specs.iter().any(|s| s.get_str("name").ok() == Some(name.as_str())) {
            return Ok(());
        }
        specs.push(spec);
        self.collections.entry(namespace).or_default();
        Ok(())
    }

    /// Drops an index by name. Returns false when it does not exist.
    pub(crate) fn drop_index(&mut self, namespace: &str, name: &str) -> bool {
        match self.indexes.get_mut(namespace) {
            Some(specs) => {
                let before = specs.len();
                specs.retain(|s| s.get_str("name").ok() != Some(name));
                specs.len() != before
            }
            None => false,
        }
    }

    /// Rejects `doc` if it repeats the `_id` or a unique index key of another
    /// document. `replacing` is the position `doc` will overwrite.
    fn check_unique(
        &self,
        namespace: &str,
        doc: &Document,
        replacing: Option<usize>,
    ) -> Result<(), WriteOutcome> {
        let docs = match self.collections.get(namespace) {
            Some(docs) => docs,
            None => return Ok(()),
        };

        let mut keys: Vec<(String, Vec<String>)> =
            vec![("_id_".to_string(), vec!["_id".to_string()])];
        for spec in self.indexes.get(namespace).into_iter().flatten() {
            if spec.get_bool("unique").unwrap_or(false) {
                let fields = spec
                    .get_document("key")
                    .map(|key| key.keys().cloned().collect())
                    .unwrap_or_default();
                keys.push((spec.get_str("name").unwrap_or_default().to_string(), fields));
            }
        }

        for (name, fields) in keys {
            let value: Vec<Bson> = fields
                .iter()
                .map(|f| get_path(doc, f).cloned().unwrap_or(Bson::Null))
                .collect();
            let clash = docs.iter().enumerate().any(|(i, other)| {
                Some(i) != replacing
                    && fields
                        .iter()
                        .zip(&value)
                        .all(|(f, v)| values_equal(get_path(other, f).unwrap_or(&Bson::Null), v))
            });
            if clash {
                let shown: Vec<String> = value.iter().map(|v| v.to_string()).collect();
                return Err(WriteOutcome::failed(
                    format!(
                        "E11000 duplicate key error index: {}.${}  dup key: {{ : {} }}",
                        namespace,
                        name,
                        shown.join(", : ")
                    ),
                    DUP_KEY_CODE,
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Server State
    // =========================================================================

    pub(crate) fn set_fsync_lock(&mut self, locked: bool) -> bool {
        std::mem::replace(&mut self.fsync_locked, locked)
    }
}

/// Puts a generated `_id` first when the document has none.
fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = doc! { "_id": ObjectId::new() };
    for (key, value) in doc {
        out.insert(key, value);
    }
    out
}
