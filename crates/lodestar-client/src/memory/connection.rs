//! Connections to memory servers.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document, RawDocumentBuf};
use parking_lot::Mutex;

use super::store::{Batch, TailOptions, WriteOutcome};
use super::{NetworkInner, ServerCounters};
use crate::error::{ClientError, ClientResult};
use crate::wire::{
    BoxFuture, Connection, Credential, GetMoreOp, Op, QueryFlags, QueryOp, ReplyEvent, ReplySender,
    ServerInfo,
};

/// Delay before an empty await-data batch is answered.
const AWAIT_DATA_DELAY: Duration = Duration::from_millis(50);

/// What a query or get-more sends back.
pub(super) enum Reply {
    Batch(Batch),
    Failed(ClientError),
}

impl Reply {
    pub(super) fn single(doc: Document) -> Self {
        Reply::Batch(Batch {
            cursor_id: 0,
            docs: vec![doc],
            await_data: false,
        })
    }
}

/// A query failure as servers report it.
pub(super) fn query_failure(message: &str, code: i32) -> Document {
    doc! { "$err": message, "code": code }
}

fn deliver(reply_to: Option<&ReplySender>, reply: Reply) {
    let tx = match reply_to {
        Some(tx) => tx,
        None => return,
    };
    let batch = match reply {
        Reply::Batch(batch) => batch,
        Reply::Failed(e) => {
            let _ = tx.send(ReplyEvent::Failed(e));
            return;
        }
    };
    if batch.docs.is_empty() {
        let _ = tx.send(ReplyEvent::Empty {
            cursor_id: batch.cursor_id,
        });
        return;
    }
    let reply_docs = batch.docs.len() as i32;
    for (doc_num, doc) in batch.docs.iter().enumerate() {
        let event = match RawDocumentBuf::from_document(doc) {
            Ok(data) => ReplyEvent::Document {
                cursor_id: batch.cursor_id,
                doc_num: doc_num as i32,
                reply_docs,
                data,
            },
            Err(e) => ReplyEvent::Failed(e.into()),
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// One client connection to a memory server.
pub(crate) struct MemoryConnection {
    pub(super) network: Arc<NetworkInner>,
    pub(super) addr: String,
    pub(super) id: u64,
    counters: Arc<ServerCounters>,
    auth: Mutex<HashSet<String>>,
    pub(super) last_error: Mutex<WriteOutcome>,
    timeout: Mutex<Duration>,
    alive: AtomicBool,
    /// Reply channels of requests a silent server never answers.
    unanswered: Mutex<Vec<ReplySender>>,
}

impl MemoryConnection {
    pub(crate) fn new(network: Arc<NetworkInner>, addr: &str) -> Self {
        let id = network.next_connection_id();
        let counters = network.counters(addr);
        Self {
            network,
            addr: addr.to_string(),
            id,
            counters,
            auth: Mutex::new(HashSet::new()),
            last_error: Mutex::new(WriteOutcome::default()),
            timeout: Mutex::new(Duration::ZERO),
            alive: AtomicBool::new(true),
            unanswered: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn is_primary(&self) -> bool {
        self.network.is_primary(&self.addr)
    }

    /// Returns true if the connection may act on `db`.
    pub(super) fn authorized(&self, db: &str) -> bool {
        if !self.network.auth_required() {
            return true;
        }
        let auth = self.auth.lock();
        auth.contains(db) || auth.contains("admin")
    }

    fn handle(&self, op: Op) {
        match op {
            Op::Query(op) => {
                if op.is_command() {
                    ServerCounters::bump(&self.counters.commands);
                } else {
                    ServerCounters::bump(&self.counters.queries);
                }
                if self.network.is_silent(&self.addr) {
                    self.unanswered.lock().extend(op.reply);
                    return;
                }
                let reply = self.query(&op);
                deliver(op.reply.as_ref(), reply);
            }
            Op::GetMore(op) => {
                ServerCounters::bump(&self.counters.get_mores);
                if self.network.is_silent(&self.addr) {
                    self.unanswered.lock().extend(op.reply);
                    return;
                }
                self.get_more(op);
            }
            Op::KillCursors { cursor_ids } => {
                ServerCounters::bump(&self.counters.kill_cursors);
                self.network.store.lock().kill_cursors(&cursor_ids);
            }
            Op::Insert {
                collection,
                documents,
            } => {
                ServerCounters::bump(&self.counters.inserts);
                self.write(&collection, |store| store.insert(&collection, documents));
            }
            Op::Update {
                collection,
                selector,
                update,
                flags,
            } => {
                ServerCounters::bump(&self.counters.updates);
                self.write(&collection, |store| {
                    store.update(&collection, &selector, &update, flags)
                });
            }
            Op::Delete {
                collection,
                selector,
                flags,
            } => {
                ServerCounters::bump(&self.counters.deletes);
                self.write(&collection, |store| store.delete(&collection, &selector, flags));
            }
        }
    }

    fn write(&self, namespace: &str, apply: impl FnOnce(&mut super::store::Store) -> WriteOutcome) {
        let db = namespace.split('.').next().unwrap_or_default();
        let outcome = if !self.is_primary() {
            WriteOutcome::failed("not master", 10058)
        } else if !self.authorized(db) {
            WriteOutcome::failed("unauthorized", 13)
        } else {
            apply(&mut self.network.store.lock())
        };
        if let Some((message, code)) = &outcome.err {
            tracing::debug!(addr = %self.addr, %namespace, code, %message, "write failed");
        }
        *self.last_error.lock() = outcome;
    }

    fn query(&self, op: &QueryOp) -> Reply {
        let (db, coll) = match op.collection.split_once('.') {
            Some(parts) => parts,
            None => return Reply::single(query_failure("bad namespace", 16256)),
        };
        match coll {
            "$cmd" => return Reply::single(self.run_command(db, &op.query, op.flags)),
            "$cmd.sys.unlock" => return Reply::single(self.unlock()),
            _ => {}
        }
        if !self.is_primary() && !op.flags.contains(QueryFlags::SLAVE_OK) {
            return Reply::single(query_failure("not master and slaveOk=false", 13435));
        }
        if !self.authorized(db) {
            return Reply::single(query_failure("unauthorized", 13));
        }

        let mut store = self.network.store.lock();
        let docs = store.find(
            &op.collection,
            &op.query,
            op.options.order_by.as_ref(),
            op.skip,
            op.selector.as_ref(),
        );
        if op.options.explain {
            return Reply::single(doc! {
                "cursor": "BasicCursor",
                "n": docs.len() as i64,
                "nscannedObjects": store.documents(&op.collection).len() as i64,
                "millis": 0,
            });
        }
        let tail = op.flags.contains(QueryFlags::TAILABLE).then(|| TailOptions {
            filter: op.query.clone(),
            selector: op.selector.clone(),
            await_data: op.flags.contains(QueryFlags::AWAIT_DATA),
        });
        Reply::Batch(store.open_cursor(&self.addr, &op.collection, docs, op.limit, tail))
    }

    fn get_more(&self, op: GetMoreOp) {
        let result = self
            .network
            .store
            .lock()
            .get_more(&self.addr, op.cursor_id, op.limit);
        match result {
            Ok(batch) if batch.await_data => {
                let network = Arc::clone(&self.network);
                let addr = self.addr.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(AWAIT_DATA_DELAY).await;
                    let result = network.store.lock().get_more(&addr, op.cursor_id, op.limit);
                    let reply = match result {
                        Ok(batch) => Reply::Batch(batch),
                        Err(e) => Reply::Failed(e),
                    };
                    deliver(op.reply.as_ref(), reply);
                });
            }
            Ok(batch) => deliver(op.reply.as_ref(), Reply::Batch(batch)),
            Err(e) => deliver(op.reply.as_ref(), Reply::Failed(e)),
        }
    }

    fn unlock(&self) -> Document {
        if !self.network.store.lock().set_fsync_lock(false) {
            return doc! { "ok": 0.0, "errmsg": "not locked" };
        }
        doc! { "ok": 1.0, "info": "unlock completed" }
    }
}

impl Connection for MemoryConnection {
    fn server(&self) -> ServerInfo {
        self.network.server_info(&self.addr).unwrap_or_else(|| ServerInfo {
            addr: self.addr.clone(),
            ..ServerInfo::default()
        })
    }

    fn send(&self, ops: Vec<Op>) -> BoxFuture<'_, ClientResult<()>> {
        Box::pin(async move {
            if !self.network.is_up(&self.addr) {
                self.alive.store(false, Ordering::Release);
                return Err(ClientError::ConnectionFailed(format!(
                    "{}: connection reset",
                    self.addr
                )));
            }
            for op in ops {
                self.handle(op);
            }
            Ok(())
        })
    }

    fn login<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, ClientResult<()>> {
        Box::pin(async move {
            ServerCounters::bump(&self.counters.logins);
            if self.auth.lock().contains(&credential.source) {
                return Ok(());
            }
            if self.network.auth_required() && !self.network.check_credential(credential) {
                tracing::debug!(
                    addr = %self.addr,
                    source = %credential.source,
                    user = %credential.username,
                    "login rejected"
                );
                return Err(ClientError::AuthenticationFailed("auth fails".to_string()));
            }
            self.auth.lock().insert(credential.source.clone());
            Ok(())
        })
    }

    fn logout<'a>(&'a self, db: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.auth.lock().remove(db);
        })
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && self.network.is_up(&self.addr)
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("timeout", &*self.timeout.lock())
            .finish()
    }
}
