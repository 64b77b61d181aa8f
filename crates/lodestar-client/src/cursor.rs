//! Result cursors.
//!
//! A [`Cursor`] queues reply documents delivered over its reply channel and
//! requests further batches as the queue drains. The next batch is requested
//! ahead of time once the queued documents drop below the prefetch share of
//! the last batch.
//!
//! Tailable cursors stay open at the end of the data. Their `next` waits for
//! new documents up to the tail timeout and then reports a timeout without
//! invalidating the cursor.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bson::RawDocumentBuf;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::error::{check_query_error, ClientError, ClientResult};
use crate::query::QuerySpec;
use crate::session::Session;
use crate::socket::Socket;
use crate::wire::{
    reply_channel, GetMoreOp, Op, QueryFlags, ReplyEvent, ReplyReceiver, ReplySender,
};

/// Iterator over query results.
pub struct Cursor<'s> {
    session: &'s Session,
    collection: String,
    server: Option<String>,
    cursor_id: i64,
    limit: i32,
    batch: i32,
    prefetch: f64,
    docs_to_receive: i32,
    docs_before_more: i32,
    queue: VecDeque<RawDocumentBuf>,
    err: Option<ClientError>,
    timeout: Option<Duration>,
    timed_out: bool,
    /// Reply channels of outstanding requests, oldest first.
    replies: VecDeque<ReplyReceiver>,
}

impl<'s> Cursor<'s> {
    fn empty(
        session: &'s Session,
        collection: String,
        limit: i32,
        batch: i32,
        prefetch: f64,
    ) -> Self {
        Self {
            session,
            collection,
            server: None,
            cursor_id: 0,
            limit,
            batch,
            prefetch,
            docs_to_receive: 0,
            docs_before_more: 0,
            queue: VecDeque::new(),
            err: None,
            timeout: None,
            timed_out: false,
            replies: VecDeque::new(),
        }
    }

    /// Sends the initial query. `tail` makes the cursor tailable with the
    /// given wait bound.
    pub(crate) async fn open(
        session: &'s Session,
        spec: QuerySpec,
        tail: Option<Option<Duration>>,
    ) -> Cursor<'s> {
        let mut op = spec.op;
        let limit = if tail.is_some() { 0 } else { spec.limit };
        if limit > 0 && (op.limit == 0 || op.limit > limit) {
            op.limit = limit;
        }

        let collection = op.collection.clone();
        let mut cursor = Cursor::empty(session, collection, limit, op.limit, spec.prefetch);
        if let Some(e) = spec.error {
            cursor.err = Some(e);
            return cursor;
        }
        if let Some(timeout) = tail {
            op.flags |= QueryFlags::TAILABLE | QueryFlags::AWAIT_DATA;
            cursor.timeout = timeout;
        }
        op.flags |= session.slave_ok_flag();
        op.reply = Some(cursor.reply_to());

        let socket = match session.acquire_socket(true).await {
            Ok(socket) => socket,
            Err(e) => {
                cursor.err = Some(e);
                return cursor;
            }
        };
        cursor.server = Some(socket.addr());
        match socket.send(vec![Op::Query(op)]).await {
            Ok(()) => cursor.docs_to_receive = 1,
            Err(e) => cursor.err = Some(e),
        }
        cursor
    }

    /// Builds a closed cursor over documents already received.
    pub(crate) fn prefilled(
        session: &'s Session,
        collection: String,
        docs: ClientResult<Vec<RawDocumentBuf>>,
    ) -> Cursor<'s> {
        let mut cursor = Cursor::empty(session, collection, 0, 0, 0.0);
        match docs {
            Ok(docs) => cursor.queue.extend(docs),
            Err(e) => cursor.err = Some(e),
        }
        cursor
    }

    /// Returns the server-side cursor id, zero once exhausted or killed.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// Returns the next document, or `None` at the end of the results, on
    /// error, or when a tailable cursor times out.
    ///
    /// Use [`err`](Self::err) or [`close`](Self::close) to tell those apart,
    /// and [`timeout`](Self::timeout) for the tailable case.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
        self.timed_out = false;
        self.drain_replies();

        let mut deadline: Option<Instant> = None;
        while self.err.is_none()
            && self.queue.is_empty()
            && (self.docs_to_receive > 0 || self.cursor_id != 0)
        {
            if self.docs_to_receive == 0 {
                if let Some(timeout) = self.timeout {
                    let at = *deadline.get_or_insert_with(|| Instant::now() + timeout);
                    if Instant::now() >= at {
                        self.timed_out = true;
                        return None;
                    }
                }
                self.get_more().await;
                if self.err.is_some() {
                    break;
                }
            }
            if !self.wait_reply(deadline).await {
                self.timed_out = true;
                return None;
            }
            self.drain_replies();
        }

        let data = match self.queue.pop_front() {
            Some(data) => data,
            None => {
                if self.err.is_none() {
                    self.err = Some(ClientError::NotFound);
                }
                return None;
            }
        };

        if self.limit > 0 {
            self.limit -= 1;
            if self.limit == 0 {
                if !self.queue.is_empty() {
                    self.err = Some(ClientError::Internal(format!(
                        "{} documents remain after the limit was reached",
                        self.queue.len()
                    )));
                    return None;
                }
                self.err = Some(ClientError::NotFound);
                if self.kill_cursor().await.is_err() {
                    return None;
                }
            }
        }

        if self.cursor_id != 0 && self.err.is_none() {
            if self.docs_before_more == 0 {
                self.get_more().await;
            }
            self.docs_before_more -= 1;
        }

        if let Some(e) = check_query_error(&self.collection, &data) {
            self.latch(e);
            return None;
        }
        match bson::from_slice(data.as_bytes()) {
            Ok(value) => Some(value),
            Err(e) => {
                self.latch(e.into());
                None
            }
        }
    }

    /// Collects every remaining document and closes the cursor.
    pub async fn all<T: DeserializeOwned>(&mut self) -> ClientResult<Vec<T>> {
        let mut results = Vec::new();
        while let Some(value) = self.next().await {
            results.push(value);
        }
        self.close().await?;
        Ok(results)
    }

    /// Returns the error that ended iteration. Running out of results is
    /// not an error.
    pub fn err(&self) -> ClientResult<()> {
        match &self.err {
            None | Some(ClientError::NotFound) => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    /// Returns true if the last [`next`](Self::next) call stopped because a
    /// tailable cursor timed out.
    pub fn timeout(&self) -> bool {
        self.timed_out
    }

    /// Kills the server-side cursor, if still open, and returns
    /// [`err`](Self::err). Repeated calls send nothing further.
    pub async fn close(&mut self) -> ClientResult<()> {
        let _ = self.kill_cursor().await;
        self.err()
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    fn latch(&mut self, e: ClientError) {
        if matches!(self.err, None | Some(ClientError::NotFound)) {
            self.err = Some(e);
        }
    }

    /// Opens the reply channel for a new request.
    fn reply_to(&mut self) -> ReplySender {
        let (tx, rx) = reply_channel();
        self.replies.push_back(rx);
        tx
    }

    fn drain_replies(&mut self) {
        loop {
            let received = match self.replies.front_mut() {
                Some(rx) => rx.try_recv(),
                None => return,
            };
            match received {
                Ok(event) => self.handle_reply(event),
                Err(TryRecvError::Disconnected) => {
                    self.replies.pop_front();
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    /// Waits for one reply event. Returns false if the tail `deadline` passed
    /// first. Without a deadline the wait is bounded by the socket timeout,
    /// and running out of it is an error.
    async fn wait_reply(&mut self, deadline: Option<Instant>) -> bool {
        let timeout = self.session.socket_timeout();
        loop {
            let rx = match self.replies.front_mut() {
                Some(rx) => rx,
                None => {
                    self.err = Some(ClientError::ConnectionClosed);
                    return true;
                }
            };
            let event = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => return false,
                },
                None if timeout.is_zero() => rx.recv().await,
                None => match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        tracing::debug!(
                            collection = %self.collection,
                            cursor_id = self.cursor_id,
                            "cursor reply timed out"
                        );
                        self.err = Some(ClientError::Timeout(timeout.as_millis() as u64));
                        return true;
                    }
                },
            };
            match event {
                Some(event) => {
                    self.handle_reply(event);
                    return true;
                }
                None => {
                    self.replies.pop_front();
                }
            }
        }
    }

    fn handle_reply(&mut self, event: ReplyEvent) {
        self.docs_to_receive -= 1;
        match event {
            ReplyEvent::Failed(e) => {
                tracing::debug!(collection = %self.collection, error = %e, "cursor reply failed");
                self.err = Some(e);
            }
            ReplyEvent::Empty { cursor_id } => {
                if cursor_id != 0 {
                    self.cursor_id = cursor_id;
                } else {
                    self.cursor_id = 0;
                    if self.err.is_none() {
                        self.err = Some(ClientError::NotFound);
                    }
                }
            }
            ReplyEvent::Document {
                cursor_id,
                doc_num,
                reply_docs,
                data,
            } => {
                if doc_num == 0 {
                    self.docs_to_receive += reply_docs - 1;
                    let to_process = self.queue.len() as i32 + reply_docs;
                    if self.limit == 0 || to_process < self.limit {
                        self.docs_before_more =
                            to_process - (self.prefetch * reply_docs as f64) as i32;
                    } else {
                        self.docs_before_more = -1;
                    }
                    self.cursor_id = cursor_id;
                }
                self.queue.push_back(data);
            }
        }
    }

    async fn get_more(&mut self) {
        let socket = match self.acquire_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                self.err = Some(e);
                return;
            }
        };
        if self.limit > 0 {
            let remaining = self.limit - self.docs_to_receive - self.queue.len() as i32;
            if remaining < self.batch || self.batch == 0 {
                self.batch = remaining;
            }
        }
        let op = GetMoreOp {
            collection: self.collection.clone(),
            limit: self.batch,
            cursor_id: self.cursor_id,
            reply: Some(self.reply_to()),
        };
        tracing::trace!(
            collection = %self.collection,
            cursor_id = self.cursor_id,
            limit = self.batch,
            "requesting more"
        );
        match socket.send(vec![Op::GetMore(op)]).await {
            Ok(()) => self.docs_to_receive += 1,
            Err(e) => self.err = Some(e),
        }
    }

    /// Returns a socket to the server holding the cursor.
    async fn acquire_socket(&self) -> ClientResult<Socket> {
        let socket = self.session.acquire_socket(true).await?;
        match &self.server {
            Some(addr) if socket.addr() != *addr => {
                drop(socket);
                let cluster = self.session.cluster()?;
                let socket = cluster
                    .acquire_server_socket(addr, self.session.socket_timeout())
                    .await?;
                self.session.socket_login(&socket).await?;
                Ok(socket)
            }
            _ => Ok(socket),
        }
    }

    async fn kill_cursor(&mut self) -> ClientResult<()> {
        if self.cursor_id == 0 {
            return Ok(());
        }
        let cursor_ids = vec![self.cursor_id];
        self.cursor_id = 0;
        let result = match self.acquire_socket().await {
            Ok(socket) => socket.send(vec![Op::KillCursors { cursor_ids }]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.latch(e.clone());
        }
        result
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("collection", &self.collection)
            .field("cursor_id", &self.cursor_id)
            .field("queued", &self.queue.len())
            .field("limit", &self.limit)
            .field("err", &self.err)
            .finish()
    }
}
