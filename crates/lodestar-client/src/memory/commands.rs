//! Commands understood by memory servers.

use bson::{doc, Bson, Document};

use super::connection::MemoryConnection;
use super::matcher::{get_path, matches, project, sort_documents, values_equal};
use crate::error::int_field;
use crate::wire::QueryFlags;

const BUILD_VERSION: &str = "2.2.0";

fn failure(message: &str, code: i32) -> Document {
    doc! { "ok": 0.0, "errmsg": message, "code": code }
}

fn success(mut reply: Document) -> Document {
    reply.insert("ok", 1.0);
    reply
}

/// Commands any connection may run, on any server.
fn is_open_command(name: &str) -> bool {
    matches!(
        name,
        "ping"
            | "isMaster"
            | "ismaster"
            | "getLastError"
            | "getlasterror"
            | "buildInfo"
            | "buildinfo"
    )
}

/// Commands that modify data and therefore need the primary.
fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "findAndModify"
            | "findandmodify"
            | "drop"
            | "dropIndexes"
            | "deleteIndexes"
            | "dropDatabase"
            | "create"
    )
}

impl MemoryConnection {
    /// Runs `cmd` against database `db` and returns the reply document.
    pub(super) fn run_command(&self, db: &str, cmd: &Document, flags: QueryFlags) -> Document {
        let name = match cmd.keys().next() {
            Some(name) => name.as_str(),
            None => return failure("no command given", 59),
        };

        if !is_open_command(name) {
            if !self.is_primary() {
                if is_write_command(name) {
                    return failure("not master", 10107);
                }
                if !flags.contains(QueryFlags::SLAVE_OK) {
                    return failure("not master and slaveOk=false", 13435);
                }
            }
            if !self.authorized(db) {
                return failure("unauthorized", 13);
            }
        }

        tracing::trace!(addr = %self.addr, %db, command = %name, "running command");
        match name {
            "ping" => success(Document::new()),
            "isMaster" | "ismaster" => {
                let primary = self.is_primary();
                success(doc! { "ismaster": primary, "secondary": !primary })
            }
            "getLastError" | "getlasterror" => self.get_last_error(cmd),
            "buildInfo" | "buildinfo" => success(doc! {
                "version": BUILD_VERSION,
                "versionArray": [2, 2, 0],
                "gitVersion": "memory",
                "sysInfo": "lodestar memory server",
                "bits": 64,
                "debug": false,
                "maxBsonObjectSize": 16 * 1024 * 1024,
            }),
            "count" => self.count(db, cmd),
            "distinct" => self.distinct(db, cmd),
            "findAndModify" | "findandmodify" => self.find_and_modify(db, cmd),
            "aggregate" => self.aggregate(db, cmd),
            "create" => {
                let namespace = format!("{}.{}", db, cmd.get_str(name).unwrap_or_default());
                if self.network.store.lock().create_collection(&namespace) {
                    success(Document::new())
                } else {
                    failure("collection already exists", 48)
                }
            }
            "drop" => {
                let namespace = format!("{}.{}", db, cmd.get_str(name).unwrap_or_default());
                if self.network.store.lock().drop_collection(&namespace) {
                    success(doc! { "ns": namespace })
                } else {
                    failure("ns not found", 26)
                }
            }
            "dropIndexes" | "deleteIndexes" => {
                let namespace = format!("{}.{}", db, cmd.get_str(name).unwrap_or_default());
                let index = cmd.get_str("index").unwrap_or_default();
                if self.network.store.lock().drop_index(&namespace, index) {
                    success(Document::new())
                } else {
                    failure("index not found", 27)
                }
            }
            "dropDatabase" => {
                self.network.store.lock().drop_database(db);
                success(doc! { "dropped": db })
            }
            "listDatabases" => self.list_databases(db),
            "fsync" => self.fsync(db, cmd),
            other => failure(&format!("no such cmd: {}", other), 59),
        }
    }

    fn get_last_error(&self, cmd: &Document) -> Document {
        let last = self.last_error.lock().clone();
        let mut reply = last.to_document();
        reply.insert("connectionId", self.id as i64);
        if last.err.is_none() {
            let w = int_field(cmd, "w");
            if w > 1 && w as usize > self.network.up_count() {
                reply.insert("err", "timeout");
                reply.insert("code", 64);
                reply.insert("wtimeout", true);
            }
            if cmd.get_bool("fsync").unwrap_or(false) {
                reply.insert("fsyncFiles", 1);
            }
        }
        success(reply)
    }

    fn count(&self, db: &str, cmd: &Document) -> Document {
        let namespace = format!("{}.{}", db, cmd.get_str("count").unwrap_or_default());
        let query = cmd.get_document("query").cloned().unwrap_or_default();
        let skip = int_field(cmd, "skip") as i32;
        let limit = int_field(cmd, "limit").unsigned_abs() as usize;

        let found = self.network.store.lock().find(&namespace, &query, None, skip, None).len();
        let n = if limit > 0 { found.min(limit) } else { found };
        success(doc! { "n": n as f64 })
    }

    fn distinct(&self, db: &str, cmd: &Document) -> Document {
        let namespace = format!("{}.{}", db, cmd.get_str("distinct").unwrap_or_default());
        let key = cmd.get_str("key").unwrap_or_default();
        let query = cmd.get_document("query").cloned().unwrap_or_default();

        let docs = self.network.store.lock().find(&namespace, &query, None, 0, None);
        let mut values: Vec<Bson> = Vec::new();
        for doc in &docs {
            let found = match get_path(doc, key) {
                Some(Bson::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in found {
                if !values.iter().any(|v| values_equal(v, &value)) {
                    values.push(value);
                }
            }
        }
        success(doc! { "values": values })
    }

    fn find_and_modify(&self, db: &str, cmd: &Document) -> Document {
        let coll = cmd
            .get_str("findAndModify")
            .or_else(|_| cmd.get_str("findandmodify"))
            .unwrap_or_default();
        let namespace = format!("{}.{}", db, coll);

        let result = self.network.store.lock().find_and_modify(&namespace, cmd);
        match result {
            Ok(Some((value, outcome))) => {
                let mut last = doc! { "n": outcome.n };
                if let Some(updated) = outcome.updated_existing {
                    last.insert("updatedExisting", updated);
                }
                if let Some(id) = outcome.upserted {
                    last.insert("upserted", id);
                }
                success(doc! {
                    "value": value.map(Bson::Document).unwrap_or(Bson::Null),
                    "lastErrorObject": last,
                })
            }
            Ok(None) => failure("No matching object found", 0),
            Err((message, code)) => failure(&message, code),
        }
    }

    fn aggregate(&self, db: &str, cmd: &Document) -> Document {
        let namespace = format!("{}.{}", db, cmd.get_str("aggregate").unwrap_or_default());
        let stages = match cmd.get_array("pipeline") {
            Ok(stages) => stages.clone(),
            Err(_) => return failure("pipeline must be an array", 15978),
        };

        let mut docs = self.network.store.lock().documents(&namespace);
        for stage in stages {
            let stage = match stage {
                Bson::Document(stage) => stage,
                _ => return failure("pipeline element is not an object", 15942),
            };
            let (op, arg) = match stage.iter().next() {
                Some(first) => first,
                None => return failure("pipeline stage is empty", 16435),
            };
            match (op.as_str(), arg) {
                ("$match", Bson::Document(filter)) => docs.retain(|d| matches(d, filter)),
                ("$sort", Bson::Document(order)) => sort_documents(&mut docs, order),
                ("$project", Bson::Document(selector)) => {
                    docs = docs.iter().map(|d| project(d, selector)).collect()
                }
                ("$skip", n) => {
                    let n = n.as_i64().or_else(|| n.as_i32().map(i64::from)).unwrap_or(0);
                    docs = docs.into_iter().skip(n.max(0) as usize).collect();
                }
                ("$limit", n) => {
                    let n = n.as_i64().or_else(|| n.as_i32().map(i64::from)).unwrap_or(0);
                    docs.truncate(n.max(0) as usize);
                }
                (other, _) => {
                    return failure(&format!("unrecognized pipeline stage name: '{}'", other), 16436)
                }
            }
        }
        let result: Vec<Bson> = docs.into_iter().map(Bson::Document).collect();
        success(doc! { "result": result })
    }

    fn list_databases(&self, db: &str) -> Document {
        if db != "admin" {
            return failure("listDatabases may only be run against the admin database.", 13);
        }
        let store = self.network.store.lock();
        let databases: Vec<Bson> = store
            .database_names()
            .into_iter()
            .map(|name| {
                let size = store.database_size(&name) as i64;
                Bson::Document(doc! {
                    "name": name,
                    "sizeOnDisk": (size * 1024) as f64,
                    "empty": false,
                })
            })
            .collect();
        success(doc! { "databases": databases })
    }

    fn fsync(&self, db: &str, cmd: &Document) -> Document {
        if db != "admin" {
            return failure("fsync may only be run against the admin database.", 13);
        }
        if cmd.get_bool("lock").unwrap_or(false) {
            if self.network.store.lock().set_fsync_lock(true) {
                return failure("server is already locked", 12034);
            }
            return success(doc! { "info": "now locked against writes" });
        }
        success(doc! { "numFiles": 1 })
    }
}
