//! Database handles and command execution.

use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::collection::Collection;
use crate::error::ClientResult;
use crate::query::Query;
use crate::session::Session;
use crate::wire::Credential;

/// A command to run: either a bare name, sent as `{name: 1}`, or a full
/// document whose first key names the command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Command name.
    Name(String),
    /// Full command document.
    Document(Document),
}

impl Command {
    /// Returns the command document.
    pub fn into_document(self) -> Document {
        match self {
            Command::Name(name) => {
                let mut doc = Document::new();
                doc.insert(name, 1);
                doc
            }
            Command::Document(doc) => doc,
        }
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Command::Name(name.to_string())
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        Command::Name(name)
    }
}

impl From<Document> for Command {
    fn from(doc: Document) -> Self {
        Command::Document(doc)
    }
}

/// A reference to a document in another collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbRef {
    /// Collection name.
    #[serde(rename = "$ref")]
    pub collection: String,
    /// Document id.
    #[serde(rename = "$id")]
    pub id: Bson,
    /// Database name; the referencing database when absent.
    #[serde(rename = "$db", default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl DbRef {
    /// Creates a reference within the current database.
    pub fn new(collection: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            database: None,
        }
    }

    /// Names the database holding the referenced document.
    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct NamespaceEntry {
    name: String,
}

/// A database bound to a session.
#[derive(Debug, Clone)]
pub struct Database<'s> {
    session: &'s Session,
    name: String,
}

impl<'s> Database<'s> {
    pub(crate) fn new(session: &'s Session, name: String) -> Self {
        Self { session, name }
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the session.
    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// Returns a handle to collection `name`.
    pub fn c(&self, name: &str) -> Collection<'s> {
        Collection::new(self.clone(), name)
    }

    /// Returns the same database bound to another session.
    pub fn with<'t>(&self, session: &'t Session) -> Database<'t> {
        Database::new(session, self.name.clone())
    }

    /// Runs a command and decodes its reply.
    pub async fn run<T: DeserializeOwned>(&self, cmd: impl Into<Command>) -> ClientResult<T> {
        self.c("$cmd").find(cmd.into().into_document()).one().await
    }

    /// Authenticates against this database.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<()> {
        self.session
            .login(Credential::new(&self.name, username, password))
            .await
    }

    /// Drops the credentials for this database.
    pub async fn logout(&self) {
        self.session.logout(&self.name).await
    }

    /// Returns the collection names, sorted.
    pub async fn collection_names(&self) -> ClientResult<Vec<String>> {
        let entries: Vec<NamespaceEntry> = self
            .c("system.namespaces")
            .find(Document::new())
            .all()
            .await?;
        let prefix = format!("{}.", self.name);
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.name.contains('$') || e.name.contains(".oplog.$"))
            .filter_map(|e| e.name.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drops the database.
    pub async fn drop_database(&self) -> ClientResult<()> {
        self.run::<Document>(doc! { "dropDatabase": 1 })
            .await
            .map(|_| ())
    }

    /// Returns a query for the referenced document. References without a
    /// database resolve against this one.
    pub fn find_ref(&self, dbref: &DbRef) -> Query<'s> {
        let db = match &dbref.database {
            Some(db) if !db.is_empty() => Database::new(self.session, db.clone()),
            _ => self.clone(),
        };
        db.c(&dbref.collection).find_id(dbref.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_documents() {
        assert_eq!(Command::from("ping").into_document(), doc! { "ping": 1 });
        let cmd = doc! { "count": "users", "query": {} };
        assert_eq!(Command::from(cmd.clone()).into_document(), cmd);
    }

    #[test]
    fn test_dbref_serialization() {
        let r = DbRef::new("users", 5).in_database("app");
        let doc = bson::to_document(&r).unwrap();
        let keys: Vec<&String> = doc.keys().collect();
        assert_eq!(keys, vec!["$ref", "$id", "$db"]);

        let r = DbRef::new("users", "x");
        let doc = bson::to_document(&r).unwrap();
        assert!(!doc.contains_key("$db"));
        let back: DbRef = bson::from_document(doc).unwrap();
        assert_eq!(back, r);
    }
}
