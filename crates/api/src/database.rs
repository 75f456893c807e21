//! The database handle (§6): `Database::open`/`close`, the collection
//! registry, and session creation. Everything else — transactions,
//! cursors, change streams — is reached from a [`crate::Session`] or a
//! [`crate::CollectionHandle`] obtained through this handle.

use lauradb_core::Result;
use lauradb_engine::{Catalog, Config};
use std::sync::Arc;

use crate::change_stream::Subscription;
use crate::collection::CollectionHandle;
use crate::session::Session;

/// An open LauraDB database, rooted at one `data_dir`.
///
/// Cheaply cloneable: internally an `Arc<Catalog>`, so handing a
/// `Database` to multiple worker threads just bumps a refcount.
#[derive(Clone)]
pub struct Database {
    catalog: Arc<Catalog>,
}

impl Database {
    /// Open (creating if absent) the database described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        Ok(Database { catalog: Arc::new(Catalog::open(config)?) })
    }

    /// Flush all pending writes and persist the collection registry.
    /// Safe to call even if the `Database` is still in use elsewhere;
    /// subsequent operations simply checkpoint again.
    pub fn close(&self) -> Result<()> {
        self.catalog.close()
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.catalog.list_collections()
    }

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.catalog.create_collection(name)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.catalog.drop_collection(name)
    }

    /// A handle bound to one named collection. Does not require the
    /// collection to already exist at call time beyond the usual
    /// `NotFound` on first use — cheap to construct, so callers need
    /// not cache it themselves.
    pub fn collection(&self, name: impl Into<String>) -> CollectionHandle {
        CollectionHandle::new(self.catalog.clone(), name.into())
    }

    /// Start a new client session (§4.6): the unit of at-most-one
    /// active transaction that collection ops run inside of.
    pub fn start_session(&self) -> Session {
        Session::new(self.catalog.clone())
    }

    /// Sweep every TTL index across every collection, deleting expired
    /// documents. Intended to be called periodically by the host
    /// application; LauraDB does not run its own background thread.
    pub fn sweep_ttl(&self) -> Result<u64> {
        self.catalog.sweep_ttl()
    }

    /// Force a checkpoint: flush dirty pages, persist every
    /// collection's current root pointers, and record the WAL
    /// checkpoint LSN.
    pub fn checkpoint(&self) -> Result<lauradb_durability::Lsn> {
        self.catalog.checkpoint()
    }

    /// Subscribe to `collection`'s committed mutations (§4.12),
    /// optionally residually filtered and resumed from a token
    /// returned by an earlier subscription's [`Subscription::resume_token`].
    pub fn watch(
        &self,
        collection: &str,
        filter: Option<serde_json::Value>,
        resume_token: Option<lauradb_durability::oplog::ResumeToken>,
    ) -> Result<Subscription> {
        Ok(Subscription::new(self.catalog.change_stream(collection, filter, resume_token)?))
    }

    /// Pull up to `n` more documents from a cursor opened by
    /// [`CollectionHandle::find_cursor`]. `has_more` is false once the
    /// cursor is exhausted; callers should still `close_cursor` it.
    pub fn next_batch(&self, cursor_id: u64, n: usize) -> Result<(Vec<lauradb_core::Document>, bool)> {
        let docs = self.catalog.cursors().next_batch(cursor_id, n)?;
        let has_more = !self.catalog.cursors().is_exhausted(cursor_id)?;
        Ok((docs, has_more))
    }

    pub fn close_cursor(&self, cursor_id: u64) {
        self.catalog.cursors().close(cursor_id);
    }

    /// This database's configuration, for tools that need the raw
    /// `data_dir`/`page_size` (e.g. the repair crate's defragmenter).
    pub fn config(&self) -> &Config {
        self.catalog.config()
    }

    pub(crate) fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_core::value::{Document, Value};
    use tempfile::tempdir;

    #[test]
    fn basic_insert_and_find() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("people").unwrap();
        let people = db.collection("people");
        let session = db.start_session();

        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        doc.set("age", Value::Int64(30));
        let id = people.insert_one(&session, doc).unwrap();

        let found = people.find_one(&session, &serde_json::json!({"name": "Alice"})).unwrap().unwrap();
        assert_eq!(found.id().copied(), Some(Value::ObjectId(id)));
        assert_eq!(found.get("age"), Some(&Value::Int64(30)));
    }
}
