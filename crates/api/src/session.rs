//! Client sessions (§4.6, §6): at most one active transaction per
//! session. Collection ops run inside whichever transaction (if any)
//! is active on the session passed to them; with none active, each op
//! auto-commits on its own.

use lauradb_concurrency::transaction::TransactionContext;
use lauradb_concurrency::Session as EngineSession;
use lauradb_core::{Error, Result};
use lauradb_durability::Lsn;
use lauradb_engine::Catalog;
use parking_lot::Mutex;
use std::sync::Arc;

/// A logical client connection. Obtained from [`crate::Database::start_session`].
pub struct Session {
    catalog: Arc<Catalog>,
    inner: Arc<Mutex<EngineSession>>,
}

impl Session {
    pub(crate) fn new(catalog: Arc<Catalog>) -> Self {
        let inner = catalog.sessions().open();
        Session { catalog, inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.lock().session_id
    }

    pub fn has_active_transaction(&self) -> bool {
        self.inner.lock().has_active_transaction()
    }

    /// Begin an explicit multi-statement transaction on this session.
    /// Fails if one is already open.
    pub fn begin_transaction(&self) -> Result<()> {
        let tx = self.catalog.begin_transaction()?;
        self.inner.lock().begin(tx)
    }

    /// Commit the session's active transaction.
    pub fn commit_transaction(&self) -> Result<Lsn> {
        let mut tx = self.take_active()?;
        self.catalog.commit_transaction(&mut tx)
    }

    /// Abort the session's active transaction, undoing every write it made.
    pub fn abort_transaction(&self) -> Result<()> {
        let mut tx = self.take_active()?;
        self.catalog.abort_transaction(&mut tx)
    }

    pub fn create_savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let tx = guard.active()?;
        self.catalog.create_savepoint(tx, name);
        Ok(())
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let tx = guard.active()?;
        self.catalog.rollback_to_savepoint(tx, name)
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let tx = guard.active()?;
        self.catalog.release_savepoint(tx, name)
    }

    /// Drop the session. Does not abort a still-open transaction;
    /// callers must do that first (mirrors [`lauradb_concurrency::SessionManager::close`]).
    pub fn close(&self) {
        self.catalog.sessions().close(self.id());
    }

    fn take_active(&self) -> Result<TransactionContext> {
        let mut guard = self.inner.lock();
        guard
            .end()
            .ok_or_else(|| Error::invalid_argument("no transaction is active on this session"))
    }

    /// Run `f` inside the session's active transaction if one is open;
    /// otherwise run it as its own auto-committing transaction. Used by
    /// every [`crate::CollectionHandle`] write/read-with-snapshot op.
    pub(crate) fn with_tx<R>(&self, f: impl FnOnce(&mut TransactionContext) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.lock();
        if guard.has_active_transaction() {
            let tx = guard.active()?;
            f(tx)
        } else {
            drop(guard);
            self.catalog.with_transaction(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;
    use lauradb_core::value::{Document, Value};
    use lauradb_engine::Config;
    use tempfile::tempdir;

    #[test]
    fn savepoint_rollback_keeps_the_earlier_insert() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();

        session.begin_transaction().unwrap();
        let mut alice = Document::new();
        alice.set("name", Value::String("Alice".into()));
        let a = users.insert_one(&session, alice).unwrap();

        session.create_savepoint("sp").unwrap();
        let mut bob = Document::new();
        bob.set("name", Value::String("Bob".into()));
        users.insert_one(&session, bob).unwrap();

        session.rollback_to_savepoint("sp").unwrap();
        session.commit_transaction().unwrap();

        assert_eq!(users.count(&session, &serde_json::json!({})).unwrap(), 1);
        let survivor = users.find_one(&session, &serde_json::json!({})).unwrap().unwrap();
        assert_eq!(survivor.id().copied(), Some(Value::ObjectId(a)));
    }

    #[test]
    fn aborting_an_explicit_transaction_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();

        session.begin_transaction().unwrap();
        let mut doc = Document::new();
        doc.set("name", Value::String("Carol".into()));
        users.insert_one(&session, doc).unwrap();
        session.abort_transaction().unwrap();

        assert_eq!(users.count(&session, &serde_json::json!({})).unwrap(), 0);
    }
}
