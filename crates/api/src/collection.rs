//! Collection ops (§6): `insert_one`/`find`/`update_one`/`delete_one`/
//! `aggregate`/index management, each one running inside whichever
//! transaction (if any) is active on the [`Session`] passed to it.

use lauradb_core::value::Document;
use lauradb_core::{ObjectId, Result};
use lauradb_engine::{Catalog, FindOptions, IndexDefinition, UpdateResult};
use std::sync::Arc;
use std::time::Duration;

use crate::session::Session;

/// Snapshot of a collection's size and index set, as returned by `stats()`.
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: u64,
    pub indexes: Vec<IndexDefinition>,
}

/// A handle bound to one named collection within a [`crate::Database`].
pub struct CollectionHandle {
    catalog: Arc<Catalog>,
    name: String,
}

impl CollectionHandle {
    pub(crate) fn new(catalog: Arc<Catalog>, name: String) -> Self {
        CollectionHandle { catalog, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert_one(&self, session: &Session, doc: Document) -> Result<ObjectId> {
        session.with_tx(|tx| self.catalog.insert_one(tx, &self.name, doc))
    }

    /// Insert every document in `docs`, in order, within a single
    /// transaction. A failure partway through (e.g. a unique-index
    /// conflict) rolls back every insert already made in this call.
    pub fn insert_many(&self, session: &Session, docs: Vec<Document>) -> Result<Vec<ObjectId>> {
        session.with_tx(|tx| {
            docs.into_iter().map(|doc| self.catalog.insert_one(tx, &self.name, doc)).collect()
        })
    }

    pub fn find_one(&self, session: &Session, filter: &serde_json::Value) -> Result<Option<Document>> {
        let _ = session;
        self.collection()?.find_one(filter)
    }

    pub fn find(&self, session: &Session, filter: &serde_json::Value, options: &FindOptions) -> Result<Vec<Document>> {
        let _ = session;
        self.collection()?.find(filter, options)
    }

    /// Materialize `find`'s result set behind a server-side cursor and
    /// return its id for `next_batch`/`close_cursor`.
    pub fn find_cursor(&self, session: &Session, filter: &serde_json::Value, options: &FindOptions) -> Result<u64> {
        let docs = self.find(session, filter, options)?;
        Ok(self.catalog.cursors().create(docs, self.catalog_cursor_timeout()))
    }

    pub fn update_one(&self, session: &Session, filter: &serde_json::Value, update: &serde_json::Value) -> Result<UpdateResult> {
        session.with_tx(|tx| self.catalog.update_one(tx, &self.name, filter, update))
    }

    pub fn delete_one(&self, session: &Session, filter: &serde_json::Value) -> Result<u64> {
        session.with_tx(|tx| self.catalog.delete_one(tx, &self.name, filter))
    }

    pub fn count(&self, session: &Session, filter: &serde_json::Value) -> Result<u64> {
        let _ = session;
        self.collection()?.count(filter)
    }

    pub fn aggregate(&self, session: &Session, pipeline: &[serde_json::Value]) -> Result<Vec<Document>> {
        let _ = session;
        let coll = self.collection()?;
        let catalog = self.catalog.clone();
        struct CatalogLookups(Arc<Catalog>);
        impl lauradb_engine::aggregate::LookupSource for CatalogLookups {
            fn documents_in(&self, collection: &str) -> Result<Vec<Document>> {
                self.0.collection(collection)?.find(&serde_json::json!({}), &FindOptions::default())
            }
        }
        coll.aggregate(pipeline, &CatalogLookups(catalog))
    }

    pub fn create_index(&self, def: IndexDefinition) -> Result<String> {
        self.catalog.create_index(&self.name, def)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.catalog.drop_index(&self.name, name)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDefinition>> {
        Ok(self.collection()?.list_indexes())
    }

    pub fn stats(&self) -> Result<CollectionStats> {
        let coll = self.collection()?;
        Ok(CollectionStats {
            name: self.name.clone(),
            document_count: coll.doc_count(),
            indexes: coll.list_indexes(),
        })
    }

    /// Every live document's `_id`, for the repair tool's validator.
    pub fn document_ids(&self) -> Result<Vec<ObjectId>> {
        self.collection()?.document_ids()
    }

    pub fn get_by_id(&self, id: &ObjectId) -> Result<Option<Document>> {
        self.collection()?.get_by_id(id)
    }

    /// Raw `(key, id)` pairs actually stored in `index_name`'s tree.
    pub fn index_entries(&self, index_name: &str) -> Result<Vec<(Vec<u8>, ObjectId)>> {
        self.collection()?.index_entries(index_name)
    }

    /// The keys `index_name` should contain, recomputed from the live
    /// document set.
    pub fn expected_index_keys(&self, index_name: &str) -> Result<std::collections::HashSet<Vec<u8>>> {
        self.collection()?.expected_index_keys(index_name)
    }

    pub fn fix_missing_index_entry(&self, session: &Session, index_name: &str, id: &ObjectId) -> Result<()> {
        session.with_tx(|tx| self.collection()?.fix_missing_index_entry(tx, index_name, id))
    }

    pub fn fix_orphaned_index_entry(&self, session: &Session, index_name: &str, key: &[u8]) -> Result<()> {
        session.with_tx(|tx| self.collection()?.fix_orphaned_index_entry(tx, index_name, key))
    }

    fn collection(&self) -> Result<Arc<lauradb_engine::Collection>> {
        self.catalog.collection(&self.name)
    }

    fn catalog_cursor_timeout(&self) -> Duration {
        // Matches the default used by `lauradb_engine::Config`; a
        // per-call override can be added once a caller needs one.
        Duration::from_secs(600)
    }
}
