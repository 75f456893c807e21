//! The catalog (§6): owns the page file, WAL, buffer pool, and the
//! registry of open collections. `Catalog::open` replays the WAL,
//! recovers the collection registry from the on-disk catalog B+tree
//! (rooted at the meta page's `catalog_root`), and wires together the
//! transaction manager, session manager, cursor manager, and oplog.

use crate::change_stream::ChangeStream;
use crate::collection::Collection;
use crate::config::Config;
use crate::index::IndexDefinition;
use lauradb_concurrency::transaction::TransactionContext;
use lauradb_concurrency::{LockManager, SessionManager, TransactionManager};
use lauradb_core::key::encode_compound;
use lauradb_core::value::{Document, Value};
use lauradb_core::{Error, ObjectId, Result};
use lauradb_durability::oplog::{oplog_path, OpType, OplogEntry, OplogWriter};
use lauradb_durability::recovery::{replay, PageSink};
use lauradb_durability::{Lsn, TxId, WalWriter};
use lauradb_storage::btree::{BTree, BTreeConfig};
use lauradb_storage::pagefile::{MetaPage, PageFile, NONE_PAGE};
use lauradb_storage::{BufferPool, PageId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
struct CollectionRecord {
    primary_root: PageId,
    indexes: Vec<(IndexDefinition, PageId)>,
    doc_count: u64,
}

struct PageFileSink<'a>(&'a mut PageFile);

impl PageSink for PageFileSink<'_> {
    fn apply_page(&mut self, page_id: PageId, after: &[u8]) -> std::io::Result<()> {
        self.0
            .write_raw(page_id, after)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// The top-level database handle (§6): `Catalog::open`/`close`, the
/// collection registry, and every cross-cutting facility (transactions,
/// sessions, cursors, change streams).
pub struct Catalog {
    config: Config,
    pool: Arc<BufferPool>,
    tx_manager: TransactionManager,
    sessions: SessionManager,
    cursors: crate::cursor::CursorManager,
    oplog: Option<Mutex<OplogWriter>>,
    catalog_root: Mutex<PageId>,
    collections: dashmap::DashMap<String, Arc<Collection>>,
    pending_oplog: dashmap::DashMap<TxId, Vec<OplogEntry>>,
    last_checkpoint_at: AtomicI64,
}

impl Catalog {
    /// Open (creating if absent) the database rooted at `config.data_dir`:
    /// replay the WAL, rebuild the collection registry, and start the
    /// ambient services (§4.3 crash recovery, §6 configuration).
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let pages_path = config.data_dir.join("pages.db");
        let wal_dir = config.data_dir.join("wal");

        let mut page_file = if pages_path.exists() {
            PageFile::open(&pages_path, config.page_size)?
        } else {
            PageFile::create(&pages_path, config.page_size)?
        };

        let report = {
            let mut sink = PageFileSink(&mut page_file);
            replay(&wal_dir, &mut sink)?
        };
        info!(
            target: "lauradb::catalog",
            applied = report.applied_updates,
            committed_txns = report.committed_tx_count,
            "recovery replay complete"
        );

        let wal = Arc::new(WalWriter::open(wal_dir, config.wal_sync_mode.to_durability_mode())?);
        wal.restore_counters(report.max_lsn, report.max_tx_id);

        let meta = page_file.read_meta()?;
        let pool = Arc::new(BufferPool::new(page_file, wal.clone(), config.buffer_pool_frames));
        let tx_manager = TransactionManager::new(wal, pool.clone(), config.lock_wait_timeout);

        let catalog_root = if meta.catalog_root == NONE_PAGE {
            let mut tx = tx_manager.begin()?;
            let root = BTree::create(&pool, tx.tx_id, BTreeConfig { unique: true })?.root();
            write_catalog_root(&pool, &mut tx, root)?;
            tx_manager.commit(&mut tx)?;
            root
        } else {
            meta.catalog_root
        };

        let collections = dashmap::DashMap::new();
        let catalog_tree = BTree::open(&pool, catalog_root, BTreeConfig { unique: true });
        for (key, value) in catalog_tree.scan(None, None)? {
            let name = decode_collection_name(&key)?;
            let record: CollectionRecord =
                serde_json::from_slice(&value).map_err(|e| Error::corruption(format!("bad catalog record: {e}")))?;
            let coll = Collection::open(
                name.clone(),
                pool.clone(),
                tx_manager.lock_manager().clone(),
                record.primary_root,
                record.indexes,
                record.doc_count,
            );
            collections.insert(name, Arc::new(coll));
        }

        let oplog = if config.enable_oplog {
            Some(Mutex::new(OplogWriter::open(&oplog_path(&config.data_dir))?))
        } else {
            None
        };

        Ok(Catalog {
            config,
            pool,
            tx_manager,
            sessions: SessionManager::new(),
            cursors: crate::cursor::CursorManager::new(),
            oplog,
            catalog_root: Mutex::new(catalog_root),
            collections,
            pending_oplog: dashmap::DashMap::new(),
            last_checkpoint_at: AtomicI64::new(now_ms()),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn cursors(&self) -> &crate::cursor::CursorManager {
        &self.cursors
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.tx_manager.lock_manager()
    }

    pub fn begin_transaction(&self) -> Result<TransactionContext> {
        self.tx_manager.begin()
    }

    /// Commit `tx`, flushing any oplog entries queued against it (§4.12):
    /// change-stream subscribers only ever see a mutation once its
    /// transaction has actually committed.
    pub fn commit_transaction(&self, tx: &mut TransactionContext) -> Result<Lsn> {
        let lsn = self.tx_manager.commit(tx)?;
        if let Some((_, entries)) = self.pending_oplog.remove(&tx.tx_id) {
            if let Some(oplog) = &self.oplog {
                let mut writer = oplog.lock();
                for mut entry in entries {
                    entry.lsn = lsn;
                    writer.append(&entry)?;
                }
            }
        }
        Ok(lsn)
    }

    /// Abort `tx`: undo every write it made (recomputing secondary index
    /// diffs per collection) and discard any oplog entries it had
    /// queued, since they never committed.
    pub fn abort_transaction(&self, tx: &mut TransactionContext) -> Result<()> {
        self.pending_oplog.remove(&tx.tx_id);
        for entry in tx.drain_undo_for_abort() {
            if let Some(coll) = self.collections.get(&entry.collection) {
                coll.undo(tx.tx_id, &entry)?;
            }
        }
        self.tx_manager.abort(tx)
    }

    /// Mark `name` at the transaction's current undo-log position
    /// (§4.6). `rollback_to_savepoint` later replays everything
    /// recorded after this point.
    pub fn create_savepoint(&self, tx: &mut TransactionContext, name: &str) {
        tx.create_savepoint(name);
    }

    /// Undo every write recorded since `name` was created, recomputing
    /// secondary index diffs per collection exactly as a full abort
    /// does, but leaving the transaction itself active so the caller
    /// can keep going or commit.
    pub fn rollback_to_savepoint(&self, tx: &mut TransactionContext, name: &str) -> Result<()> {
        for entry in tx.rollback_to_savepoint(name)? {
            if let Some(coll) = self.collections.get(&entry.collection) {
                coll.undo(tx.tx_id, &entry)?;
            }
        }
        Ok(())
    }

    /// Release `name` without rolling back; its undo entries fold into
    /// the enclosing scope (or the transaction as a whole).
    pub fn release_savepoint(&self, tx: &mut TransactionContext, name: &str) -> Result<()> {
        tx.release_savepoint(name)
    }

    /// Run `f` inside an implicit transaction: commit on success, abort
    /// on any error. Used by every top-level single-statement operation;
    /// explicit multi-statement transactions instead hold their own
    /// [`TransactionContext`] across several of these calls via a
    /// session.
    pub fn with_transaction<R>(&self, f: impl FnOnce(&mut TransactionContext) -> Result<R>) -> Result<R> {
        let mut tx = self.begin_transaction()?;
        match f(&mut tx) {
            Ok(value) => {
                self.commit_transaction(&mut tx)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.abort_transaction(&mut tx);
                Err(err)
            }
        }
    }

    fn queue_oplog(&self, tx_id: TxId, op: OpType, collection: &str, doc_id: Option<ObjectId>, document: Option<Document>, pre_image: Option<Document>) {
        if self.oplog.is_none() {
            return;
        }
        let entry = OplogEntry {
            lsn: 0,
            timestamp_ms: now_ms(),
            op,
            database: "lauradb".into(),
            collection: collection.into(),
            doc_id,
            document,
            pre_image,
        };
        self.pending_oplog.entry(tx_id).or_default().push(entry);
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_found(format!("no such collection: {name}")))
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }

    /// The configuration this catalog was opened with, for tools that
    /// need to reach the raw page file directly (e.g. the defragmenter
    /// reading the allocator's high-water mark).
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_collection(&self, name: &str) -> Result<()> {
        if self.collections.contains_key(name) {
            return Err(Error::conflict(format!("collection {name} already exists")));
        }
        self.with_transaction(|tx| {
            let coll = Collection::create(name, self.pool.clone(), self.lock_manager().clone(), tx.tx_id)?;
            self.persist_record(tx, name, &coll)?;
            self.collections.insert(name.to_string(), Arc::new(coll));
            self.queue_oplog(tx.tx_id, OpType::CreateCollection, name, None, None, None);
            Ok(())
        })
    }

    /// Drop a collection: frees its primary tree, every secondary index
    /// tree, and any overflow chains, then forgets its catalog entry.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        if !self.collections.contains_key(name) {
            return Err(Error::not_found(format!("no such collection: {name}")));
        }
        self.with_transaction(|tx| {
            let coll = self.collection(name)?;
            coll.destroy(tx.tx_id)?;
            self.remove_record(tx, name)?;
            self.collections.remove(name);
            self.queue_oplog(tx.tx_id, OpType::DropCollection, name, None, None, None);
            Ok(())
        })
    }

    pub fn create_index(&self, collection: &str, def: IndexDefinition) -> Result<String> {
        self.with_transaction(|tx| {
            let coll = self.collection(collection)?;
            let name = coll.create_index(tx, def)?;
            self.persist_record(tx, collection, &coll)?;
            self.queue_oplog(tx.tx_id, OpType::CreateIndex, collection, None, None, None);
            Ok(name)
        })
    }

    pub fn drop_index(&self, collection: &str, index_name: &str) -> Result<()> {
        self.with_transaction(|tx| {
            let coll = self.collection(collection)?;
            coll.drop_index(tx, index_name)?;
            self.persist_record(tx, collection, &coll)?;
            self.queue_oplog(tx.tx_id, OpType::DropIndex, collection, None, None, None);
            Ok(())
        })
    }

    pub fn insert_one(&self, tx: &mut TransactionContext, collection: &str, doc: Document) -> Result<ObjectId> {
        let coll = self.collection(collection)?;
        let id = coll.insert_one(tx, doc)?;
        self.persist_record(tx, collection, &coll)?;
        if self.oplog.is_some() {
            let post = coll.find_one(&serde_json::json!({"_id": {"$oid": id.to_string()}}))?;
            self.queue_oplog(tx.tx_id, OpType::Insert, collection, Some(id), post, None);
        }
        Ok(id)
    }

    pub fn update_one(
        &self,
        tx: &mut TransactionContext,
        collection: &str,
        filter: &serde_json::Value,
        update: &serde_json::Value,
    ) -> Result<crate::collection::UpdateResult> {
        let coll = self.collection(collection)?;
        let pre = coll.find_one(filter)?;
        let result = coll.update_one(tx, filter, update)?;
        if result.modified > 0 {
            self.persist_record(tx, collection, &coll)?;
            if self.oplog.is_some() {
                if let Some(pre_doc) = &pre {
                    if let Some(Value::ObjectId(id)) = pre_doc.id().copied() {
                        let post = coll.find_one(&serde_json::json!({"_id": {"$oid": id.to_string()}}))?;
                        self.queue_oplog(tx.tx_id, OpType::Update, collection, Some(id), post, pre);
                    }
                }
            }
        }
        Ok(result)
    }

    pub fn delete_one(&self, tx: &mut TransactionContext, collection: &str, filter: &serde_json::Value) -> Result<u64> {
        let coll = self.collection(collection)?;
        let pre = coll.find_one(filter)?;
        let removed = coll.delete_one(tx, filter)?;
        if removed > 0 {
            self.persist_record(tx, collection, &coll)?;
            if self.oplog.is_some() {
                let doc_id = pre.as_ref().and_then(|d| d.id()).and_then(|v| if let Value::ObjectId(id) = v { Some(*id) } else { None });
                self.queue_oplog(tx.tx_id, OpType::Delete, collection, doc_id, None, pre);
            }
        }
        Ok(removed)
    }

    /// Open a resumable change stream over `collection` (§4.12).
    pub fn change_stream(&self, collection: &str, filter: Option<serde_json::Value>, resume_from: Option<lauradb_durability::oplog::ResumeToken>) -> Result<ChangeStream> {
        if self.oplog.is_none() {
            return Err(Error::unsupported("change streams require enable_oplog"));
        }
        Ok(ChangeStream::new(oplog_path(&self.config.data_dir), collection, filter, resume_from))
    }

    /// Sweep every TTL index across every collection, deleting expired
    /// documents through the normal (undo-logged) delete path (§4.13).
    pub fn sweep_ttl(&self) -> Result<u64> {
        let now = (now_ms() / 1000).max(0);
        let mut total = 0u64;
        let names: Vec<String> = self.list_collections();
        for name in names {
            let coll = self.collection(&name)?;
            total += self.with_transaction(|tx| coll.sweep_ttl(tx, now))?;
        }
        Ok(total)
    }

    /// Flush every dirty page, persist every collection's latest root
    /// pointers, and record a WAL checkpoint (§4.3).
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.with_transaction(|tx| {
            for entry in self.collections.iter() {
                self.persist_record(tx, entry.key(), entry.value())?;
            }
            Ok(())
        })?;
        let lsn = self.pool.checkpoint()?;
        self.last_checkpoint_at.store(now_ms(), Ordering::Relaxed);
        debug!(target: "lauradb::catalog", lsn, "checkpoint complete");
        Ok(lsn)
    }

    /// Flush all pending writes before shutting down.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        Ok(())
    }

    fn persist_record(&self, tx: &mut TransactionContext, name: &str, coll: &Collection) -> Result<()> {
        let record = CollectionRecord {
            primary_root: coll.primary_root(),
            indexes: coll.index_roots(),
            doc_count: coll.doc_count(),
        };
        let bytes = serde_json::to_vec(&record)?;
        let key = collection_key(name);
        let mut root = self.catalog_root.lock();
        let mut tree = BTree::open(&self.pool, *root, BTreeConfig { unique: true });
        tree.insert(tx.tx_id, &key, &bytes)?;
        if tree.root() != *root {
            *root = tree.root();
            write_catalog_root(&self.pool, tx, *root)?;
        }
        Ok(())
    }

    fn remove_record(&self, tx: &mut TransactionContext, name: &str) -> Result<()> {
        let key = collection_key(name);
        let mut root = self.catalog_root.lock();
        let mut tree = BTree::open(&self.pool, *root, BTreeConfig { unique: true });
        tree.delete(tx.tx_id, &key)?;
        if tree.root() != *root {
            *root = tree.root();
            write_catalog_root(&self.pool, tx, *root)?;
        }
        Ok(())
    }
}

fn collection_key(name: &str) -> Vec<u8> {
    encode_compound(&[&Value::String(name.to_string())])
}

fn decode_collection_name(key: &[u8]) -> Result<String> {
    let (value, _) = lauradb_core::key::decode_value(key).map_err(Error::corruption)?;
    match value {
        Value::String(s) => Ok(s),
        _ => Err(Error::corruption("catalog key did not decode to a collection name")),
    }
}

fn write_catalog_root(pool: &BufferPool, tx: &mut TransactionContext, root: PageId) -> Result<()> {
    pool.pin(0)?;
    let page_size = pool.page_size();
    pool.write_page(tx.tx_id, 0, |page| {
        let mut meta = MetaPage::from_page(page);
        meta.catalog_root = root;
        *page = meta.to_page(page_size);
    })?;
    pool.unpin(0, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_catalog(dir: &Path) -> Catalog {
        let config = Config::new(dir.to_path_buf());
        Catalog::open(config).unwrap()
    }

    #[test]
    fn create_collection_then_insert_and_find() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("users").unwrap();

        catalog
            .with_transaction(|tx| {
                let mut doc = Document::new();
                doc.set("name", Value::String("Alice".into()));
                catalog.insert_one(tx, "users", doc)
            })
            .unwrap();

        let coll = catalog.collection("users").unwrap();
        let found = coll.find_one(&serde_json::json!({"name": "Alice"})).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn reopening_recovers_collections_and_documents() {
        let dir = tempdir().unwrap();
        {
            let catalog = open_test_catalog(dir.path());
            catalog.create_collection("users").unwrap();
            catalog
                .with_transaction(|tx| {
                    let mut doc = Document::new();
                    doc.set("name", Value::String("Bob".into()));
                    catalog.insert_one(tx, "users", doc)
                })
                .unwrap();
            catalog.close().unwrap();
        }

        let reopened = open_test_catalog(dir.path());
        assert_eq!(reopened.list_collections(), vec!["users".to_string()]);
        let coll = reopened.collection("users").unwrap();
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 1);
    }

    #[test]
    fn dropping_a_collection_forgets_it() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("temp").unwrap();
        catalog.drop_collection("temp").unwrap();
        assert!(catalog.collection("temp").is_err());
    }

    #[test]
    fn change_stream_reports_a_committed_insert() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("users").unwrap();
        let mut stream = catalog.change_stream("users", None, None).unwrap();

        catalog
            .with_transaction(|tx| {
                let mut doc = Document::new();
                doc.set("name", Value::String("Carol".into()));
                catalog.insert_one(tx, "users", doc)
            })
            .unwrap();

        let events = stream.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, OpType::Insert);
    }

    #[test]
    fn aborting_a_transaction_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("users").unwrap();

        let mut tx = catalog.begin_transaction().unwrap();
        let mut doc = Document::new();
        doc.set("name", Value::String("Dave".into()));
        catalog.insert_one(&mut tx, "users", doc).unwrap();
        catalog.abort_transaction(&mut tx).unwrap();

        let coll = catalog.collection("users").unwrap();
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 0);
    }

    #[test]
    fn rollback_to_savepoint_keeps_only_the_earlier_insert() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("users").unwrap();

        let mut tx = catalog.begin_transaction().unwrap();
        let mut alice = Document::new();
        alice.set("name", Value::String("Alice".into()));
        let a = catalog.insert_one(&mut tx, "users", alice).unwrap();

        catalog.create_savepoint(&mut tx, "sp");
        let mut bob = Document::new();
        bob.set("name", Value::String("Bob".into()));
        catalog.insert_one(&mut tx, "users", bob).unwrap();

        catalog.rollback_to_savepoint(&mut tx, "sp").unwrap();
        catalog.commit_transaction(&mut tx).unwrap();

        let coll = catalog.collection("users").unwrap();
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 1);
        let survivor = coll.find_one(&serde_json::json!({})).unwrap().unwrap();
        assert_eq!(survivor.id().copied(), Some(Value::ObjectId(a)));
    }

    #[test]
    fn partial_index_entry_tracks_the_document_crossing_the_filter_boundary() {
        let dir = tempdir().unwrap();
        let catalog = open_test_catalog(dir.path());
        catalog.create_collection("orders").unwrap();
        catalog
            .create_index(
                "orders",
                crate::index::IndexDefinition {
                    name: "active_total_idx".into(),
                    kind: crate::index::IndexKind::BTree,
                    field_paths: vec!["total".into()],
                    unique: false,
                    sparse: false,
                    partial_filter: Some(serde_json::json!({"status": "active"})),
                    ttl_seconds: None,
                    geo_cell_size: None,
                },
            )
            .unwrap();

        let mut doc = Document::new();
        doc.set("status", Value::String("pending".into()));
        doc.set("total", Value::Int64(10));
        let id = catalog.with_transaction(|tx| catalog.insert_one(tx, "orders", doc)).unwrap();

        let coll = catalog.collection("orders").unwrap();
        assert_eq!(coll.index_entries("active_total_idx").unwrap().len(), 0);

        catalog
            .with_transaction(|tx| {
                catalog.update_one(
                    tx,
                    "orders",
                    &serde_json::json!({"_id": {"$oid": id.to_string()}}),
                    &serde_json::json!({"$set": {"status": "active"}}),
                )
            })
            .unwrap();
        assert_eq!(coll.index_entries("active_total_idx").unwrap().len(), 1);

        catalog
            .with_transaction(|tx| {
                catalog.update_one(
                    tx,
                    "orders",
                    &serde_json::json!({"_id": {"$oid": id.to_string()}}),
                    &serde_json::json!({"$set": {"status": "closed"}}),
                )
            })
            .unwrap();
        assert_eq!(coll.index_entries("active_total_idx").unwrap().len(), 0);
    }
}
