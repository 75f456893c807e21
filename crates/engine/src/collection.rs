//! Collection and secondary index registry (§4.7): the primary B+tree
//! keyed by `_id`, secondary index maintenance on every write, and the
//! query surface (`find`/`update_one`/`delete_one`/`aggregate`/…) that
//! the catalog hands out per collection name.

use crate::index::IndexDefinition;
use crate::query::{filter, planner, update as update_ops};
use lauradb_core::key::{decode_value, encode_compound};
use lauradb_core::value::{Document, Value};
use lauradb_core::{Error, ErrorContext, ObjectId, Result};
use lauradb_concurrency::transaction::{TransactionContext, UndoEntry};
use lauradb_concurrency::{LockManager, ResourceKey};
use lauradb_durability::TxId;
use lauradb_storage::btree::{BTree, BTreeConfig};
use lauradb_storage::overflow::{free_overflow, read_overflow, write_overflow, OVERFLOW_THRESHOLD};
use lauradb_storage::{decode_document, encode_document, BufferPool};
use parking_lot::Mutex;
use std::sync::Arc;

const VALUE_TAG_INLINE: u8 = 0;
const VALUE_TAG_OVERFLOW: u8 = 1;

fn encode_doc_value(pool: &BufferPool, tx_id: TxId, doc: &Document) -> Result<Vec<u8>> {
    let body = encode_document(doc)?;
    if body.len() < OVERFLOW_THRESHOLD {
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(VALUE_TAG_INLINE);
        out.extend_from_slice(&body);
        Ok(out)
    } else {
        let head = write_overflow(pool, tx_id, &body)?;
        let mut out = Vec::with_capacity(9);
        out.push(VALUE_TAG_OVERFLOW);
        out.extend_from_slice(&head.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        Ok(out)
    }
}

fn decode_doc_value(pool: &BufferPool, bytes: &[u8]) -> Result<Document> {
    match bytes.first() {
        Some(&VALUE_TAG_INLINE) => decode_document(&bytes[1..]),
        Some(&VALUE_TAG_OVERFLOW) => {
            let head = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
            let len = u32::from_be_bytes(bytes[5..9].try_into().unwrap()) as usize;
            let body = read_overflow(pool, head, len)?;
            decode_document(&body)
        }
        _ => Err(Error::corruption("unknown document value tag")),
    }
}

/// Free any overflow chain a document value points to, before the value
/// itself is overwritten or the key deleted.
fn free_doc_value(pool: &BufferPool, tx_id: TxId, bytes: &[u8]) -> Result<()> {
    if bytes.first() == Some(&VALUE_TAG_OVERFLOW) {
        let head = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        free_overflow(pool, tx_id, head)?;
    }
    Ok(())
}

struct IndexEntry {
    def: IndexDefinition,
    root: lauradb_storage::PageId,
}

struct CollectionState {
    primary_root: lauradb_storage::PageId,
    indexes: Vec<IndexEntry>,
    doc_count: u64,
}

/// Options for `find`/`find_cursor` (§6): projection and sort, applied
/// post-fetch per §4.9.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<serde_json::Value>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

/// Result of `update_one`/`update_many` (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

/// A single collection: primary tree plus its secondary indexes.
pub struct Collection {
    pub name: String,
    pool: Arc<BufferPool>,
    lock_manager: Arc<LockManager>,
    state: Mutex<CollectionState>,
}

impl Collection {
    pub(crate) fn create(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        lock_manager: Arc<LockManager>,
        tx_id: TxId,
    ) -> Result<Self> {
        let root = BTree::create(&pool, tx_id, BTreeConfig { unique: true })?.root();
        Ok(Collection {
            name: name.into(),
            pool,
            lock_manager,
            state: Mutex::new(CollectionState { primary_root: root, indexes: Vec::new(), doc_count: 0 }),
        })
    }

    pub(crate) fn open(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        lock_manager: Arc<LockManager>,
        primary_root: lauradb_storage::PageId,
        indexes: Vec<(IndexDefinition, lauradb_storage::PageId)>,
        doc_count: u64,
    ) -> Self {
        Collection {
            name: name.into(),
            pool,
            lock_manager,
            state: Mutex::new(CollectionState {
                primary_root,
                indexes: indexes.into_iter().map(|(def, root)| IndexEntry { def, root }).collect(),
                doc_count,
            }),
        }
    }

    /// Acquire this transaction's exclusive lock on `key` within this
    /// collection before touching the primary tree (§4.10): real
    /// per-document write-write conflict detection, on top of (not
    /// instead of) the coarse `state` mutex that still serializes the
    /// in-memory bookkeeping itself.
    fn lock_document(&self, tx_id: TxId, key: &[u8]) -> Result<()> {
        self.lock_manager.acquire(tx_id, &ResourceKey::new(self.name.clone(), key.to_vec()))
    }

    pub(crate) fn primary_root(&self) -> lauradb_storage::PageId {
        self.state.lock().primary_root
    }

    pub(crate) fn index_roots(&self) -> Vec<(IndexDefinition, lauradb_storage::PageId)> {
        self.state.lock().indexes.iter().map(|e| (e.def.clone(), e.root)).collect()
    }

    /// Number of live documents, maintained incrementally by every
    /// insert/delete rather than recomputed by a scan.
    pub fn doc_count(&self) -> u64 {
        self.state.lock().doc_count
    }

    fn primary_tree<'a>(&self, state: &CollectionState, pool: &'a BufferPool) -> BTree<'a> {
        BTree::open(pool, state.primary_root, BTreeConfig { unique: true })
    }

    fn index_tree<'a>(&self, entry: &IndexEntry, pool: &'a BufferPool) -> BTree<'a> {
        BTree::open(pool, entry.root, BTreeConfig { unique: entry.def.unique })
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::for_collection(self.name.clone())
    }

    /// Free every page this collection owns: the primary tree, every
    /// secondary index tree, and any overflow chains still referenced
    /// by a live document. Called when the collection itself is
    /// actually being dropped, as opposed to merely forgotten from the
    /// catalog.
    pub(crate) fn destroy(&self, tx_id: TxId) -> Result<()> {
        let state = self.state.lock();
        for (_, value) in self.primary_tree(&state, &self.pool).scan(None, None)? {
            free_doc_value(&self.pool, tx_id, &value)?;
        }
        for entry in &state.indexes {
            self.index_tree(entry, &self.pool).destroy(tx_id)?;
        }
        self.primary_tree(&state, &self.pool).destroy(tx_id)
    }

    /// Insert one document, minting `_id` if absent. Rolls back every
    /// side effect (primary + secondary entries already written) if a
    /// unique index rejects the document, per §4.7.
    pub fn insert_one(&self, tx: &mut TransactionContext, mut doc: Document) -> Result<ObjectId> {
        let id = match doc.id() {
            Some(Value::ObjectId(id)) => *id,
            Some(_) => return Err(Error::invalid_argument("_id must be an object id").with_context(self.context())),
            None => {
                let id = ObjectId::new();
                doc.set("_id", Value::ObjectId(id));
                id
            }
        };

        let primary_key = encode_compound(&[&Value::ObjectId(id)]);
        self.lock_document(tx.tx_id, &primary_key)?;
        let mut state = self.state.lock();

        if self.primary_tree(&state, &self.pool).get(&primary_key)?.is_some() {
            return Err(Error::conflict(format!("duplicate _id {id}")).with_context(self.context()));
        }

        // Check every unique index ahead of any write, so a rejected
        // insert leaves no side effects anywhere (§8).
        for entry in &state.indexes {
            if !entry.def.unique {
                continue;
            }
            let tree = self.index_tree(entry, &self.pool);
            for tuple in entry.def.key_tuples(&doc) {
                let refs: Vec<&Value> = tuple.iter().collect();
                let key = encode_compound(&refs);
                if tree.get(&key)?.is_some() {
                    return Err(Error::conflict(format!("duplicate key for index {}", entry.def.name))
                        .with_context(self.context().with_operator("insert_one")));
                }
            }
        }

        let value_bytes = encode_doc_value(&self.pool, tx.tx_id, &doc)?;
        let mut primary = self.primary_tree(&state, &self.pool);
        primary.insert(tx.tx_id, &primary_key, &value_bytes)?;
        state.primary_root = primary.root();

        for entry in &mut state.indexes {
            let mut tree = BTree::open(&self.pool, entry.root, BTreeConfig { unique: entry.def.unique });
            for tuple in entry.def.key_tuples(&doc) {
                insert_index_entry(&mut tree, tx.tx_id, &entry.def, &tuple, &id)?;
            }
            entry.root = tree.root();
        }

        state.doc_count += 1;
        tx.push_undo(UndoEntry { collection: self.name.clone(), key: primary_key, before: None });
        Ok(id)
    }

    /// Fetch the first document matching `filter`.
    pub fn find_one(&self, filter_spec: &serde_json::Value) -> Result<Option<Document>> {
        Ok(self.find(filter_spec, &FindOptions::default())?.into_iter().next())
    }

    /// Fetch every document matching `filter`, applying the chosen
    /// index plan (§4.9) then a residual filter, followed by post-fetch
    /// sort/skip/limit.
    pub fn find(&self, filter_spec: &serde_json::Value, options: &FindOptions) -> Result<Vec<Document>> {
        let state = self.state.lock();
        let candidates = self.candidate_ids(&state, filter_spec)?;
        drop(state);

        let mut out = Vec::new();
        for id in candidates {
            if let Some(doc) = self.fetch_by_id(&id)? {
                if filter::matches(filter_spec, &doc)? {
                    out.push(doc);
                }
            }
        }

        if let Some(sort_spec) = &options.sort {
            crate::aggregate::run(&[serde_json::json!({"$sort": sort_spec})], out, &NoLookups)
                .map(|sorted| out = sorted)
                .ok();
        }
        if let Some(skip) = options.skip {
            out = out.into_iter().skip(skip).collect();
        }
        if let Some(limit) = options.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// The candidate `_id` set for `filter_spec`: either a scan bounded
    /// by the planner's chosen index range, or every document.
    fn candidate_ids(&self, state: &CollectionState, filter_spec: &serde_json::Value) -> Result<Vec<ObjectId>> {
        let defs: Vec<IndexDefinition> = state.indexes.iter().map(|e| e.def.clone()).collect();
        match planner::choose_plan(filter_spec, &defs) {
            planner::Plan::CollectionScan => {
                let primary = self.primary_tree(state, &self.pool);
                let entries = primary.scan(None, None)?;
                entries
                    .into_iter()
                    .map(|(k, _)| decode_id(&k))
                    .collect::<Result<_>>()
            }
            planner::Plan::IndexScan { index_name, range } => {
                let entry = state
                    .indexes
                    .iter()
                    .find(|e| e.def.name == index_name)
                    .expect("planner only names indexes it was given");
                let tree = self.index_tree(entry, &self.pool);
                let entries = tree.scan(range.low.as_deref(), range.high.as_deref())?;
                entries
                    .into_iter()
                    .map(|(_, v)| {
                        let bytes: [u8; 12] = v.as_slice().try_into().map_err(|_| Error::corruption("bad index value"))?;
                        Ok(ObjectId::from_bytes(bytes))
                    })
                    .collect::<Result<_>>()
            }
        }
    }

    fn fetch_by_id(&self, id: &ObjectId) -> Result<Option<Document>> {
        let state = self.state.lock();
        let primary = self.primary_tree(&state, &self.pool);
        let key = encode_compound(&[&Value::ObjectId(*id)]);
        match primary.get(&key)? {
            Some(bytes) => Ok(Some(decode_doc_value(&self.pool, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply `update_spec` to every document matching `filter_spec`;
    /// `only_first` implements `update_one` vs. a hypothetical
    /// `update_many` (§6 only names `update_one`, but the index
    /// maintenance diff is identical either way).
    pub fn update_one(
        &self,
        tx: &mut TransactionContext,
        filter_spec: &serde_json::Value,
        update_spec: &serde_json::Value,
    ) -> Result<UpdateResult> {
        let Some(before) = self.find_one(filter_spec)? else {
            return Ok(UpdateResult::default());
        };
        let id = match before.id() {
            Some(Value::ObjectId(id)) => *id,
            _ => return Err(Error::corruption("document missing _id").with_context(self.context())),
        };

        let mut after = before.clone();
        update_ops::apply_update(update_spec, &mut after)?;

        let primary_key = encode_compound(&[&Value::ObjectId(id)]);
        self.lock_document(tx.tx_id, &primary_key)?;
        let mut state = self.state.lock();

        // Unique-index pre-check against the new tuples (excluding this
        // document's own prior entries).
        for entry in &state.indexes {
            if !entry.def.unique {
                continue;
            }
            let tree = self.index_tree(entry, &self.pool);
            let before_tuples = entry.def.key_tuples(&before);
            let after_tuples = entry.def.key_tuples(&after);
            for tuple in &after_tuples {
                if before_tuples.contains(tuple) {
                    continue;
                }
                let refs: Vec<&Value> = tuple.iter().collect();
                let key = encode_compound(&refs);
                if tree.get(&key)?.is_some() {
                    return Err(Error::conflict(format!("duplicate key for index {}", entry.def.name))
                        .with_context(self.context().with_operator("update_one")));
                }
            }
        }

        let old_value_bytes = {
            let primary = self.primary_tree(&state, &self.pool);
            primary.get(&primary_key)?.expect("document just found by find_one")
        };
        free_doc_value(&self.pool, tx.tx_id, &old_value_bytes)?;
        let new_value_bytes = encode_doc_value(&self.pool, tx.tx_id, &after)?;

        let mut primary = self.primary_tree(&state, &self.pool);
        primary.insert(tx.tx_id, &primary_key, &new_value_bytes)?;
        state.primary_root = primary.root();

        for entry in &mut state.indexes {
            let mut tree = BTree::open(&self.pool, entry.root, BTreeConfig { unique: entry.def.unique });
            reconcile_index(&mut tree, tx.tx_id, &entry.def, &before, &after, &id)?;
            entry.root = tree.root();
        }

        tx.push_undo(UndoEntry { collection: self.name.clone(), key: primary_key, before: Some(old_value_bytes) });
        Ok(UpdateResult { matched: 1, modified: 1 })
    }

    /// Delete the first document matching `filter_spec`, returning how
    /// many were removed (0 or 1).
    pub fn delete_one(&self, tx: &mut TransactionContext, filter_spec: &serde_json::Value) -> Result<u64> {
        let Some(doc) = self.find_one(filter_spec)? else {
            return Ok(0);
        };
        let id = match doc.id() {
            Some(Value::ObjectId(id)) => *id,
            _ => return Err(Error::corruption("document missing _id").with_context(self.context())),
        };

        let primary_key = encode_compound(&[&Value::ObjectId(id)]);
        self.lock_document(tx.tx_id, &primary_key)?;
        let mut state = self.state.lock();
        let mut primary = self.primary_tree(&state, &self.pool);
        let old_value_bytes = primary.delete(tx.tx_id, &primary_key)?;
        state.primary_root = primary.root();

        if let Some(bytes) = &old_value_bytes {
            free_doc_value(&self.pool, tx.tx_id, bytes)?;
        }

        for entry in &mut state.indexes {
            let mut tree = BTree::open(&self.pool, entry.root, BTreeConfig { unique: entry.def.unique });
            for tuple in entry.def.key_tuples(&doc) {
                remove_index_entry(&mut tree, tx.tx_id, &entry.def, &tuple, &id)?;
            }
            entry.root = tree.root();
        }

        state.doc_count = state.doc_count.saturating_sub(1);
        tx.push_undo(UndoEntry { collection: self.name.clone(), key: primary_key, before: old_value_bytes });
        Ok(1)
    }

    pub fn count(&self, filter_spec: &serde_json::Value) -> Result<u64> {
        if is_empty_filter(filter_spec) {
            return Ok(self.doc_count());
        }
        Ok(self.find(filter_spec, &FindOptions::default())?.len() as u64)
    }

    pub fn aggregate(&self, pipeline: &[serde_json::Value], lookups: &dyn crate::aggregate::LookupSource) -> Result<Vec<Document>> {
        let all = self.find(&serde_json::json!({}), &FindOptions::default())?;
        crate::aggregate::run(pipeline, all, lookups)
    }

    pub fn create_index(&self, tx: &mut TransactionContext, def: IndexDefinition) -> Result<String> {
        let mut state = self.state.lock();
        if state.indexes.iter().any(|e| e.def.name == def.name) {
            return Err(Error::invalid_argument(format!("index {} already exists", def.name)).with_context(self.context()));
        }
        let root = BTree::create(&self.pool, tx.tx_id, BTreeConfig { unique: def.unique })?.root();
        let mut tree = BTree::open(&self.pool, root, BTreeConfig { unique: def.unique });

        let primary = self.primary_tree(&state, &self.pool);
        for (_, value) in primary.scan(None, None)? {
            let doc = decode_doc_value(&self.pool, &value)?;
            let id = match doc.id() {
                Some(Value::ObjectId(id)) => *id,
                _ => continue,
            };
            if def.field_paths.len() > 1 {
                let array_fields = def
                    .field_paths
                    .iter()
                    .filter(|p| matches!(doc.get_path(p), Some(Value::Array(_))))
                    .count();
                if array_fields > 1 {
                    return Err(Error::invalid_argument(format!(
                        "compound index {} cannot index two array fields on the same document",
                        def.name
                    ))
                    .with_context(self.context()));
                }
            }
            if let Some(pf) = &def.partial_filter {
                if !filter::matches(pf, &doc)? {
                    continue;
                }
            }
            for tuple in def.key_tuples(&doc) {
                insert_index_entry(&mut tree, tx.tx_id, &def, &tuple, &id)?;
            }
        }

        let name = def.name.clone();
        state.indexes.push(IndexEntry { def, root: tree.root() });
        Ok(name)
    }

    pub fn drop_index(&self, tx: &mut TransactionContext, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .indexes
            .iter()
            .position(|e| e.def.name == name)
            .ok_or_else(|| Error::not_found(format!("no such index: {name}")).with_context(self.context()))?;
        let entry = state.indexes.remove(pos);
        self.index_tree(&entry, &self.pool).destroy(tx.tx_id)?;
        Ok(())
    }

    pub fn list_indexes(&self) -> Vec<IndexDefinition> {
        self.state.lock().indexes.iter().map(|e| e.def.clone()).collect()
    }

    /// Fetch one document by its `_id`. Used by the normal query path
    /// internally, and exposed for the repair tool's validator, which
    /// needs to check an index entry against the document it claims to
    /// point at.
    pub fn get_by_id(&self, id: &ObjectId) -> Result<Option<Document>> {
        self.fetch_by_id(id)
    }

    /// Every `(_id)` of every live document, in primary-key order.
    pub fn document_ids(&self) -> Result<Vec<ObjectId>> {
        let state = self.state.lock();
        self.primary_tree(&state, &self.pool)
            .scan(None, None)?
            .into_iter()
            .map(|(key, _)| decode_id(&key))
            .collect()
    }

    /// Every raw `(key, id)` entry currently stored in `index_name`'s
    /// tree (§4.7, §9): the validator's view of what the index actually
    /// contains, as opposed to what it should contain.
    pub fn index_entries(&self, index_name: &str) -> Result<Vec<(Vec<u8>, ObjectId)>> {
        let state = self.state.lock();
        let entry = state
            .indexes
            .iter()
            .find(|e| e.def.name == index_name)
            .ok_or_else(|| Error::not_found(format!("no such index: {index_name}")).with_context(self.context()))?;
        self.index_tree(entry, &self.pool)
            .scan(None, None)?
            .into_iter()
            .map(|(key, value)| {
                let id = ObjectId::from_bytes(value.as_slice().try_into().map_err(|_| {
                    Error::corruption("index value was not a 12-byte object id")
                })?);
                Ok((key, id))
            })
            .collect()
    }

    /// The set of keys `index_name` *should* contain for its current
    /// definition and the document set as it stands right now. Compared
    /// against [`Self::index_entries`] by the repair tool to find
    /// missing and orphaned entries.
    pub fn expected_index_keys(&self, index_name: &str) -> Result<std::collections::HashSet<Vec<u8>>> {
        let def = self
            .list_indexes()
            .into_iter()
            .find(|d| d.name == index_name)
            .ok_or_else(|| Error::not_found(format!("no such index: {index_name}")).with_context(self.context()))?;
        let mut expected = std::collections::HashSet::new();
        for id in self.document_ids()? {
            if let Some(doc) = self.fetch_by_id(&id)? {
                if let Some(pf) = &def.partial_filter {
                    if !filter::matches(pf, &doc)? {
                        continue;
                    }
                }
                for tuple in def.key_tuples(&doc) {
                    expected.insert(index_key_for(&def, &tuple, &id));
                }
            }
        }
        Ok(expected)
    }

    /// Insert one missing index entry directly (§9 `fixMissingIndexEntry`):
    /// re-derives the key from the live document rather than trusting
    /// any caller-supplied bytes.
    pub fn fix_missing_index_entry(&self, tx: &mut TransactionContext, index_name: &str, id: &ObjectId) -> Result<()> {
        let doc = self
            .fetch_by_id(id)?
            .ok_or_else(|| Error::not_found(format!("document {id} no longer exists")).with_context(self.context()))?;
        let mut state = self.state.lock();
        let pos = state
            .indexes
            .iter()
            .position(|e| e.def.name == index_name)
            .ok_or_else(|| Error::not_found(format!("no such index: {index_name}")).with_context(self.context()))?;
        let (def, root) = (state.indexes[pos].def.clone(), state.indexes[pos].root);
        let mut tree = BTree::open(&self.pool, root, BTreeConfig { unique: def.unique });
        for tuple in def.key_tuples(&doc) {
            insert_index_entry(&mut tree, tx.tx_id, &def, &tuple, id)?;
        }
        state.indexes[pos].root = tree.root();
        Ok(())
    }

    /// Delete one stray index entry directly by its raw key (§9
    /// `fixOrphanedIndexEntry`): either the document it pointed at no
    /// longer exists, or it no longer derives this key.
    pub fn fix_orphaned_index_entry(&self, tx: &mut TransactionContext, index_name: &str, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .indexes
            .iter()
            .position(|e| e.def.name == index_name)
            .ok_or_else(|| Error::not_found(format!("no such index: {index_name}")).with_context(self.context()))?;
        let (unique, root) = (state.indexes[pos].def.unique, state.indexes[pos].root);
        let mut tree = BTree::open(&self.pool, root, BTreeConfig { unique });
        tree.delete(tx.tx_id, key)?;
        state.indexes[pos].root = tree.root();
        Ok(())
    }

    /// Sweep every `Ttl`-kind index and delete expired documents through
    /// the normal delete path (§4.13). The index key is the expiry
    /// timestamp itself (§4.13's "priority-keyed" index), so expired
    /// entries are a single bounded range scan — `[start, cutoff]` —
    /// against that tree rather than a scan of the whole collection.
    pub fn sweep_ttl(&self, tx: &mut TransactionContext, now: i64) -> Result<u64> {
        let ttl_entries: Vec<(IndexDefinition, lauradb_storage::PageId)> = {
            let state = self.state.lock();
            state
                .indexes
                .iter()
                .filter(|e| e.def.kind == crate::index::IndexKind::Ttl)
                .map(|e| (e.def.clone(), e.root))
                .collect()
        };
        let mut removed = 0;
        for (def, root) in ttl_entries {
            let ttl_seconds = def.ttl_seconds.unwrap_or(0);
            let cutoff = now.saturating_sub(ttl_seconds);
            let tree = BTree::open(&self.pool, root, BTreeConfig { unique: def.unique });
            let prefix = encode_compound(&[&Value::Timestamp(cutoff)]);
            let upper = lauradb_core::key::prefix_upper_bound(&prefix);
            let expired = tree.scan(None, upper.as_deref())?;
            for (_, value) in expired {
                let bytes: [u8; 12] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::corruption("ttl index value is not a 12-byte object id"))?;
                let id = ObjectId::from_bytes(bytes);
                self.delete_one(tx, &serde_json::json!({"_id": {"$oid": id.to_string()}}))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Re-apply an undone primary write during abort/rollback: restores
    /// (or removes) the primary entry and recomputes every secondary
    /// index's contribution for that document.
    pub(crate) fn undo(&self, tx_id: TxId, entry: &UndoEntry) -> Result<()> {
        let mut state = self.state.lock();
        let mut primary = self.primary_tree(&state, &self.pool);
        let current = primary.get(&entry.key)?;
        let current_doc = match &current {
            Some(bytes) => Some(decode_doc_value(&self.pool, bytes)?),
            None => None,
        };

        match &entry.before {
            None => {
                if let Some(bytes) = &current {
                    free_doc_value(&self.pool, tx_id, bytes)?;
                }
                primary.delete(tx_id, &entry.key)?;
            }
            Some(before_bytes) => {
                primary.insert(tx_id, &entry.key, before_bytes)?;
            }
        }
        state.primary_root = primary.root();

        let restored_doc = match &entry.before {
            Some(bytes) => Some(decode_doc_value(&self.pool, bytes)?),
            None => None,
        };
        let id = restored_doc
            .as_ref()
            .or(current_doc.as_ref())
            .and_then(|d| d.id())
            .and_then(|v| if let Value::ObjectId(id) = v { Some(*id) } else { None });

        if let Some(id) = id {
            for idx in &mut state.indexes {
                let mut tree = BTree::open(&self.pool, idx.root, BTreeConfig { unique: idx.def.unique });
                let before_tuples = match &current_doc {
                    Some(d) if index_admits(&idx.def, d)? => idx.def.key_tuples(d),
                    _ => Vec::new(),
                };
                let after_tuples = match &restored_doc {
                    Some(d) if index_admits(&idx.def, d)? => idx.def.key_tuples(d),
                    _ => Vec::new(),
                };
                diff_index_entries(&mut tree, tx_id, &idx.def, &before_tuples, &after_tuples, &id)?;
                idx.root = tree.root();
            }
        }
        Ok(())
    }
}

struct NoLookups;
impl crate::aggregate::LookupSource for NoLookups {
    fn documents_in(&self, _collection: &str) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }
}

fn is_empty_filter(spec: &serde_json::Value) -> bool {
    matches!(spec, serde_json::Value::Object(m) if m.is_empty())
}

fn decode_id(key: &[u8]) -> Result<ObjectId> {
    let (value, _) = decode_value(key).map_err(Error::corruption)?;
    match value {
        Value::ObjectId(id) => Ok(id),
        _ => Err(Error::corruption("primary key did not decode to an object id")),
    }
}

/// The exact on-disk key a `(tuple, id)` pair derives to in `def`'s
/// tree: the compound tuple alone for a unique index, the tuple with
/// `id` appended for disambiguation otherwise (§3, §4.4). Shared by the
/// normal write path and the repair tool's index validator so both
/// agree on what an entry is "supposed to" look like.
pub(crate) fn index_key_for(def: &IndexDefinition, tuple: &[Value], id: &ObjectId) -> Vec<u8> {
    let refs: Vec<&Value> = tuple.iter().collect();
    if def.unique {
        encode_compound(&refs)
    } else {
        lauradb_core::key::encode_non_unique(&refs, id)
    }
}

fn insert_index_entry(tree: &mut BTree, tx_id: TxId, def: &IndexDefinition, tuple: &[Value], id: &ObjectId) -> Result<()> {
    let key = index_key_for(def, tuple, id);
    tree.insert(tx_id, &key, id.as_bytes())?;
    Ok(())
}

fn remove_index_entry(tree: &mut BTree, tx_id: TxId, def: &IndexDefinition, tuple: &[Value], id: &ObjectId) -> Result<()> {
    let key = index_key_for(def, tuple, id);
    tree.delete(tx_id, &key)?;
    Ok(())
}

/// Recompute the set-difference between a document's index contribution
/// before and after an update (§4.7): delete keys no longer present,
/// insert newly present ones, leave unchanged ones alone. A partial
/// index's filter is re-evaluated against both images independently, so
/// a document crossing the filter boundary gets its entry added or
/// removed even when the indexed field value itself didn't change.
fn reconcile_index(tree: &mut BTree, tx_id: TxId, def: &IndexDefinition, before: &Document, after: &Document, id: &ObjectId) -> Result<()> {
    let before_tuples = if index_admits(def, before)? { def.key_tuples(before) } else { Vec::new() };
    let after_tuples = if index_admits(def, after)? { def.key_tuples(after) } else { Vec::new() };
    diff_index_entries(tree, tx_id, def, &before_tuples, &after_tuples, id)
}

/// Whether `doc` passes `def`'s partial filter (always true when there
/// is none).
fn index_admits(def: &IndexDefinition, doc: &Document) -> Result<bool> {
    match &def.partial_filter {
        Some(pf) => filter::matches(pf, doc),
        None => Ok(true),
    }
}

fn diff_index_entries(
    tree: &mut BTree,
    tx_id: TxId,
    def: &IndexDefinition,
    before_tuples: &[Vec<Value>],
    after_tuples: &[Vec<Value>],
    id: &ObjectId,
) -> Result<()> {
    for tuple in before_tuples {
        if !after_tuples.contains(tuple) {
            remove_index_entry(tree, tx_id, def, tuple, id)?;
        }
    }
    for tuple in after_tuples {
        if !before_tuples.contains(tuple) {
            insert_index_entry(tree, tx_id, def, tuple, id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_durability::{DurabilityMode, WalWriter};
    use std::time::Duration;
    use tempfile::tempdir;

    fn new_pool(dir: &std::path::Path) -> Arc<BufferPool> {
        let pf = lauradb_storage::pagefile::PageFile::create(&dir.join("pages.db"), lauradb_storage::pagefile::PAGE_SIZE).unwrap();
        let wal = Arc::new(WalWriter::open(dir.join("wal"), DurabilityMode::Sync).unwrap());
        Arc::new(BufferPool::new(pf, wal, 1024))
    }

    fn new_locks() -> Arc<LockManager> {
        Arc::new(LockManager::new(Duration::from_millis(200)))
    }

    fn tx(id: TxId) -> TransactionContext {
        TransactionContext::new(id, lauradb_concurrency::transaction::Snapshot::new(0))
    }

    #[test]
    fn insert_then_find_round_trips() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("users", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        doc.set("age", Value::Int64(30));
        let id = coll.insert_one(&mut t, doc).unwrap();

        let found = coll.find_one(&serde_json::json!({"name": "Alice"})).unwrap().unwrap();
        assert_eq!(found.get("age"), Some(&Value::Int64(30)));
        assert_eq!(found.id(), Some(&Value::ObjectId(id)));
    }

    #[test]
    fn unique_index_rejects_duplicate_and_keeps_count_at_one() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("users", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        coll.create_index(&mut t, IndexDefinition::btree("by_email", vec!["email".into()], true)).unwrap();

        let mut d1 = Document::new();
        d1.set("email", Value::String("x@y".into()));
        coll.insert_one(&mut t, d1).unwrap();

        let mut d2 = Document::new();
        d2.set("email", Value::String("x@y".into()));
        let err = coll.insert_one(&mut t, d2).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::Conflict);
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 1);
    }

    #[test]
    fn update_moves_secondary_index_entry() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("users", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        coll.create_index(&mut t, IndexDefinition::btree("by_name", vec!["name".into()], false)).unwrap();
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        coll.insert_one(&mut t, doc).unwrap();

        coll.update_one(&mut t, &serde_json::json!({"name": "Alice"}), &serde_json::json!({"$set": {"name": "Alicia"}})).unwrap();
        assert!(coll.find_one(&serde_json::json!({"name": "Alice"})).unwrap().is_none());
        assert!(coll.find_one(&serde_json::json!({"name": "Alicia"})).unwrap().is_some());
    }

    #[test]
    fn delete_removes_document_and_index_entries() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("users", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        coll.insert_one(&mut t, doc).unwrap();
        let deleted = coll.delete_one(&mut t, &serde_json::json!({"name": "Alice"})).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 0);
    }

    #[test]
    fn undo_reverses_an_insert() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("users", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        coll.insert_one(&mut t, doc).unwrap();
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 1);

        for entry in t.drain_undo_for_abort() {
            coll.undo(1, &entry).unwrap();
        }
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 0);
    }

    #[test]
    fn a_second_transaction_writing_the_same_document_times_out() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let locks = Arc::new(LockManager::new(Duration::from_millis(20)));
        let coll = Collection::create("users", pool, locks, 1).unwrap();

        let id = ObjectId::new();
        let mut t1 = tx(1);
        let mut doc1 = Document::new();
        doc1.set("_id", Value::ObjectId(id));
        doc1.set("name", Value::String("Alice".into()));
        coll.insert_one(&mut t1, doc1).unwrap();

        // `t1` never commits or aborts, so its lock on `id` is never
        // released; `t2` writing the same document must time out acquiring
        // it rather than racing straight through to the primary tree.
        let mut t2 = tx(2);
        let mut doc2 = Document::new();
        doc2.set("_id", Value::ObjectId(id));
        doc2.set("name", Value::String("Mallory".into()));
        let err = coll.insert_one(&mut t2, doc2).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::Timeout);
    }

    #[test]
    fn sweep_ttl_removes_only_expired_documents() {
        let dir = tempdir().unwrap();
        let pool = new_pool(dir.path());
        let coll = Collection::create("events", pool, new_locks(), 1).unwrap();
        let mut t = tx(1);
        coll.create_index(&mut t, IndexDefinition::ttl("by_expiry", "expires_at", 60)).unwrap();

        let mut old = Document::new();
        old.set("expires_at", Value::Timestamp(1_000));
        coll.insert_one(&mut t, old).unwrap();

        let mut fresh = Document::new();
        fresh.set("expires_at", Value::Timestamp(10_000));
        coll.insert_one(&mut t, fresh).unwrap();

        let removed = coll.sweep_ttl(&mut t, 1_100).unwrap();
        assert_eq!(removed, 1, "only the document past its ttl cutoff should be swept");
        assert_eq!(coll.count(&serde_json::json!({})).unwrap(), 1);

        let remaining = coll.find(&serde_json::json!({}), &FindOptions::default()).unwrap();
        assert_eq!(remaining[0].get_path("expires_at"), Some(&Value::Timestamp(10_000)));
    }
}
