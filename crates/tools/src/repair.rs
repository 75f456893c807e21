//! Offline maintenance (§9): validate every secondary index against the
//! document set it claims to describe, fix whatever the validator finds,
//! and defragment by rebuilding each index from scratch.
//!
//! The validator and fixer walk real leaf pages through
//! [`lauradb_api::CollectionHandle::index_entries`] and
//! [`lauradb_api::CollectionHandle::expected_index_keys`] rather than
//! trusting any cached count, and the fix routines call back into the
//! engine's own insert/delete path so a "fixed" index is indistinguishable
//! from one that was never broken.

use lauradb_api::{CollectionHandle, Database, IndexKind, Session};
use lauradb_core::key::{encode_compound, encode_non_unique};
use lauradb_core::value::Value;
use lauradb_core::{ObjectId, Result};
use std::collections::HashSet;

/// One discrepancy found between an index's actual contents and what its
/// definition says it should contain.
#[derive(Debug, Clone)]
pub enum IndexIssue {
    /// `id` has a key that `expected_index_keys` says the index should
    /// hold but `index_entries` does not.
    MissingEntry { id: ObjectId },
    /// A raw entry the index actually holds but `expected_index_keys`
    /// does not, either because it is stale or the key derivation has
    /// drifted (e.g. the document no longer exists).
    OrphanedEntry { key: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub collection: String,
    pub index: String,
    pub issues: Vec<IndexIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Recompute the on-disk key a `(tuple, id)` pair would derive to, the
/// same way `lauradb_engine::Collection` does internally, so the
/// validator's view of "expected" and "actual" line up byte for byte.
fn index_key_for(unique: bool, tuple: &[Value], id: &ObjectId) -> Vec<u8> {
    let refs: Vec<&Value> = tuple.iter().collect();
    if unique {
        encode_compound(&refs)
    } else {
        encode_non_unique(&refs, id)
    }
}

/// Check one index for drift between what it contains and what it
/// should contain. Only `IndexKind::BTree` indexes are walked this way;
/// text/geo/ttl indexes derive their keys differently and are skipped
/// (the document set itself is still covered through every btree index
/// on the collection).
fn validate_index(handle: &CollectionHandle, index_name: &str) -> Result<ValidationReport> {
    let def = handle
        .list_indexes()?
        .into_iter()
        .find(|d| d.name == index_name)
        .ok_or_else(|| lauradb_core::Error::not_found(format!("no such index: {index_name}")))?;

    let actual = handle.index_entries(index_name)?;
    let actual_keys: HashSet<Vec<u8>> = actual.iter().map(|(k, _)| k.clone()).collect();
    let expected = handle.expected_index_keys(index_name)?;

    let mut issues = Vec::new();

    for id in handle.document_ids()? {
        if let Some(doc) = handle.get_by_id(&id)? {
            for tuple in def.key_tuples(&doc) {
                let key = index_key_for(def.unique, &tuple, &id);
                if expected.contains(&key) && !actual_keys.contains(&key) {
                    issues.push(IndexIssue::MissingEntry { id });
                }
            }
        }
    }

    for (key, _id) in &actual {
        if !expected.contains(key) {
            issues.push(IndexIssue::OrphanedEntry { key: key.clone() });
        }
    }

    Ok(ValidationReport { collection: handle.name().to_string(), index: index_name.to_string(), issues })
}

/// Validate every btree-kind index of every collection in `db`.
pub fn validate(db: &Database) -> Result<Vec<ValidationReport>> {
    let mut reports = Vec::new();
    for name in db.list_collections() {
        let handle = db.collection(name);
        for def in handle.list_indexes()? {
            if def.kind != IndexKind::BTree {
                continue;
            }
            reports.push(validate_index(&handle, &def.name)?);
        }
    }
    Ok(reports)
}

/// Apply every fix a [`ValidationReport`] calls for, in one transaction
/// per collection. Returns the number of entries fixed.
pub fn repair(db: &Database, session: &Session, report: &ValidationReport) -> Result<u64> {
    let handle = db.collection(report.collection.as_str());
    let mut fixed = 0;
    for issue in &report.issues {
        match issue {
            IndexIssue::MissingEntry { id } => {
                handle.fix_missing_index_entry(session, &report.index, id)?;
            }
            IndexIssue::OrphanedEntry { key } => {
                handle.fix_orphaned_index_entry(session, &report.index, key)?;
            }
        }
        fixed += 1;
    }
    Ok(fixed)
}

/// Validate and repair every index in `db`, returning the total number
/// of entries fixed across the whole database.
pub fn validate_and_repair(db: &Database, session: &Session) -> Result<u64> {
    let mut total = 0;
    for report in validate(db)? {
        if !report.is_clean() {
            total += repair(db, session, &report)?;
        }
    }
    Ok(total)
}

/// Result of rebuilding every index on a collection from scratch, freeing
/// whatever pages the old trees held (§9: `spaceSaved` must be measured,
/// not estimated).
#[derive(Debug, Clone, Copy)]
pub struct DefragReport {
    pub initial_allocated_pages: u64,
    pub final_allocated_pages: u64,
    pub page_size: u64,
}

impl DefragReport {
    pub fn space_saved(&self) -> i64 {
        (self.initial_allocated_pages as i64 - self.final_allocated_pages as i64) * self.page_size as i64
    }
}

/// Drop and recreate every btree-kind index on `collection`, relying on
/// `drop_index`'s real page-freeing (`BTree::destroy`) to shrink the file
/// before the rebuild hands back fresh trees.
pub fn defragment_collection(db: &Database, handle: &CollectionHandle) -> Result<DefragReport> {
    let config = db.config();
    let page_file_path = config.data_dir.join("pages.db");
    let page_size = config.page_size;

    db.checkpoint()?;
    let initial_allocated_pages = live_page_count(&page_file_path, page_size)?;

    let defs = handle.list_indexes()?;
    for def in &defs {
        if def.kind == IndexKind::BTree {
            handle.drop_index(&def.name)?;
            handle.create_index(def.clone())?;
        }
    }

    db.checkpoint()?;
    let final_allocated_pages = live_page_count(&page_file_path, page_size)?;
    Ok(DefragReport { initial_allocated_pages, final_allocated_pages, page_size: page_size as u64 })
}

/// Pages actually in use, read fresh off disk: the allocator's
/// high-water mark (`next_page_id`, which only ever grows) minus
/// however many of those ids currently sit on the free list, since
/// `allocate_page` reuses freed ids before minting new ones and a
/// high-water mark alone never reflects pages `BTree::destroy` freed.
fn live_page_count(page_file_path: &std::path::Path, page_size: usize) -> Result<u64> {
    let mut file = lauradb_storage::PageFile::open(page_file_path, page_size)?;
    let meta = lauradb_storage::MetaPage::from_page(&file.read(lauradb_storage::page::META_PAGE_ID)?);
    let total_allocated = meta.next_page_id.saturating_sub(lauradb_storage::page::META_PAGE_ID + 1) as u64;

    let mut free_count = 0u64;
    let mut cursor = meta.free_list_head;
    while cursor != lauradb_storage::NONE_PAGE {
        let page = file.read(cursor)?;
        cursor = u32::from_be_bytes(page.body[0..4].try_into().unwrap());
        free_count += 1;
    }

    Ok(total_allocated - free_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_api::Config;
    use lauradb_api::{IndexDefinition, IndexKind as ApiIndexKind};
    use lauradb_core::value::{Document, Value as V};
    use tempfile::tempdir;

    #[test]
    fn validate_reports_no_issues_on_a_healthy_index() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();
        let mut doc = Document::new();
        doc.set("email", V::String("a@example.com".into()));
        users.insert_one(&session, doc).unwrap();
        users
            .create_index(IndexDefinition {
                name: "email_idx".into(),
                kind: ApiIndexKind::BTree,
                field_paths: vec!["email".into()],
                unique: true,
                sparse: false,
                partial_filter: None,
                ttl_seconds: None,
                geo_cell_size: None,
            })
            .unwrap();

        let reports = validate(&db).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_clean());
    }

    #[test]
    fn repair_restores_an_entry_deleted_straight_out_of_the_tree() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();
        let mut doc = Document::new();
        doc.set("email", V::String("a@example.com".into()));
        users.insert_one(&session, doc).unwrap();
        users
            .create_index(IndexDefinition {
                name: "email_idx".into(),
                kind: ApiIndexKind::BTree,
                field_paths: vec!["email".into()],
                unique: true,
                sparse: false,
                partial_filter: None,
                ttl_seconds: None,
                geo_cell_size: None,
            })
            .unwrap();

        let (key, _id) = users.index_entries("email_idx").unwrap().into_iter().next().unwrap();
        users.fix_orphaned_index_entry(&session, "email_idx", &key).unwrap();

        let reports = validate(&db).unwrap();
        assert!(!reports[0].is_clean());
        let fixed = repair(&db, &session, &reports[0]).unwrap();
        assert_eq!(fixed, 1);

        let reports_after = validate(&db).unwrap();
        assert!(reports_after[0].is_clean());
    }

    #[test]
    fn defragment_reports_real_shrinkage_after_heavy_deletion() {
        let dir = tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.page_size = 256;
        let db = Database::open(config).unwrap();
        db.create_collection("tags").unwrap();
        let coll = db.collection("tags");
        let session = db.start_session();

        coll.create_index(IndexDefinition {
            name: "by_tag".into(),
            kind: ApiIndexKind::BTree,
            field_paths: vec!["tag".into()],
            unique: true,
            sparse: false,
            partial_filter: None,
            ttl_seconds: None,
            geo_cell_size: None,
        })
        .unwrap();

        // Sorted-order insertion forces the index to split at minimum
        // fill the whole way up; deleting every other entry afterward
        // leaves the survivors spread across that many half-empty
        // leaves, none of which individually qualifies for a merge.
        for i in 0..60 {
            let mut doc = Document::new();
            doc.set("tag", V::String(format!("{i:03}")));
            coll.insert_one(&session, doc).unwrap();
        }
        for i in (0..60).step_by(2) {
            let deleted = coll.delete_one(&session, &serde_json::json!({"tag": format!("{i:03}")})).unwrap();
            assert_eq!(deleted, 1);
        }
        assert_eq!(coll.count(&session, &serde_json::json!({})).unwrap(), 30);

        let report = defragment_collection(&db, &coll).unwrap();
        assert!(
            report.final_allocated_pages < report.initial_allocated_pages,
            "rebuilding from the 30 survivors should use fewer pages than the fragmented original \
             (initial={}, final={})",
            report.initial_allocated_pages,
            report.final_allocated_pages
        );
        assert!(report.space_saved() > 0);

        assert_eq!(coll.count(&session, &serde_json::json!({})).unwrap(), 30);
        let reports = validate(&db).unwrap();
        assert!(reports[0].is_clean());
    }
}
