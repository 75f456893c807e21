//! The public, in-process API to LauraDB (§6).
//!
//! [`Database::open`] is the entry point. A [`Database`] hands out
//! [`CollectionHandle`]s and [`Session`]s; collection ops run inside
//! whichever transaction (if any) is active on the session passed to
//! them, auto-committing on their own otherwise. Cursors and change
//! streams are reached directly from the `Database` handle.

pub mod change_stream;
pub mod collection;
pub mod database;
pub mod session;

pub use change_stream::Subscription;
pub use collection::{CollectionHandle, CollectionStats};
pub use database::Database;
pub use session::Session;

pub use lauradb_core::{Document, Error, ErrorContext, ErrorKind, ObjectId, Result, Value};
pub use lauradb_engine::{ChangeEvent, Config, FindOptions, IndexDefinition, IndexKind, UpdateResult, WalSyncMode};

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_core::value::{Document, Value};
    use tempfile::tempdir;

    #[test]
    fn unique_index_conflict_leaves_count_at_one() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();

        users.create_index(IndexDefinition::btree("by_email", vec!["email".into()], true)).unwrap();

        let mut a = Document::new();
        a.set("email", Value::String("x@y".into()));
        users.insert_one(&session, a).unwrap();

        let mut b = Document::new();
        b.set("email", Value::String("x@y".into()));
        let err = users.insert_one(&session, b).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        assert_eq!(users.count(&session, &serde_json::json!({})).unwrap(), 1);
    }

    #[test]
    fn aggregation_groups_and_sums() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("sales").unwrap();
        let sales = db.collection("sales");
        let session = db.start_session();

        for (cat, v) in [("a", 1i64), ("a", 3), ("b", 5)] {
            let mut doc = Document::new();
            doc.set("cat", Value::String(cat.into()));
            doc.set("v", Value::Int64(v));
            sales.insert_one(&session, doc).unwrap();
        }

        let pipeline = vec![serde_json::json!({"$group": {"_id": "$cat", "s": {"$sum": "$v"}}})];
        let mut results = sales.aggregate(&session, &pipeline).unwrap();
        results.sort_by(|a, b| match (a.get("_id"), b.get("_id")) {
            (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
            _ => std::cmp::Ordering::Equal,
        });
        let sums: Vec<i64> = results
            .iter()
            .map(|d| match d.get("s") {
                Some(Value::Int64(n)) => *n,
                _ => panic!("expected integer sum"),
            })
            .collect();
        assert_eq!(sums, vec![4, 5]);
    }
}
