//! Restore (§6, §9): validate a backup's version, then replay it
//! through the public insert/create-index API — never by writing pages
//! directly, so a restored database is byte-for-byte whatever the
//! normal write path would have produced.

use crate::backup::{document_json, index_definition, BackupFile, BACKUP_VERSION};
use lauradb_api::Database;
use lauradb_core::{Error, Result};
use lauradb_engine::json::json_to_document;

/// Replay `backup` into `db`. Collections are created if absent;
/// restoring into a database that already has a same-named collection
/// adds to it rather than replacing it — callers that want a clean
/// restore should `drop_collection` first.
pub fn import(db: &Database, backup: &BackupFile) -> Result<()> {
    if backup.version != BACKUP_VERSION {
        return Err(Error::unsupported(format!(
            "backup version {} is not supported (expected {BACKUP_VERSION})",
            backup.version
        )));
    }

    for coll in &backup.collections {
        if !db.list_collections().contains(&coll.name) {
            db.create_collection(&coll.name)?;
        }
        let handle = db.collection(coll.name.as_str());
        let session = db.start_session();

        for entry in &coll.documents {
            let doc = json_to_document(&document_json(entry))?;
            handle.insert_one(&session, doc)?;
        }
        for index in &coll.indexes {
            let def = index_definition(index)?;
            handle.create_index(def)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::export;
    use lauradb_api::Config;
    use lauradb_core::value::{Document, Value};
    use tempfile::tempdir;

    #[test]
    fn backup_then_restore_is_indistinguishable_by_read() {
        let src_dir = tempdir().unwrap();
        let src = Database::open(Config::new(src_dir.path())).unwrap();
        src.create_collection("users").unwrap();
        let users = src.collection("users");
        let session = src.start_session();
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        doc.set("age", Value::Int64(30));
        users.insert_one(&session, doc).unwrap();

        let backup = export(&src, "test", 0).unwrap();

        let dst_dir = tempdir().unwrap();
        let dst = Database::open(Config::new(dst_dir.path())).unwrap();
        import(&dst, &backup).unwrap();

        let restored = dst.collection("users");
        let restored_session = dst.start_session();
        let found = restored
            .find_one(&restored_session, &serde_json::json!({"name": "Alice"}))
            .unwrap()
            .unwrap();
        assert_eq!(found.get("age"), Some(&Value::Int64(30)));
    }

    #[test]
    fn rejects_an_unsupported_version() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        let mut backup = export(&db, "test", 0).unwrap();
        backup.version = "2.0".to_string();
        let err = import(&db, &backup).unwrap_err();
        assert_eq!(err.kind, lauradb_core::ErrorKind::Unsupported);
    }
}
