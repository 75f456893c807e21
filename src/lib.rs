//! # LauraDB
//!
//! An embeddable document database: schemaless collections keyed by a
//! 12-byte [`ObjectId`], secondary indexes (compound, partial, multi-key,
//! text, geospatial, TTL), a filter/projection/sort query language,
//! aggregation pipelines, multi-statement transactions with savepoints,
//! and change streams.
//!
//! ```no_run
//! use lauradb::{Config, Database, Document, Value};
//!
//! fn main() -> lauradb::Result<()> {
//!     let db = Database::open(Config::new("./my-data"))?;
//!     db.create_collection("users")?;
//!     let users = db.collection("users");
//!     let session = db.start_session();
//!
//!     let mut doc = Document::new();
//!     doc.set("name", Value::String("Alice".into()));
//!     let id = users.insert_one(&session, doc)?;
//!
//!     let found = users.find_one(&session, &serde_json::json!({"name": "Alice"}))?;
//!     assert!(found.is_some());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Database / CollectionHandle / Session / Subscription   <- lauradb-api
//!                       │
//!            Catalog, Collection, query/aggregate         <- lauradb-engine
//!                       │
//!         TransactionContext, LockManager, SavepointStack  <- lauradb-concurrency
//!                       │
//!              WAL, oplog, crash recovery                 <- lauradb-durability
//!                       │
//!            BufferPool, B+tree, overflow pages            <- lauradb-storage
//! ```
//!
//! This crate is a thin facade: everything here is re-exported from
//! [`lauradb_api`], which owns the actual `Database`/`Session`/
//! `CollectionHandle` implementations. Backup/restore and the repair
//! tool live in the separate `lauradb-tools` crate, since most embedders
//! never need them.

pub use lauradb_api::{
    ChangeEvent, CollectionHandle, CollectionStats, Config, Database, FindOptions,
    IndexDefinition, IndexKind, Session, Subscription, UpdateResult, WalSyncMode,
};
pub use lauradb_core::{Document, Error, ErrorContext, ErrorKind, ObjectId, Result, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_create_insert_find_round_trip() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();

        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        let id = users.insert_one(&session, doc).unwrap();

        let found = users.find_one(&session, &serde_json::json!({"name": "Alice"})).unwrap().unwrap();
        assert_eq!(found.id().copied(), Some(Value::ObjectId(id)));
    }
}
