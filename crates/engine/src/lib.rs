//! Collections, secondary indexes, the query evaluator, transactions,
//! and change streams: the storage-and-query core of LauraDB.
//!
//! The public entry point is [`Catalog::open`]; everything else
//! (collections, cursors, change streams, aggregation) is reached
//! through a catalog handle.

pub mod aggregate;
pub mod catalog;
pub mod change_stream;
pub mod collection;
pub mod config;
pub mod cursor;
pub mod index;
pub mod json;
pub mod query;

pub use catalog::Catalog;
pub use change_stream::{ChangeEvent, ChangeStream};
pub use collection::{Collection, FindOptions, UpdateResult};
pub use config::{Config, WalSyncMode};
pub use cursor::CursorManager;
pub use index::{IndexDefinition, IndexKind};

pub use lauradb_core::{Document, Error, ErrorContext, ErrorKind, ObjectId, Result, Value};
pub use lauradb_concurrency::transaction::{Snapshot, TransactionContext, TransactionStatus, UndoEntry};
pub use lauradb_concurrency::{Session, SessionManager};
pub use lauradb_durability::oplog::{OpType, ResumeToken};
