//! Transaction management for LauraDB: MVCC snapshots, exclusive
//! per-document locking with deadlock detection, nested savepoints, and
//! session lifecycle (§4.6, §4.7).
//!
//! Crash recovery of the underlying pages is [`lauradb_durability`]'s
//! concern ([`lauradb_durability::replay`]); this crate only manages the
//! lifecycle of transactions that are still in flight.

#![warn(clippy::all)]

pub mod lock;
pub mod manager;
pub mod savepoint;
pub mod session;
pub mod transaction;

pub use lock::{LockManager, ResourceKey};
pub use manager::TransactionManager;
pub use savepoint::SavepointStack;
pub use session::{Session, SessionManager};
pub use transaction::{CommitError, Snapshot, TransactionContext, TransactionStatus, UndoEntry};
