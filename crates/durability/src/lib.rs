//! Write-ahead logging, crash recovery, and the oplog for LauraDB.
//!
//! - [`wal`]: segmented, group-committing write-ahead log.
//! - [`recovery`]: replay of committed transactions after a crash.
//! - [`oplog`]: the append-only change-stream source, distinct from the
//!   WAL so tailing subscribers never interact with checkpoint/
//!   truncation bookkeeping.

#![warn(clippy::all)]

pub mod codec;
pub mod oplog;
pub mod record;
pub mod recovery;
pub mod wal;

pub use oplog::{OpType, OplogEntry, OplogReader, OplogWriter, ResumeToken};
pub use record::{Lsn, PageId, RecordKind, TxId, WalRecord};
pub use recovery::{replay, PageSink, RecoveryReport};
pub use wal::{DurabilityMode, WalReader, WalSegment, WalWriter};
