//! Transaction lifecycle: begin/commit/abort (§4.6).
//!
//! Commits are serialized through a single mutex so that snapshot
//! assignment (reading the WAL's durable LSN) and the commit record's
//! own LSN never race across concurrently committing transactions —
//! the same TOCTOU concern a per-shard commit lock guards against in a
//! sharded store, simplified here to one lock since LauraDB is a single
//! logical database per `open()`.

use crate::lock::LockManager;
use crate::transaction::{Snapshot, TransactionContext, TransactionStatus};
use lauradb_core::Result;
use lauradb_durability::{Lsn, RecordKind, WalWriter};
use lauradb_storage::BufferPool;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Coordinates transaction begin/commit/abort against the WAL and the
/// lock table.
pub struct TransactionManager {
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    lock_manager: Arc<LockManager>,
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new(wal: Arc<WalWriter>, pool: Arc<BufferPool>, lock_wait_timeout: Duration) -> Self {
        TransactionManager {
            wal,
            pool,
            lock_manager: Arc::new(LockManager::new(lock_wait_timeout)),
            commit_lock: Mutex::new(()),
        }
    }

    /// Lock table shared by every transaction this manager issues.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction: assign a transaction id, append `Begin`
    /// to the WAL, and fix its snapshot at the WAL's current durable
    /// LSN.
    pub fn begin(&self) -> Result<TransactionContext> {
        let tx_id = self.wal.next_tx_id();
        let begin_lsn = self.wal.append(tx_id, RecordKind::Begin)?;
        self.pool.begin_tx(tx_id, begin_lsn);
        let snapshot = Snapshot::new(self.wal.durable_lsn());
        debug!(target: "lauradb::txn", tx_id, snapshot_lsn = snapshot.lsn, "transaction started");
        Ok(TransactionContext::new(tx_id, snapshot))
    }

    /// Commit: append and sync a `Commit` record, then release every
    /// lock the transaction was holding. Returns the commit LSN, which
    /// is also the point from which this transaction's writes become
    /// visible to new snapshots.
    pub fn commit(&self, tx: &mut TransactionContext) -> Result<Lsn> {
        let _guard = self.commit_lock.lock();
        let lsn = self.wal.append(tx.tx_id, RecordKind::Commit)?;
        self.wal.sync_through(lsn)?;
        self.lock_manager.release_all(tx.tx_id);
        self.pool.end_tx(tx.tx_id);
        tx.status = TransactionStatus::Committed;
        debug!(target: "lauradb::txn", tx_id = tx.tx_id, commit_lsn = lsn, "transaction committed");
        Ok(lsn)
    }

    /// Abort: append `Abort` to the WAL (so recovery never replays this
    /// transaction's updates) and release its locks. The caller is
    /// responsible for applying `tx.drain_undo_for_abort()` to undo any
    /// writes already visible in the buffer pool.
    pub fn abort(&self, tx: &mut TransactionContext) -> Result<()> {
        self.wal.append(tx.tx_id, RecordKind::Abort)?;
        self.lock_manager.release_all(tx.tx_id);
        self.pool.end_tx(tx.tx_id);
        tx.status = TransactionStatus::Aborted;
        warn!(target: "lauradb::txn", tx_id = tx.tx_id, "transaction aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_durability::DurabilityMode;
    use tempfile::tempdir;

    fn new_manager(dir: &std::path::Path) -> TransactionManager {
        let wal = Arc::new(WalWriter::open(dir.join("wal"), DurabilityMode::Sync).unwrap());
        let page_file = lauradb_storage::PageFile::create(&dir.join("pages.db"), lauradb_storage::PAGE_SIZE).unwrap();
        let pool = Arc::new(BufferPool::new(page_file, wal.clone(), 8));
        TransactionManager::new(wal, pool, Duration::from_millis(200))
    }

    #[test]
    fn begin_then_commit_moves_through_expected_states() {
        let dir = tempdir().unwrap();
        let mgr = new_manager(dir.path());
        let mut tx = mgr.begin().unwrap();
        assert_eq!(tx.status, TransactionStatus::Active);
        mgr.commit(&mut tx).unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
    }

    #[test]
    fn abort_releases_locks_held_by_the_transaction() {
        let dir = tempdir().unwrap();
        let mgr = new_manager(dir.path());
        let mut tx = mgr.begin().unwrap();
        let resource = crate::lock::ResourceKey::new("docs", vec![1]);
        mgr.lock_manager().acquire(tx.tx_id, &resource).unwrap();
        mgr.abort(&mut tx).unwrap();
        assert_eq!(tx.status, TransactionStatus::Aborted);

        let mut other = mgr.begin().unwrap();
        mgr.lock_manager().acquire(other.tx_id, &resource).unwrap();
        mgr.commit(&mut other).unwrap();
    }

    #[test]
    fn later_transactions_see_a_newer_snapshot_after_commit() {
        let dir = tempdir().unwrap();
        let mgr = new_manager(dir.path());
        let mut first = mgr.begin().unwrap();
        let commit_lsn = mgr.commit(&mut first).unwrap();
        let second = mgr.begin().unwrap();
        assert!(second.snapshot.is_visible(commit_lsn));
    }
}
