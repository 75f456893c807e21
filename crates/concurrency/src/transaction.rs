//! Transaction state: snapshot, undo log, and savepoint stack (§4.6, §4.7).

use crate::savepoint::SavepointStack;
use lauradb_core::{Error, Result};
use lauradb_durability::{Lsn, TxId};

/// Lifecycle state of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// A read snapshot fixed at the WAL position durable when the
/// transaction began. A commit is visible to this snapshot iff its LSN
/// is at or before `lsn` (§4.6 snapshot isolation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub lsn: Lsn,
}

impl Snapshot {
    pub fn new(lsn: Lsn) -> Self {
        Snapshot { lsn }
    }

    /// Whether a write committed at `commit_lsn` is visible to this
    /// snapshot.
    pub fn is_visible(&self, commit_lsn: Lsn) -> bool {
        commit_lsn <= self.lsn
    }
}

/// One undone-able write: enough to restore the prior on-disk state of
/// a single document key within a collection. `before = None` means the
/// key did not exist before this write (undo = delete it again).
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub collection: String,
    pub key: Vec<u8>,
    pub before: Option<Vec<u8>>,
}

/// A single multi-statement transaction: its snapshot, its undo log
/// (consumed on abort or `rollback_to_savepoint`), and its nested
/// savepoint stack.
pub struct TransactionContext {
    pub tx_id: TxId,
    pub snapshot: Snapshot,
    pub status: TransactionStatus,
    undo_log: Vec<UndoEntry>,
    savepoints: SavepointStack,
}

impl TransactionContext {
    pub fn new(tx_id: TxId, snapshot: Snapshot) -> Self {
        TransactionContext {
            tx_id,
            snapshot,
            status: TransactionStatus::Active,
            undo_log: Vec::new(),
            savepoints: SavepointStack::new(),
        }
    }

    /// Record an undo-able write, to be replayed backwards on abort or
    /// rollback.
    pub fn push_undo(&mut self, entry: UndoEntry) {
        self.undo_log.push(entry);
    }

    /// Every undo entry recorded since the transaction began, oldest
    /// first. Used by [`crate::manager::TransactionManager::abort`].
    pub fn undo_log(&self) -> &[UndoEntry] {
        &self.undo_log
    }

    /// Create a new savepoint at the current undo-log position.
    pub fn create_savepoint(&mut self, name: impl Into<String>) {
        self.savepoints.create(name.into(), self.undo_log.len());
    }

    /// Roll back to `name`, draining (and returning, newest-first, ready
    /// to replay) every undo entry recorded since that savepoint. The
    /// savepoint itself, and any nested ones created after it, are
    /// popped; savepoints created before it are left intact so the
    /// transaction can keep going.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<Vec<UndoEntry>> {
        let mark = self.savepoints.rollback_to(name)?;
        let drained = self.undo_log.split_off(mark);
        Ok(drained.into_iter().rev().collect())
    }

    /// Release `name` (and any savepoints nested inside it) without
    /// rolling back; their undo entries merge into the enclosing scope.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.release(name)
    }

    /// Drain the entire undo log in reverse order, for a full abort.
    pub fn drain_undo_for_abort(&mut self) -> Vec<UndoEntry> {
        std::mem::take(&mut self.undo_log).into_iter().rev().collect()
    }
}

/// Errors specific to the commit protocol, distinguished from the
/// general [`lauradb_core::Error`] taxonomy so callers can match on the
/// retry policy without string-matching.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("transaction is not active")]
    NotActive,
    #[error(transparent)]
    Storage(#[from] Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_visibility_is_inclusive_of_own_lsn() {
        let snap = Snapshot::new(10);
        assert!(snap.is_visible(10));
        assert!(snap.is_visible(5));
        assert!(!snap.is_visible(11));
    }

    #[test]
    fn rollback_to_savepoint_drains_only_entries_after_it() {
        let mut tx = TransactionContext::new(1, Snapshot::new(0));
        tx.push_undo(UndoEntry {
            collection: "c".into(),
            key: vec![1],
            before: None,
        });
        tx.create_savepoint("sp1");
        tx.push_undo(UndoEntry {
            collection: "c".into(),
            key: vec![2],
            before: None,
        });
        let drained = tx.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key, vec![2]);
        assert_eq!(tx.undo_log().len(), 1);
    }
}
