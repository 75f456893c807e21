//! Crash recovery: WAL replay (§4.3, §8 recovery property).
//!
//! Recovery is two-pass: the first pass finds the most recent checkpoint
//! and the set of transaction ids that reached a `Commit` record; the
//! second pass replays every `Update` belonging to a committed
//! transaction, in LSN order, starting at the checkpoint. Updates
//! belonging to transactions that never committed are simply never
//! applied — "rollback" of an uncommitted transaction is thus implicit,
//! because its page images never leave the WAL.

use crate::record::{Lsn, PageId, RecordKind, TxId};
use crate::wal::reader::WalReader;
use std::collections::HashSet;
use std::io;
use std::path::Path;

/// Receives replayed page images. Implemented by the storage crate's
/// page file so this crate need not depend on it.
pub trait PageSink {
    /// Write `after` as the full contents of `page_id`, unconditionally.
    fn apply_page(&mut self, page_id: PageId, after: &[u8]) -> io::Result<()>;
}

/// Summary of a completed recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Highest LSN observed anywhere in the log.
    pub max_lsn: Lsn,
    /// Highest transaction id observed anywhere in the log.
    pub max_tx_id: TxId,
    /// Number of distinct transactions whose updates were replayed.
    pub committed_tx_count: usize,
    /// Number of page updates actually applied.
    pub applied_updates: usize,
}

/// Scan the WAL in `wal_dir` and replay every committed transaction's
/// updates into `sink`. Returns a summary used to restore the WAL
/// writer's LSN/tx-id counters and to report recovery progress.
pub fn replay(wal_dir: &Path, sink: &mut dyn PageSink) -> io::Result<RecoveryReport> {
    // Pass 0: find the most recent checkpoint so we don't replay work
    // that was already durably flushed to the page file.
    let mut checkpoint_lsn: Lsn = 0;
    for record in WalReader::open(wal_dir, 0)? {
        let record = record?;
        if let RecordKind::Checkpoint { up_to_lsn } = record.kind {
            checkpoint_lsn = checkpoint_lsn.max(up_to_lsn);
        }
    }

    // Pass 1: determine which transactions committed, and track the
    // high-water marks used to resume LSN/tx-id allocation.
    let mut committed: HashSet<TxId> = HashSet::new();
    let mut aborted: HashSet<TxId> = HashSet::new();
    let mut max_lsn: Lsn = checkpoint_lsn;
    let mut max_tx_id: TxId = 0;
    for record in WalReader::open(wal_dir, checkpoint_lsn)? {
        let record = record?;
        max_lsn = max_lsn.max(record.lsn);
        max_tx_id = max_tx_id.max(record.tx_id);
        match record.kind {
            RecordKind::Commit => {
                committed.insert(record.tx_id);
            }
            RecordKind::Abort => {
                aborted.insert(record.tx_id);
            }
            _ => {}
        }
    }
    let _ = aborted; // not committed => not replayed; no separate action needed.

    // Pass 2: apply updates belonging to committed transactions, in LSN
    // order, so that later writes to the same page win.
    let mut applied = 0usize;
    for record in WalReader::open(wal_dir, checkpoint_lsn)? {
        let record = record?;
        if !committed.contains(&record.tx_id) {
            continue;
        }
        if let RecordKind::Update { page_id, after, .. } = record.kind {
            sink.apply_page(page_id, &after)?;
            applied += 1;
        }
    }

    Ok(RecoveryReport {
        max_lsn,
        max_tx_id,
        committed_tx_count: committed.len(),
        applied_updates: applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::mode::DurabilityMode;
    use crate::wal::writer::WalWriter;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct FakePages(HashMap<PageId, Vec<u8>>);

    impl PageSink for FakePages {
        fn apply_page(&mut self, page_id: PageId, after: &[u8]) -> io::Result<()> {
            self.0.insert(page_id, after.to_vec());
            Ok(())
        }
    }

    #[test]
    fn only_committed_transactions_are_replayed() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::open(dir.path().to_path_buf(), DurabilityMode::Sync).unwrap();

        // tx 1: committed, should be replayed.
        writer.append(1, RecordKind::Begin).unwrap();
        writer
            .append(
                1,
                RecordKind::Update {
                    page_id: 10,
                    before: vec![0],
                    after: vec![1],
                },
            )
            .unwrap();
        writer.append(1, RecordKind::Commit).unwrap();

        // tx 2: never committed (simulated crash mid-transaction).
        writer.append(2, RecordKind::Begin).unwrap();
        writer
            .append(
                2,
                RecordKind::Update {
                    page_id: 20,
                    before: vec![0],
                    after: vec![2],
                },
            )
            .unwrap();

        let mut sink = FakePages(HashMap::new());
        let report = replay(dir.path(), &mut sink).unwrap();

        assert_eq!(report.applied_updates, 1);
        assert_eq!(sink.0.get(&10), Some(&vec![1]));
        assert!(sink.0.get(&20).is_none());
    }

    #[test]
    fn checkpoint_skips_earlier_already_flushed_updates() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::open(dir.path().to_path_buf(), DurabilityMode::Sync).unwrap();

        writer.append(1, RecordKind::Begin).unwrap();
        writer
            .append(
                1,
                RecordKind::Update {
                    page_id: 1,
                    before: vec![],
                    after: vec![9],
                },
            )
            .unwrap();
        writer.append(1, RecordKind::Commit).unwrap();
        let ckpt_lsn = writer.append(0, RecordKind::Checkpoint { up_to_lsn: 3 }).unwrap();
        let _ = ckpt_lsn;

        writer.append(2, RecordKind::Begin).unwrap();
        writer
            .append(
                2,
                RecordKind::Update {
                    page_id: 2,
                    before: vec![],
                    after: vec![7],
                },
            )
            .unwrap();
        writer.append(2, RecordKind::Commit).unwrap();

        let mut sink = FakePages(HashMap::new());
        let report = replay(dir.path(), &mut sink).unwrap();
        assert_eq!(report.applied_updates, 1);
        assert_eq!(sink.0.get(&2), Some(&vec![7]));
    }
}
