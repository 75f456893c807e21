//! WAL record types (§3, §4.3).
//!
//! Records are physical: an `Update` carries the full before/after image
//! of the page it touches. This keeps recovery and undo simple at the
//! cost of some log volume, which the page size (4KiB default) keeps
//! bounded.

/// Log sequence number: a strictly increasing position in the WAL.
pub type Lsn = u64;

/// Transaction identifier, unique for the lifetime of an open database.
pub type TxId = u64;

/// The page id type re-exported here to avoid a dependency cycle with
/// `lauradb-storage` (which depends on this crate, not the reverse).
pub type PageId = u32;

/// One WAL record. Every record carries the LSN it was assigned on
/// append and the transaction it belongs to (`0` for records, like
/// `Checkpoint`, that are not part of a transaction).
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Position assigned by the writer on append.
    pub lsn: Lsn,
    /// Owning transaction, or `0` for transaction-independent records.
    pub tx_id: TxId,
    /// The record payload.
    pub kind: RecordKind,
}

/// Record payload kinds, matching §3's WAL record taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Marks the start of a transaction.
    Begin,
    /// Physical before/after image of a single page write.
    Update {
        /// Page touched by this write.
        page_id: PageId,
        /// Page contents before the write (for undo).
        before: Vec<u8>,
        /// Page contents after the write (for redo).
        after: Vec<u8>,
    },
    /// Logical index-maintenance marker (create/drop index, catalog
    /// mutation) that recovery must treat as occurring atomically with
    /// its enclosing transaction, but which is not itself a page image.
    IndexOp {
        /// Human-readable description, e.g. `"create_index:email_1"`.
        description: String,
    },
    /// Transaction committed; durable once this record's LSN is synced.
    Commit,
    /// Transaction aborted; its updates must not be replayed.
    Abort,
    /// Checkpoint: buffer pool has been flushed up to `up_to_lsn`;
    /// segments below the checkpoint's segment may be truncated.
    Checkpoint {
        /// Highest LSN durable at the time of the checkpoint.
        up_to_lsn: Lsn,
    },
}

impl RecordKind {
    /// Short tag used in the on-disk encoding and in diagnostics.
    pub fn tag(&self) -> u8 {
        match self {
            RecordKind::Begin => 1,
            RecordKind::Update { .. } => 2,
            RecordKind::IndexOp { .. } => 3,
            RecordKind::Commit => 4,
            RecordKind::Abort => 5,
            RecordKind::Checkpoint { .. } => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_distinct() {
        let kinds = vec![
            RecordKind::Begin,
            RecordKind::Update {
                page_id: 1,
                before: vec![],
                after: vec![],
            },
            RecordKind::IndexOp {
                description: "x".into(),
            },
            RecordKind::Commit,
            RecordKind::Abort,
            RecordKind::Checkpoint { up_to_lsn: 0 },
        ];
        let tags: std::collections::HashSet<u8> = kinds.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), kinds.len());
    }
}
