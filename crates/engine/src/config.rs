//! Catalog configuration (§6): the knobs passed to [`crate::Catalog::open`].

use lauradb_durability::DurabilityMode;
use std::path::PathBuf;
use std::time::Duration;

/// `wal_sync_mode` as named in §6; maps onto
/// [`lauradb_durability::DurabilityMode`]'s group-commit/async shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// fsync every commit before returning.
    Sync,
    /// Batch concurrent commits into one fsync (leader/follower).
    Group,
    /// Never block a commit on fsync; a background task flushes
    /// periodically. Weakest durability, highest throughput.
    Async,
}

impl WalSyncMode {
    pub(crate) fn to_durability_mode(self) -> DurabilityMode {
        match self {
            WalSyncMode::Sync => DurabilityMode::Sync,
            WalSyncMode::Group => DurabilityMode::Group,
            WalSyncMode::Async => DurabilityMode::Async,
        }
    }
}

/// Configuration for [`crate::Catalog::open`] (§6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `pages.db`, `wal/`, `oplog.bin`, `catalog.json`.
    pub data_dir: PathBuf,
    /// Page size in bytes; fixed for the lifetime of the data directory.
    pub page_size: usize,
    /// Buffer pool capacity, in frames.
    pub buffer_pool_frames: usize,
    /// WAL fsync discipline.
    pub wal_sync_mode: WalSyncMode,
    /// Whether committed mutations are journaled to the oplog for change
    /// streams. Disabling saves an append per mutation when no
    /// subscriber will ever attach.
    pub enable_oplog: bool,
    /// Default idle timeout for server-side cursors.
    pub cursor_default_timeout: Duration,
    /// How long a lock acquisition waits before giving up with
    /// `Timeout`, backstopping the wait-for-graph deadlock detector.
    pub lock_wait_timeout: Duration,
}

impl Config {
    /// Config rooted at `data_dir`, otherwise using the documented
    /// defaults: 4 KiB pages, 1024 buffer frames, group-commit WAL, oplog
    /// on, 10 minute cursor timeout, 5 second lock wait.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            page_size: lauradb_storage::DEFAULT_PAGE_SIZE,
            buffer_pool_frames: 1024,
            wal_sync_mode: WalSyncMode::Group,
            enable_oplog: true,
            cursor_default_timeout: Duration::from_secs(600),
            lock_wait_timeout: Duration::from_secs(5),
        }
    }
}
